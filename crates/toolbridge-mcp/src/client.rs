//! MCP client implementation.
//!
//! [`McpClient`] owns one session per connected server. It performs the
//! handshake (falling back from streamable HTTP to SSE when a server rejects
//! the dialect), serves the tool catalog and executes tool calls with retry.

use crate::catalog::{parse_tools_list, ToolCatalog, ToolDefinition, ToolInvoker};
use crate::config::{HttpMode, ServerConfig, ServerState, TransportKind};
use crate::error::{McpError, McpResult};
use crate::oauth::{InMemoryOAuthStorage, OAuthProvider, OAuthStorage};
use crate::protocol::{
    methods, CallToolParams, ClientInfo, GetPromptResult, InitializeResult, McpPrompt,
    McpResource, McpResourceTemplate, McpTool, ReadResourceResult, ToolCallResult,
};
use crate::retry::{classify, sleep_with_cancel, ErrorClass, RetryPolicy};
use crate::session::{McpSession, ToolsChangedHook};
use crate::transport::{
    infer_transport_type, validate_http_url, DefaultTransportFactory, Transport, TransportFactory,
};
use futures::future::join_all;
use futures::FutureExt;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Adapter-level settings.
#[derive(Clone)]
pub struct McpClientOptions {
    /// Timeout for a single request, unless the server entry sets its own.
    pub request_timeout: Duration,
    /// How long a fetched tool list stays fresh.
    pub manifest_ttl: Duration,
    pub retry: RetryPolicy,
    /// Identity sent in the `initialize` request.
    pub client_info: ClientInfo,
    /// Open authorization URLs in a browser instead of only logging them.
    pub interactive: bool,
    pub oauth_storage: Arc<dyn OAuthStorage>,
}

impl Default for McpClientOptions {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(60),
            manifest_ttl: crate::catalog::DEFAULT_MANIFEST_TTL,
            retry: RetryPolicy::default(),
            client_info: ClientInfo::default(),
            interactive: true,
            oauth_storage: Arc::new(InMemoryOAuthStorage::new()),
        }
    }
}

impl std::fmt::Debug for McpClientOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("McpClientOptions")
            .field("request_timeout", &self.request_timeout)
            .field("manifest_ttl", &self.manifest_ttl)
            .field("retry", &self.retry)
            .field("client_info", &self.client_info)
            .field("interactive", &self.interactive)
            .finish_non_exhaustive()
    }
}

/// Per-call execution options.
#[derive(Debug, Clone, Default)]
pub struct ExecuteOptions {
    /// Overrides the request timeout for this call.
    pub timeout: Option<Duration>,
    /// `Some(false)` disables retry entirely, `Some(true)` also retries timeouts.
    pub retry: Option<bool>,
    /// Cancels the call (and any pending backoff) when triggered.
    pub cancel: Option<CancellationToken>,
}

/// Result of a fetch against an optional server capability.
#[derive(Debug, Clone)]
pub enum Capability<T> {
    Supported(T),
    /// The server does not implement the method.
    NotSupported,
}

impl<T> Capability<T> {
    pub fn is_supported(&self) -> bool {
        matches!(self, Self::Supported(_))
    }

    pub fn into_option(self) -> Option<T> {
        match self {
            Self::Supported(value) => Some(value),
            Self::NotSupported => None,
        }
    }
}

/// An established server connection.
struct Connection {
    config: ServerConfig,
    session: Arc<McpSession>,
    info: InitializeResult,
}

/// MCP client for managing multiple server connections.
pub struct McpClient {
    configs: HashMap<String, ServerConfig>,
    options: McpClientOptions,
    factory: Arc<dyn TransportFactory>,
    catalog: Arc<ToolCatalog>,
    /// Recorded connections; an entry exists only after a successful handshake.
    connections: RwLock<HashMap<String, Arc<Connection>>>,
    /// Serializes connect attempts per server.
    connect_gates: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    /// Transports waiting for `complete_authentication`.
    auth_transports: Mutex<HashMap<String, Arc<dyn Transport>>>,
    oauth_providers: Mutex<HashMap<String, Arc<OAuthProvider>>>,
}

impl McpClient {
    /// Create a client over `configs` with default options.
    ///
    /// Disabled entries are dropped and can never be connected.
    pub fn new(configs: HashMap<String, ServerConfig>) -> Self {
        Self::with_options(configs, McpClientOptions::default())
    }

    pub fn with_options(configs: HashMap<String, ServerConfig>, options: McpClientOptions) -> Self {
        let factory = Arc::new(DefaultTransportFactory {
            request_timeout: options.request_timeout,
        });
        Self::with_factory(configs, options, factory)
    }

    /// Create a client that builds transports with `factory`.
    pub fn with_factory(
        configs: HashMap<String, ServerConfig>,
        options: McpClientOptions,
        factory: Arc<dyn TransportFactory>,
    ) -> Self {
        let configs = configs
            .into_iter()
            .filter(|(key, config)| {
                if config.disabled {
                    debug!(server = %key, "Server is disabled, skipping");
                }
                !config.disabled
            })
            .collect();

        Self {
            configs,
            catalog: Arc::new(ToolCatalog::new(options.manifest_ttl)),
            options,
            factory,
            connections: RwLock::new(HashMap::new()),
            connect_gates: Mutex::new(HashMap::new()),
            auth_transports: Mutex::new(HashMap::new()),
            oauth_providers: Mutex::new(HashMap::new()),
        }
    }

    /// The tool catalog, e.g. to register schema patches.
    pub fn catalog(&self) -> &ToolCatalog {
        &self.catalog
    }

    /// Connect to a configured server. Does nothing if already connected.
    pub async fn connect_to_server(&self, server: &str) -> McpResult<()> {
        if self.is_connected(server).await {
            return Ok(());
        }

        let gate = self
            .connect_gates
            .lock()
            .await
            .entry(server.to_string())
            .or_default()
            .clone();
        let _guard = gate.lock().await;

        // Another caller may have finished while we waited.
        if self.is_connected(server).await {
            return Ok(());
        }
        self.drop_stale_connection(server).await;

        let config = self
            .configs
            .get(server)
            .cloned()
            .ok_or_else(|| McpError::connection(server, "configuration not found"))?;

        info!(server = %server, "Connecting to MCP server");
        let kind = infer_transport_type(server, &config)?;

        let (session, info) = match kind {
            TransportKind::Http => {
                let oauth = self.oauth_provider(server, &config).await?;
                self.connect_http(server, &config, oauth).await?
            }
            TransportKind::Stdio | TransportKind::Custom => {
                self.open_session(server, &config, config.http_mode(), None)
                    .await?
            }
        };

        info!(
            server = %server,
            remote = %info.server_info.name,
            transport = %session.transport().kind(),
            "Connected to MCP server"
        );
        self.auth_transports.lock().await.remove(server);
        self.connections.write().await.insert(
            server.to_string(),
            Arc::new(Connection {
                config,
                session,
                info,
            }),
        );
        Ok(())
    }

    async fn connect_http(
        &self,
        server: &str,
        config: &ServerConfig,
        oauth: Option<Arc<OAuthProvider>>,
    ) -> McpResult<(Arc<McpSession>, InitializeResult)> {
        let mode = config.http_mode();
        match self.open_session(server, config, mode, oauth.clone()).await {
            Err(e) if config.allows_fallback() && is_dialect_rejection(&e) => {
                warn!(
                    server = %server,
                    error = %e,
                    fallback = %mode.alternate(),
                    "Server rejected {mode}, falling back"
                );
                self.open_session(server, config, mode.alternate(), oauth)
                    .await
            }
            result => result,
        }
    }

    /// Build, start and initialize one transport.
    async fn open_session(
        &self,
        server: &str,
        config: &ServerConfig,
        mode: HttpMode,
        oauth: Option<Arc<OAuthProvider>>,
    ) -> McpResult<(Arc<McpSession>, InitializeResult)> {
        let transport = self
            .factory
            .create(server, config, mode, oauth.clone())
            .await?;

        let events = match transport.start().await {
            Ok(events) => events,
            Err(e) => {
                let e = self.authorize_if_needed(server, &transport, oauth, e).await;
                return Err(McpError::connection_from(server, "Failed to start transport", e));
            }
        };

        let session = McpSession::new(
            server,
            transport.clone(),
            events,
            Some(self.invalidation_hook(server)),
        );
        match session
            .initialize(self.options.client_info.clone(), self.request_timeout(config))
            .await
        {
            Ok(info) => Ok((Arc::new(session), info)),
            Err(e) => {
                if let Err(close_err) = session.close().await {
                    debug!(server = %server, error = %close_err, "Error closing failed session");
                }
                let e = self.authorize_if_needed(server, &transport, oauth, e).await;
                Err(McpError::connection_from(server, "Handshake failed", e))
            }
        }
    }

    /// On a 401 with OAuth configured, start authorization and park the transport.
    async fn authorize_if_needed(
        &self,
        server: &str,
        transport: &Arc<dyn Transport>,
        oauth: Option<Arc<OAuthProvider>>,
        error: McpError,
    ) -> McpError {
        let Some(oauth) = oauth else {
            return error;
        };
        if error.http_status() != Some(401) {
            return error;
        }

        let url = match oauth.begin_authorization().await {
            Ok(url) => url,
            Err(e) => return e,
        };
        self.auth_transports
            .lock()
            .await
            .insert(server.to_string(), transport.clone());
        info!(server = %server, "Authorization required");
        McpError::authentication(
            server,
            format!("authorization required; visit {url} and complete with the returned code"),
        )
    }

    fn invalidation_hook(&self, server: &str) -> ToolsChangedHook {
        let catalog = self.catalog.clone();
        let server = server.to_string();
        Arc::new(move || catalog.invalidate(&server))
    }

    async fn oauth_provider(
        &self,
        server: &str,
        config: &ServerConfig,
    ) -> McpResult<Option<Arc<OAuthProvider>>> {
        let Some(settings) = config.oauth() else {
            return Ok(None);
        };

        let mut providers = self.oauth_providers.lock().await;
        if let Some(provider) = providers.get(server) {
            return Ok(Some(provider.clone()));
        }

        let raw = config
            .url
            .as_deref()
            .ok_or_else(|| McpError::connection(server, "http transport requires a url"))?;
        let url = validate_http_url(raw)
            .map_err(|e| McpError::connection_from(server, "Failed to create transport", e))?;
        let provider = Arc::new(OAuthProvider::new(
            server,
            url,
            settings.clone(),
            self.options.oauth_storage.clone(),
            self.options.interactive,
        ));
        providers.insert(server.to_string(), provider.clone());
        Ok(Some(provider))
    }

    /// Finish an OAuth authorization started by `connect_to_server`.
    ///
    /// Call `connect_to_server` again afterwards to establish the session.
    pub async fn complete_authentication(&self, server: &str, code: &str) -> McpResult<()> {
        let parked = self.auth_transports.lock().await.get(server).cloned();
        let transport = match parked {
            Some(transport) => transport,
            None => self
                .connections
                .read()
                .await
                .get(server)
                .map(|c| c.session.transport().clone())
                .ok_or_else(|| {
                    McpError::connection(server, "no transport for server; start connection first")
                })?,
        };

        transport.finish_auth(code).await?;
        self.auth_transports.lock().await.remove(server);
        info!(server = %server, "Authorization completed");
        Ok(())
    }

    async fn drop_stale_connection(&self, server: &str) {
        let stale = self.connections.write().await.remove(server);
        if let Some(connection) = stale {
            debug!(server = %server, "Dropping closed connection");
            if let Err(e) = connection.session.close().await {
                debug!(server = %server, error = %e, "Error closing stale session");
            }
            self.catalog.invalidate(server);
        }
    }

    /// Disconnect a server. Does nothing if it is not connected.
    pub async fn disconnect_server(&self, server: &str) -> McpResult<()> {
        let parked = self.auth_transports.lock().await.remove(server);
        if let Some(transport) = parked {
            if let Err(e) = transport.close().await {
                debug!(server = %server, error = %e, "Error closing parked transport");
            }
        }

        let Some(connection) = self.connections.write().await.remove(server) else {
            return Ok(());
        };
        self.catalog.invalidate(server);

        connection
            .session
            .close()
            .await
            .map_err(|e| McpError::connection_from(server, "Error closing connection", e))?;
        info!(server = %server, "Disconnected from MCP server");
        Ok(())
    }

    /// Disconnect every server concurrently.
    pub async fn disconnect_all(&self) {
        let servers: Vec<String> = self.connections.read().await.keys().cloned().collect();
        let results = join_all(servers.iter().map(|s| self.disconnect_server(s))).await;
        for (server, result) in servers.iter().zip(results) {
            if let Err(e) = result {
                warn!(server = %server, error = %e, "Error disconnecting server");
            }
        }
    }

    async fn connection(&self, server: &str) -> McpResult<Arc<Connection>> {
        self.connections
            .read()
            .await
            .get(server)
            .filter(|c| c.session.is_open())
            .cloned()
            .ok_or_else(|| McpError::connection(server, "server not connected"))
    }

    fn request_timeout(&self, config: &ServerConfig) -> Duration {
        config
            .timeout
            .map(Duration::from_millis)
            .unwrap_or(self.options.request_timeout)
    }

    /// Tool descriptors advertised by `server`, served from cache when fresh.
    pub async fn list_tools(&self, server: &str) -> McpResult<Arc<Vec<McpTool>>> {
        let connection = self.connection(server).await?;
        if let Some(tools) = self.catalog.cached_tools(server) {
            return Ok(tools);
        }

        let generation = self.catalog.generation(server);
        let tools = connection
            .session
            .request(
                methods::TOOLS_LIST,
                None,
                self.request_timeout(&connection.config),
                None,
            )
            .await
            .and_then(parse_tools_list)
            .map_err(|e| McpError::connection_from(server, "Failed to list tools", e))?;

        info!(server = %server, tool_count = tools.len(), "Discovered MCP tools");
        Ok(self.catalog.store_tools(server, tools, generation))
    }

    /// Tool definitions of `server`, bound to this client.
    pub async fn get_tool_definitions(
        self: &Arc<Self>,
        server: &str,
    ) -> McpResult<Arc<Vec<ToolDefinition>>> {
        if let Some(definitions) = self.catalog.cached_definitions(server) {
            if self.is_connected(server).await {
                return Ok(definitions);
            }
        }

        let generation = self.catalog.generation(server);
        let tools = self.list_tools(server).await?;
        let mut seen = HashSet::new();
        let mut definitions = Vec::with_capacity(tools.len());
        for tool in tools.iter() {
            let definition = self
                .catalog
                .definition(server, tool, invoker(Arc::downgrade(self), server, &tool.name));
            if seen.insert(definition.name.clone()) {
                definitions.push(definition);
            } else {
                warn!(
                    server = %server,
                    tool = %tool.name,
                    name = %definition.name,
                    "Tool name collides after sanitizing, skipping"
                );
            }
        }
        Ok(self.catalog.store_definitions(server, definitions, generation))
    }

    /// Tool definitions across every connected server.
    ///
    /// Servers whose tool list cannot be fetched are skipped.
    pub async fn list_all_tools(self: &Arc<Self>) -> Vec<ToolDefinition> {
        let mut all = Vec::new();
        let mut seen = HashSet::new();
        for server in self.connected_servers().await {
            match self.get_tool_definitions(&server).await {
                Ok(definitions) => {
                    for definition in definitions.iter() {
                        if seen.insert(definition.name.clone()) {
                            all.push(definition.clone());
                        } else {
                            warn!(tool = %definition.name, server = %server, "Duplicate tool name, skipping");
                        }
                    }
                }
                Err(e) => warn!(server = %server, error = %e, "Failed to list tools"),
            }
        }
        all
    }

    /// Resolve a sanitized tool name to its definition.
    pub async fn find_tool(self: &Arc<Self>, name: &str) -> Option<ToolDefinition> {
        self.list_all_tools()
            .await
            .into_iter()
            .find(|definition| definition.name == name)
    }

    /// Call `tool` on `server`, retrying transient failures.
    ///
    /// Every failure after the call is issued is returned as
    /// [`McpError::ToolCall`] wrapping the last classified cause.
    pub async fn execute_tool(
        &self,
        server: &str,
        tool: &str,
        arguments: Value,
        streaming: bool,
        options: ExecuteOptions,
    ) -> McpResult<ToolCallResult> {
        if streaming {
            return Err(McpError::StreamingUnsupported {
                server: server.to_string(),
                tool: tool.to_string(),
            });
        }

        let connection = self.connection(server).await?;
        let timeout = options
            .timeout
            .unwrap_or_else(|| self.request_timeout(&connection.config));
        let policy = match options.retry {
            Some(false) => RetryPolicy::none(),
            _ => self.options.retry,
        };
        let retry_timeouts = options.retry == Some(true);
        let cancel = options.cancel.as_ref();

        let params = serde_json::to_value(CallToolParams {
            name: tool.to_string(),
            arguments: Some(arguments),
        })
        .map_err(|e| McpError::tool_call(server, tool, e.into()))?;

        debug!(server = %server, tool = %tool, "Calling MCP tool");
        let mut attempt = 1;
        loop {
            let outcome = connection
                .session
                .request(methods::TOOLS_CALL, Some(params.clone()), timeout, cancel)
                .await
                .and_then(|result| {
                    serde_json::from_value::<ToolCallResult>(result).map_err(|e| {
                        McpError::protocol_error(format!("Invalid tools/call result: {e}"))
                    })
                });

            let error = match outcome {
                Ok(result) => return Ok(result),
                Err(McpError::Timeout {
                    server: key,
                    tool: None,
                    message,
                }) => McpError::Timeout {
                    server: key,
                    tool: Some(tool.to_string()),
                    message,
                },
                Err(e) => e,
            };

            let class = classify(&error);
            let cancelled = cancel.is_some_and(CancellationToken::is_cancelled);
            if cancelled || !class.is_retryable(retry_timeouts) || attempt >= policy.max_attempts {
                if attempt > 1 {
                    warn!(
                        server = %server,
                        tool = %tool,
                        attempts = attempt,
                        error = %error,
                        "Tool call failed after retries"
                    );
                }
                let error = surface_class(server, tool, class, error);
                return Err(McpError::tool_call(server, tool, error));
            }

            let delay = policy.delay_for(attempt);
            debug!(
                server = %server,
                tool = %tool,
                attempt,
                delay_ms = delay.as_millis() as u64,
                class = ?class,
                error = %error,
                "Retrying tool call"
            );
            if !sleep_with_cancel(delay, cancel).await {
                let cancelled = McpError::timeout(server, Some(tool), "tool call was cancelled");
                return Err(McpError::tool_call(server, tool, cancelled));
            }
            attempt += 1;
        }
    }

    /// Request an optional capability; `None` when the server lacks the method.
    async fn probe(&self, server: &str, method: &str, params: Option<Value>) -> McpResult<Option<Value>> {
        let connection = self.connection(server).await?;
        let timeout = self.request_timeout(&connection.config);
        match connection.session.request(method, params, timeout, None).await {
            Ok(result) => Ok(Some(result)),
            Err(e) if e.is_method_not_found() => {
                debug!(server = %server, method = %method, "Method not supported by server");
                Ok(None)
            }
            Err(e) => Err(McpError::connection_from(server, format!("{method} failed"), e)),
        }
    }

    async fn probe_list<T: DeserializeOwned>(
        &self,
        server: &str,
        method: &str,
        field: &str,
    ) -> McpResult<Vec<T>> {
        match self.probe(server, method, None).await? {
            Some(result) => list_field(result, field)
                .map_err(|e| McpError::connection_from(server, format!("Invalid {method} result"), e)),
            None => Ok(Vec::new()),
        }
    }

    async fn probe_one<T: DeserializeOwned>(
        &self,
        server: &str,
        method: &str,
        params: Value,
    ) -> McpResult<Capability<T>> {
        match self.probe(server, method, Some(params)).await? {
            Some(result) => serde_json::from_value(result)
                .map(Capability::Supported)
                .map_err(|e| McpError::connection_from(server, format!("Invalid {method} result"), e.into())),
            None => Ok(Capability::NotSupported),
        }
    }

    pub async fn list_resources(&self, server: &str) -> McpResult<Vec<McpResource>> {
        self.probe_list(server, methods::RESOURCES_LIST, "resources")
            .await
    }

    pub async fn list_resource_templates(&self, server: &str) -> McpResult<Vec<McpResourceTemplate>> {
        self.probe_list(server, methods::RESOURCES_TEMPLATES_LIST, "resourceTemplates")
            .await
    }

    pub async fn read_resource(&self, server: &str, uri: &str) -> McpResult<Capability<ReadResourceResult>> {
        self.probe_one(server, methods::RESOURCES_READ, json!({ "uri": uri }))
            .await
    }

    pub async fn list_prompts(&self, server: &str) -> McpResult<Vec<McpPrompt>> {
        self.probe_list(server, methods::PROMPTS_LIST, "prompts")
            .await
    }

    pub async fn get_prompt(
        &self,
        server: &str,
        name: &str,
        arguments: HashMap<String, String>,
    ) -> McpResult<Capability<GetPromptResult>> {
        self.probe_one(
            server,
            methods::PROMPTS_GET,
            json!({ "name": name, "arguments": arguments }),
        )
        .await
    }

    /// Whether `server` has an open session.
    pub async fn is_connected(&self, server: &str) -> bool {
        self.connections
            .read()
            .await
            .get(server)
            .is_some_and(|c| c.session.is_open())
    }

    pub async fn server_state(&self, server: &str) -> ServerState {
        if self.is_connected(server).await {
            return ServerState::Connected;
        }
        let gate = self.connect_gates.lock().await.get(server).cloned();
        match gate {
            Some(gate) if gate.try_lock().is_err() => ServerState::Connecting,
            _ => ServerState::Disconnected,
        }
    }

    /// Handshake result of a connected server.
    pub async fn server_info(&self, server: &str) -> Option<InitializeResult> {
        self.connections
            .read()
            .await
            .get(server)
            .map(|c| c.info.clone())
    }

    /// Keys of servers with an open session, sorted.
    pub async fn connected_servers(&self) -> Vec<String> {
        let mut servers: Vec<String> = self
            .connections
            .read()
            .await
            .iter()
            .filter(|(_, c)| c.session.is_open())
            .map(|(key, _)| key.clone())
            .collect();
        servers.sort();
        servers
    }

    /// Keys of every enabled server entry, sorted.
    pub fn configured_servers(&self) -> Vec<String> {
        let mut servers: Vec<String> = self.configs.keys().cloned().collect();
        servers.sort();
        servers
    }

    pub fn server_config(&self, server: &str) -> Option<&ServerConfig> {
        self.configs.get(server)
    }

    /// Whether `tool` on `server` may run without confirmation.
    pub fn auto_approved(&self, server: &str, tool: &str) -> bool {
        self.configs
            .get(server)
            .is_some_and(|c| c.is_auto_approved(tool))
    }
}

/// 404 and 405 mean the server does not speak the attempted dialect.
fn is_dialect_rejection(error: &McpError) -> bool {
    matches!(error.http_status(), Some(404 | 405))
}

/// Extract a list from a result that is a bare array or wraps one in `field`.
fn list_field<T: DeserializeOwned>(result: Value, field: &str) -> McpResult<Vec<T>> {
    let items = match result {
        Value::Array(items) => Value::Array(items),
        Value::Object(mut obj) => obj.remove(field).unwrap_or(Value::Array(Vec::new())),
        other => {
            return Err(McpError::protocol_error(format!(
                "expected a list of {field}, got {other}"
            )))
        }
    };
    Ok(serde_json::from_value(items)?)
}

/// Give a failure recognised only by its text the variant of its class.
fn surface_class(server: &str, tool: &str, class: ErrorClass, error: McpError) -> McpError {
    match class {
        ErrorClass::Authentication if !error.is_authentication() => McpError::Authentication {
            server: server.to_string(),
            message: error.to_string(),
            source: Some(Box::new(error)),
        },
        ErrorClass::Timeout if !error.is_timeout() => {
            McpError::timeout(server, Some(tool), error.to_string())
        }
        _ => error,
    }
}

fn invoker(client: Weak<McpClient>, server: &str, tool: &str) -> ToolInvoker {
    let server = server.to_string();
    let tool = tool.to_string();
    Arc::new(move |arguments: Value| {
        let client = client.clone();
        let server = server.clone();
        let tool = tool.clone();
        async move {
            let client = client
                .upgrade()
                .ok_or_else(|| McpError::connection(&server, "client has been dropped"))?;
            client
                .execute_tool(&server, &tool, arguments, false, ExecuteOptions::default())
                .await
        }
        .boxed()
    })
}
