//! MCP transport implementations.
//!
//! A transport is a bidirectional message channel. Outgoing messages go
//! through [`Transport::send`]; everything the server emits (responses,
//! notifications, server requests, errors, close) is delivered on the single
//! event channel returned by [`Transport::start`].

mod event_stream;
mod sse;
mod stdio;
mod streamable;

pub use event_stream::{SseDecoder, SseEvent};
pub use sse::SseTransport;
pub use stdio::StdioTransport;
pub use streamable::StreamableHttpTransport;

use crate::config::{HttpMode, ServerConfig, TransportKind, TransportType};
use crate::error::{McpError, McpResult};
use crate::oauth::OAuthProvider;
use crate::protocol::JsonRpcMessage;
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use url::Url;

/// Something a transport observed on its inbound side.
#[derive(Debug)]
pub enum TransportEvent {
    /// A decoded JSON-RPC message.
    Message(JsonRpcMessage),
    /// A non-fatal error (bad frame, failed background POST, ...).
    Error(McpError),
    /// The channel is gone; no further events follow.
    Closed,
}

/// Receiving half of a transport's event channel.
pub type TransportEvents = mpsc::UnboundedReceiver<TransportEvent>;

/// Transport trait for MCP communication.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open the channel. Returns the event receiver; may only be called once.
    async fn start(&self) -> McpResult<TransportEvents>;

    /// Send one message.
    async fn send(&self, message: &JsonRpcMessage) -> McpResult<()>;

    /// Close the channel.
    async fn close(&self) -> McpResult<()>;

    /// Transport kind, for diagnostics.
    fn kind(&self) -> TransportKind;

    /// Complete an OAuth authorization with the code returned to the redirect URL.
    async fn finish_auth(&self, _code: &str) -> McpResult<()> {
        Err(McpError::Unsupported(format!(
            "{} transport does not support authentication",
            self.kind()
        )))
    }
}

/// Builds transports for the connection manager.
#[async_trait]
pub trait TransportFactory: Send + Sync {
    /// Build (but do not start) a transport for `server`.
    ///
    /// `mode` is the HTTP dialect to use; it is ignored for other kinds.
    async fn create(
        &self,
        server: &str,
        config: &ServerConfig,
        mode: HttpMode,
        oauth: Option<Arc<OAuthProvider>>,
    ) -> McpResult<Arc<dyn Transport>>;
}

/// Production factory.
#[derive(Debug, Clone)]
pub struct DefaultTransportFactory {
    /// Per-request timeout for HTTP transports.
    pub request_timeout: Duration,
}

impl Default for DefaultTransportFactory {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(60),
        }
    }
}

#[async_trait]
impl TransportFactory for DefaultTransportFactory {
    async fn create(
        &self,
        server: &str,
        config: &ServerConfig,
        mode: HttpMode,
        oauth: Option<Arc<OAuthProvider>>,
    ) -> McpResult<Arc<dyn Transport>> {
        let request_timeout = config
            .timeout
            .map(Duration::from_millis)
            .unwrap_or(self.request_timeout);
        create_transport(server, config, mode, oauth, request_timeout)
    }
}

/// Resolve the transport kind of a server entry.
///
/// Explicit type wins; otherwise a command means stdio and a url means HTTP.
/// Never defaults silently.
pub fn infer_transport_type(server: &str, config: &ServerConfig) -> McpResult<TransportKind> {
    if let Some(explicit) = config.transport {
        return Ok(match explicit {
            TransportType::Stdio => TransportKind::Stdio,
            TransportType::Http | TransportType::Sse => TransportKind::Http,
            TransportType::Custom => TransportKind::Custom,
        });
    }
    if config.command.is_some() {
        return Ok(TransportKind::Stdio);
    }
    if config.url.is_some() {
        return Ok(TransportKind::Http);
    }
    Err(McpError::connection(
        server,
        "cannot infer transport type: no type, command, or url configured",
    ))
}

/// Build a transport for `server` from its configuration.
///
/// All failures surface as `McpError::Connection` carrying the server key.
pub fn create_transport(
    server: &str,
    config: &ServerConfig,
    mode: HttpMode,
    oauth: Option<Arc<OAuthProvider>>,
    request_timeout: Duration,
) -> McpResult<Arc<dyn Transport>> {
    let build = || -> McpResult<Arc<dyn Transport>> {
        match infer_transport_type(server, config)? {
            TransportKind::Stdio => {
                let command = config
                    .command
                    .as_deref()
                    .ok_or_else(|| McpError::connection(server, "stdio transport requires a command"))?;
                let env = substitute_map(&config.env, env_lookup);
                Ok(Arc::new(StdioTransport::new(
                    server,
                    command,
                    &config.args,
                    env,
                    config.cwd.clone(),
                )))
            }
            TransportKind::Http => {
                let raw = config
                    .url
                    .as_deref()
                    .ok_or_else(|| McpError::connection(server, "http transport requires a url"))?;
                let url = validate_http_url(raw)?;
                let headers = substitute_map(&config.headers, env_lookup);
                match mode {
                    HttpMode::StreamableHttp => Ok(Arc::new(StreamableHttpTransport::new(
                        server,
                        url,
                        headers,
                        oauth,
                        request_timeout,
                    )?)),
                    HttpMode::Sse => Ok(Arc::new(SseTransport::new(
                        server,
                        url,
                        headers,
                        oauth,
                        request_timeout,
                    )?)),
                }
            }
            TransportKind::Custom => {
                let plugin = config.plugin_path.as_ref().ok_or_else(|| {
                    McpError::connection(server, "custom transport requires a pluginPath")
                })?;
                Err(McpError::Unsupported(format!(
                    "custom transport plugins are not supported ({})",
                    plugin.display()
                )))
            }
        }
    };

    build().map_err(|e| McpError::connection_from(server, "Failed to create transport", e))
}

static PLACEHOLDER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("valid placeholder regex"));

fn env_lookup(name: &str) -> Option<String> {
    std::env::var(name).ok()
}

/// Replace `${VAR}` placeholders using `lookup`; unknown variables become empty.
pub fn substitute_placeholders(value: &str, lookup: impl Fn(&str) -> Option<String>) -> String {
    PLACEHOLDER
        .replace_all(value, |caps: &regex::Captures<'_>| {
            lookup(&caps[1]).unwrap_or_default()
        })
        .into_owned()
}

/// Apply [`substitute_placeholders`] to every value of a map.
pub fn substitute_map(
    values: &HashMap<String, String>,
    lookup: impl Fn(&str) -> Option<String>,
) -> HashMap<String, String> {
    values
        .iter()
        .map(|(k, v)| (k.clone(), substitute_placeholders(v, &lookup)))
        .collect()
}

/// Parse an HTTP server URL, refusing plaintext to anything but loopback.
pub fn validate_http_url(raw: &str) -> McpResult<Url> {
    let url = Url::parse(raw).map_err(|e| McpError::transport(format!("invalid url {raw}: {e}")))?;
    match url.scheme() {
        "https" => Ok(url),
        "http" if is_loopback(&url) => Ok(url),
        "http" => Err(McpError::transport(format!(
            "refusing plaintext http to non-loopback host {}; use https",
            url.host_str().unwrap_or_default()
        ))),
        other => Err(McpError::transport(format!("unsupported url scheme: {other}"))),
    }
}

fn is_loopback(url: &Url) -> bool {
    match url.host() {
        Some(url::Host::Domain(domain)) => domain.eq_ignore_ascii_case("localhost"),
        Some(url::Host::Ipv4(ip)) => IpAddr::V4(ip).is_loopback(),
        Some(url::Host::Ipv6(ip)) => IpAddr::V6(ip).is_loopback(),
        None => false,
    }
}

/// Total timeout for one HTTP exchange carrying `message`.
///
/// Requests have none: the session bounds them with the caller's deadline,
/// which may be longer than the transport default.
pub(crate) fn exchange_timeout(message: &JsonRpcMessage, default: Duration) -> Option<Duration> {
    (!message.is_request()).then_some(default)
}

/// Classify a non-success HTTP response into an `McpError::Http`.
pub(crate) async fn http_error(response: reqwest::Response) -> McpError {
    let status = response.status();
    let text = response.text().await.unwrap_or_default();
    let message = if text.is_empty() {
        status.canonical_reason().unwrap_or("request failed").to_string()
    } else {
        text
    };
    McpError::Http {
        status: status.as_u16(),
        message,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;

    fn lookup(name: &str) -> Option<String> {
        match name {
            "TOKEN" => Some("secret".to_string()),
            "HOME" => Some("/home/me".to_string()),
            _ => None,
        }
    }

    #[test]
    fn test_infer_explicit_type_wins() {
        let config = ServerConfig::stdio("cmd", Vec::<String>::new()).with_transport(TransportType::Sse);
        assert_eq!(infer_transport_type("a", &config).unwrap(), TransportKind::Http);
    }

    #[test]
    fn test_infer_from_command_and_url() {
        let stdio = ServerConfig::stdio("echo-server", Vec::<String>::new());
        assert_eq!(infer_transport_type("a", &stdio).unwrap(), TransportKind::Stdio);

        let http = ServerConfig::http("https://x/mcp");
        assert_eq!(infer_transport_type("a", &http).unwrap(), TransportKind::Http);
    }

    #[test]
    fn test_infer_fails_without_hints() {
        let err = infer_transport_type("empty", &ServerConfig::default()).unwrap_err();
        assert!(matches!(err, McpError::Connection { ref server, .. } if server == "empty"));
        assert!(err.to_string().contains("cannot infer transport type"));
    }

    #[test]
    fn test_substitute_placeholders() {
        assert_eq!(substitute_placeholders("Bearer ${TOKEN}", lookup), "Bearer secret");
        assert_eq!(substitute_placeholders("${HOME}/x:${MISSING}", lookup), "/home/me/x:");
        assert_eq!(substitute_placeholders("plain $TOKEN", lookup), "plain $TOKEN");
    }

    #[test]
    fn test_substitute_map() {
        let mut env = HashMap::new();
        env.insert("AUTH".to_string(), "${TOKEN}".to_string());
        let out = substitute_map(&env, lookup);
        assert_eq!(out["AUTH"], "secret");
    }

    #[test]
    fn test_validate_http_url() {
        assert!(validate_http_url("https://example.com/mcp").is_ok());
        assert!(validate_http_url("http://localhost:8080/mcp").is_ok());
        assert!(validate_http_url("http://127.0.0.1:1/mcp").is_ok());
        assert!(validate_http_url("http://[::1]:3000/mcp").is_ok());
        assert!(validate_http_url("http://example.com/mcp").is_err());
        assert!(validate_http_url("ftp://example.com").is_err());
        assert!(validate_http_url("not a url").is_err());
    }

    #[test]
    fn test_create_stdio_requires_command() {
        let config = ServerConfig::default().with_transport(TransportType::Stdio);
        let err = create_transport("s", &config, HttpMode::default(), None, Duration::from_secs(1))
            .err()
            .unwrap();
        assert!(matches!(err, McpError::Connection { .. }));
        assert!(err.to_string().contains("requires a command"));
    }

    #[test]
    fn test_create_http_requires_url() {
        let config = ServerConfig::default().with_transport(TransportType::Http);
        let err = create_transport("h", &config, HttpMode::default(), None, Duration::from_secs(1))
            .err()
            .unwrap();
        assert!(err.to_string().contains("requires a url"));
    }

    #[test]
    fn test_create_http_rejects_plaintext() {
        let config = ServerConfig::http("http://example.com/mcp");
        let err = create_transport("h", &config, HttpMode::default(), None, Duration::from_secs(1))
            .err()
            .unwrap();
        assert!(matches!(err, McpError::Connection { ref server, .. } if server == "h"));
        assert!(err.to_string().contains("plaintext"));
    }

    #[test]
    fn test_exchange_timeout_spares_requests() {
        let default = Duration::from_secs(1);
        let request: JsonRpcMessage = crate::protocol::JsonRpcRequest::new(1, "tools/call", None).into();
        let note: JsonRpcMessage =
            crate::protocol::JsonRpcNotification::new("notifications/initialized", None).into();
        assert_eq!(exchange_timeout(&request, default), None);
        assert_eq!(exchange_timeout(&note, default), Some(default));
    }

    #[test]
    fn test_create_custom_is_unsupported() {
        let mut config = ServerConfig::default().with_transport(TransportType::Custom);
        config.plugin_path = Some("/opt/plugin.so".into());
        let err = create_transport("c", &config, HttpMode::default(), None, Duration::from_secs(1))
            .err()
            .unwrap();
        assert!(matches!(err, McpError::Connection { .. }));
        assert!(matches!(err.cause(), Some(McpError::Unsupported(_))));

        let config = ServerConfig::default().with_transport(TransportType::Custom);
        let err = create_transport("c", &config, HttpMode::default(), None, Duration::from_secs(1))
            .err()
            .unwrap();
        assert!(err.to_string().contains("pluginPath"));
    }

    #[tokio::test]
    async fn test_create_each_kind() {
        let stdio = ServerConfig::stdio("cat", Vec::<String>::new());
        let t = create_transport("s", &stdio, HttpMode::default(), None, Duration::from_secs(1)).unwrap();
        assert_eq!(t.kind(), TransportKind::Stdio);

        let http = ServerConfig::http("https://example.com/mcp");
        let t = create_transport("h", &http, HttpMode::StreamableHttp, None, Duration::from_secs(1))
            .unwrap();
        assert_eq!(t.kind(), TransportKind::Http);
        let t = create_transport("h", &http, HttpMode::Sse, None, Duration::from_secs(1)).unwrap();
        assert_eq!(t.kind(), TransportKind::Http);
    }

    #[tokio::test]
    async fn test_stdio_has_no_auth_support() {
        let stdio = ServerConfig::stdio("cat", Vec::<String>::new());
        let t = create_transport("s", &stdio, HttpMode::default(), None, Duration::from_secs(1)).unwrap();
        let err = t.finish_auth("code").await.unwrap_err();
        assert!(matches!(err, McpError::Unsupported(_)));
    }
}
