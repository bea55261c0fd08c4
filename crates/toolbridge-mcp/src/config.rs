//! MCP server configuration.
//!
//! Configuration is owned by the host; this module only describes its shape
//! and loads it from JSON. Entries are immutable once handed to the client.

use crate::error::{McpError, McpResult};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

/// Explicit transport type for a server entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TransportType {
    /// Local subprocess speaking newline-delimited JSON over stdio.
    Stdio,
    /// Remote HTTP endpoint; dialect chosen by `mode`.
    #[serde(alias = "streamable-http", alias = "remote")]
    Http,
    /// Remote HTTP endpoint pinned to the event-stream dialect.
    Sse,
    /// Plugin-provided transport.
    Custom,
}

/// Resolved transport kind after inference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Stdio,
    Http,
    Custom,
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Stdio => "stdio",
            Self::Http => "http",
            Self::Custom => "custom",
        })
    }
}

/// Wire dialect for HTTP servers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HttpMode {
    /// Streamable HTTP: one POST per message, responses as JSON or event stream.
    #[default]
    #[serde(alias = "http", alias = "streamable")]
    StreamableHttp,
    /// Legacy HTTP+SSE: long-lived GET event stream plus POST endpoint.
    Sse,
}

impl HttpMode {
    /// The other dialect.
    pub fn alternate(self) -> Self {
        match self {
            Self::StreamableHttp => Self::Sse,
            Self::Sse => Self::StreamableHttp,
        }
    }
}

impl std::fmt::Display for HttpMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::StreamableHttp => "streamable-http",
            Self::Sse => "sse",
        })
    }
}

/// OAuth settings for a remote server.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct OAuthSettings {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub redirect_url: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_secret: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
}

/// Authentication block of a server entry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub oauth: Option<OAuthSettings>,
}

/// Configuration for one MCP server.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerConfig {
    /// Explicit transport type. Inferred from `command`/`url` when absent.
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub transport: Option<TransportType>,

    /// Command for subprocess servers.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,

    /// Arguments for subprocess servers.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,

    /// Extra environment for subprocess servers. Values may contain `${VAR}`.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub env: HashMap<String, String>,

    /// Working directory for subprocess servers.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cwd: Option<PathBuf>,

    /// URL for HTTP servers.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,

    /// HTTP dialect. Defaults to streamable HTTP with event-stream fallback.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mode: Option<HttpMode>,

    /// Headers for HTTP servers. Values may contain `${VAR}`.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub headers: HashMap<String, String>,

    /// Authentication settings.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth: Option<AuthConfig>,

    /// Plugin path for custom transports.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plugin_path: Option<PathBuf>,

    /// Disabled entries are excluded from the client's working set.
    #[serde(default)]
    pub disabled: bool,

    /// Tool names the host may run without asking the user.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub auto_approve: Vec<String>,

    /// Per-request timeout in milliseconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
}

impl ServerConfig {
    /// Create a subprocess server configuration.
    pub fn stdio<S: Into<String>>(command: impl Into<String>, args: Vec<S>) -> Self {
        Self {
            command: Some(command.into()),
            args: args.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }

    /// Create an HTTP server configuration.
    pub fn http(url: impl Into<String>) -> Self {
        Self {
            url: Some(url.into()),
            ..Default::default()
        }
    }

    /// Set an explicit transport type.
    pub fn with_transport(mut self, transport: TransportType) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Set the HTTP dialect.
    pub fn with_mode(mut self, mode: HttpMode) -> Self {
        self.mode = Some(mode);
        self
    }

    /// Add a header (for HTTP transports).
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    /// Add an environment variable (for subprocess transports).
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Attach OAuth settings.
    pub fn with_oauth(mut self, oauth: OAuthSettings) -> Self {
        self.auth = Some(AuthConfig { oauth: Some(oauth) });
        self
    }

    /// Disable the server.
    pub fn disabled(mut self) -> Self {
        self.disabled = true;
        self
    }

    /// OAuth settings, if the entry declares an auth block.
    pub fn oauth(&self) -> Option<&OAuthSettings> {
        self.auth.as_ref().and_then(|a| a.oauth.as_ref())
    }

    /// Effective HTTP dialect.
    pub fn http_mode(&self) -> HttpMode {
        if self.transport == Some(TransportType::Sse) {
            return HttpMode::Sse;
        }
        self.mode.unwrap_or_default()
    }

    /// Whether the dialect was left to the client (fallback allowed).
    pub fn allows_fallback(&self) -> bool {
        self.http_mode() == HttpMode::StreamableHttp
    }

    /// Whether the host may run `tool` without confirmation.
    pub fn is_auto_approved(&self, tool: &str) -> bool {
        self.auto_approve.iter().any(|t| t == tool || t == "*")
    }
}

/// State of an MCP server.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ServerState {
    /// Server is not connected.
    #[default]
    Disconnected,
    /// A connect attempt is in flight.
    Connecting,
    /// Server is connected and ready.
    Connected,
}

/// A configuration document: `{ "mcpServers": { "<key>": ServerConfig } }`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct McpConfigFile {
    #[serde(default)]
    pub mcp_servers: BTreeMap<String, ServerConfig>,
}

impl McpConfigFile {
    /// Parse a configuration document.
    pub fn from_json(text: &str) -> McpResult<Self> {
        Ok(serde_json::from_str(text)?)
    }

    /// Load a configuration document from disk.
    pub fn load(path: impl AsRef<Path>) -> McpResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            McpError::Io(std::io::Error::new(
                e.kind(),
                format!("{}: {}", path.display(), e),
            ))
        })?;
        Self::from_json(&text)
    }

    /// Entries that are not disabled.
    pub fn enabled_servers(&self) -> HashMap<String, ServerConfig> {
        self.mcp_servers
            .iter()
            .filter(|(_, cfg)| !cfg.disabled)
            .map(|(key, cfg)| (key.clone(), cfg.clone()))
            .collect()
    }
}
