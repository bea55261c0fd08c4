//! MCP error types.
//!
//! The four outward-facing categories (`Connection`, `ToolCall`,
//! `Authentication`, `Timeout`) carry the server key and an optional boxed
//! cause. The remaining variants are the discriminated low-level failures
//! those categories wrap; retry classification inspects them structurally.

use crate::protocol::METHOD_NOT_FOUND;
use thiserror::Error;

/// Result type for MCP operations.
pub type McpResult<T> = Result<T, McpError>;

/// Errors that can occur during MCP operations.
#[derive(Debug, Error)]
pub enum McpError {
    /// Transport, handshake, or configuration failure for a server.
    #[error("Connection error [{server}]: {message}")]
    Connection {
        server: String,
        message: String,
        #[source]
        source: Option<Box<McpError>>,
    },

    /// Terminal failure of a tool invocation (after any retries).
    #[error("Tool call failed [{server}/{tool}]: {message}")]
    ToolCall {
        server: String,
        tool: String,
        message: String,
        #[source]
        source: Option<Box<McpError>>,
    },

    /// The server rejected our credentials or requires authorization.
    #[error("Authentication failed [{server}]: {message}")]
    Authentication {
        server: String,
        message: String,
        #[source]
        source: Option<Box<McpError>>,
    },

    /// A request exceeded its time budget or was cancelled locally.
    #[error("Timeout [{server}]: {message}")]
    Timeout {
        server: String,
        tool: Option<String>,
        message: String,
    },

    /// Streaming tool execution was requested.
    #[error("Streaming execution is not supported [{server}/{tool}]")]
    StreamingUnsupported { server: String, tool: String },

    /// JSON-RPC error object returned by the server.
    #[error("JSON-RPC error {code}: {message}")]
    Rpc {
        code: i64,
        message: String,
        data: Option<serde_json::Value>,
    },

    /// Non-success HTTP status.
    #[error("HTTP {status}: {message}")]
    Http { status: u16, message: String },

    /// Transport-level failure (broken pipe, stream closed, ...).
    #[error("Transport error: {0}")]
    Transport(String),

    /// Protocol error.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Feature or transport kind that is not available.
    #[error("Unsupported: {0}")]
    Unsupported(String),

    /// Tool arguments failed schema validation.
    #[error("Invalid arguments: {0}")]
    InvalidArguments(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP client error.
    #[error("HTTP request error: {0}")]
    Request(#[from] reqwest::Error),
}

impl McpError {
    /// Create a connection error without a cause.
    pub fn connection(server: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Connection {
            server: server.into(),
            message: message.into(),
            source: None,
        }
    }

    /// Wrap `cause` as a connection error for `server`.
    ///
    /// Authentication and connection errors for the same server pass through
    /// unchanged so the category is not buried.
    pub fn connection_from(
        server: impl Into<String>,
        message: impl Into<String>,
        cause: McpError,
    ) -> Self {
        let server = server.into();
        let same_server = matches!(
            &cause,
            Self::Connection { server: s, .. } | Self::Authentication { server: s, .. } if *s == server
        );
        if same_server {
            return cause;
        }
        Self::Connection {
            message: format!("{}: {}", message.into(), cause),
            server,
            source: Some(Box::new(cause)),
        }
    }

    /// Wrap `cause` as the terminal failure of a tool call.
    pub fn tool_call(server: impl Into<String>, tool: impl Into<String>, cause: McpError) -> Self {
        Self::ToolCall {
            server: server.into(),
            tool: tool.into(),
            message: cause.to_string(),
            source: Some(Box::new(cause)),
        }
    }

    /// Create an authentication error.
    pub fn authentication(server: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Authentication {
            server: server.into(),
            message: message.into(),
            source: None,
        }
    }

    /// Create a timeout error.
    pub fn timeout(
        server: impl Into<String>,
        tool: Option<&str>,
        message: impl Into<String>,
    ) -> Self {
        Self::Timeout {
            server: server.into(),
            tool: tool.map(str::to_string),
            message: message.into(),
        }
    }

    /// Create a transport error.
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport(message.into())
    }

    /// Create a protocol error.
    pub fn protocol_error(message: impl Into<String>) -> Self {
        Self::Protocol(message.into())
    }

    /// Boxed cause, when this error wraps one.
    pub fn cause(&self) -> Option<&McpError> {
        match self {
            Self::Connection { source, .. }
            | Self::ToolCall { source, .. }
            | Self::Authentication { source, .. } => source.as_deref(),
            _ => None,
        }
    }

    /// This error followed by every wrapped cause.
    pub fn chain(&self) -> impl Iterator<Item = &McpError> {
        std::iter::successors(Some(self), |e| e.cause())
    }

    /// Server key carried by this error, if any.
    pub fn server(&self) -> Option<&str> {
        match self {
            Self::Connection { server, .. }
            | Self::ToolCall { server, .. }
            | Self::Authentication { server, .. }
            | Self::Timeout { server, .. }
            | Self::StreamingUnsupported { server, .. } => Some(server),
            _ => None,
        }
    }

    /// First HTTP status found in the cause chain.
    pub fn http_status(&self) -> Option<u16> {
        self.chain().find_map(|e| match e {
            Self::Http { status, .. } => Some(*status),
            Self::Request(err) => err.status().map(|s| s.as_u16()),
            _ => None,
        })
    }

    /// First JSON-RPC error code found in the cause chain.
    pub fn rpc_code(&self) -> Option<i64> {
        self.chain().find_map(|e| match e {
            Self::Rpc { code, .. } => Some(*code),
            _ => None,
        })
    }

    /// Whether this error, or anything it wraps, is an authentication failure.
    pub fn is_authentication(&self) -> bool {
        self.chain()
            .any(|e| matches!(e, Self::Authentication { .. }))
            || self.http_status() == Some(401)
    }

    /// Whether this error, or anything it wraps, is a timeout.
    pub fn is_timeout(&self) -> bool {
        self.chain().any(|e| match e {
            Self::Timeout { .. } => true,
            Self::Request(err) => err.is_timeout(),
            _ => false,
        })
    }

    /// Whether the server reported that it does not know the requested method.
    pub fn is_method_not_found(&self) -> bool {
        if self.rpc_code() == Some(METHOD_NOT_FOUND) {
            return true;
        }
        // Opaque errors from third-party servers only carry text.
        self.chain().any(|e| {
            let text = e.to_string().to_lowercase();
            text.contains("method not found") || text.contains("-32601")
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[test]
    fn test_error_display() {
        let errors = vec![
            (
                McpError::connection("fs", "configuration not found"),
                "Connection error [fs]: configuration not found",
            ),
            (
                McpError::authentication("remote", "token expired"),
                "Authentication failed [remote]: token expired",
            ),
            (
                McpError::timeout("fs", Some("read_file"), "request timed out after 5s"),
                "Timeout [fs]: request timed out after 5s",
            ),
            (
                McpError::Http {
                    status: 404,
                    message: "Not Found".to_string(),
                },
                "HTTP 404: Not Found",
            ),
            (
                McpError::StreamingUnsupported {
                    server: "fs".to_string(),
                    tool: "read".to_string(),
                },
                "Streaming execution is not supported [fs/read]",
            ),
            (
                McpError::protocol_error("invalid"),
                "Protocol error: invalid",
            ),
        ];

        for (error, expected) in errors {
            assert_eq!(error.to_string(), expected);
        }
    }

    #[test]
    fn test_tool_call_wraps_cause() {
        let err = McpError::tool_call(
            "fs",
            "read_file",
            McpError::authentication("fs", "401 Unauthorized"),
        );
        assert!(matches!(err, McpError::ToolCall { .. }));
        assert!(err.is_authentication());
        assert!(err.source().is_some());
        assert_eq!(err.server(), Some("fs"));
    }

    #[test]
    fn test_http_status_found_through_chain() {
        let err = McpError::connection_from(
            "x",
            "Failed to start transport",
            McpError::Http {
                status: 405,
                message: "Method Not Allowed".to_string(),
            },
        );
        assert_eq!(err.http_status(), Some(405));
        assert!(!err.is_timeout());
    }

    #[test]
    fn test_connection_from_keeps_same_server_category() {
        let inner = McpError::authentication("x", "authorization required");
        let err = McpError::connection_from("x", "connect failed", inner);
        assert!(matches!(err, McpError::Authentication { .. }));
    }

    #[test]
    fn test_method_not_found_detection() {
        let err = McpError::Rpc {
            code: METHOD_NOT_FOUND,
            message: "Method not found".to_string(),
            data: None,
        };
        assert!(err.is_method_not_found());

        let opaque = McpError::transport("MCP error -32601: Method not found");
        assert!(opaque.is_method_not_found());

        let other = McpError::transport("connection reset");
        assert!(!other.is_method_not_found());
    }

    #[test]
    fn test_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let mcp_err: McpError = io_err.into();
        assert!(mcp_err.to_string().contains("IO error"));
    }

    #[test]
    fn test_error_from_json() {
        let json_err = serde_json::from_str::<serde_json::Value>("invalid").unwrap_err();
        let mcp_err: McpError = json_err.into();
        assert!(mcp_err.to_string().contains("JSON error"));
    }
}
