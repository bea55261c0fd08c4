//! Model Context Protocol (MCP) client adapter.
//!
//! Connects to external tool servers, discovers the tools they expose and
//! calls them on behalf of a host application.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐     ┌──────────────┐     ┌───────────┐     ┌─────────────┐
//! │ ServerConfig │────▶│  Transport   │────▶│ McpSession│────▶│ MCP Servers │
//! └──────────────┘     │  (+ OAuth)   │     └───────────┘     │   (tools)   │
//!                      └──────────────┘           ▲           └─────────────┘
//!                                                 │
//!                      ┌──────────────┐     ┌───────────┐
//!                      │ ToolCatalog  │◀────│ McpClient │
//!                      └──────────────┘     └───────────┘
//! ```
//!
//! # Supported Transports
//!
//! - **stdio**: Local servers via newline-delimited JSON on stdin/stdout
//! - **Streamable HTTP**: One POST per message, JSON or event-stream replies
//! - **SSE**: Legacy event-stream dialect, used as a fallback
//! - **OAuth**: PKCE authorization for remote servers
//!
//! # Example
//!
//! ```no_run
//! use std::collections::HashMap;
//! use std::sync::Arc;
//! use toolbridge_mcp::{ExecuteOptions, McpClient, ServerConfig};
//!
//! # async fn example() -> toolbridge_mcp::McpResult<()> {
//! let configs = HashMap::from([(
//!     "filesystem".to_string(),
//!     ServerConfig::stdio("npx", vec!["-y", "@modelcontextprotocol/server-filesystem", "."]),
//! )]);
//!
//! let client = Arc::new(McpClient::new(configs));
//! client.connect_to_server("filesystem").await?;
//!
//! for tool in client.get_tool_definitions("filesystem").await?.iter() {
//!     println!("{}: {}", tool.name, tool.description);
//! }
//!
//! let result = client
//!     .execute_tool(
//!         "filesystem",
//!         "read_file",
//!         serde_json::json!({ "path": "Cargo.toml" }),
//!         false,
//!         ExecuteOptions::default(),
//!     )
//!     .await?;
//! println!("{}", result.text());
//!
//! client.disconnect_all().await;
//! # Ok(())
//! # }
//! ```

pub mod catalog;
mod client;
pub mod config;
mod error;
pub mod oauth;
pub mod protocol;
pub mod retry;
pub mod schema;
pub mod session;
pub mod transport;

#[cfg(test)]
mod testing;

pub use catalog::{ToolCatalog, ToolDefinition, DEFAULT_MANIFEST_TTL};
pub use client::{Capability, ExecuteOptions, McpClient, McpClientOptions};
pub use config::{HttpMode, McpConfigFile, OAuthSettings, ServerConfig, ServerState, TransportType};
pub use error::{McpError, McpResult};
pub use oauth::{
    InMemoryOAuthStorage, OAuthProvider, OAuthStorage, OAuthTokens, OAUTH_CALLBACK_PATH,
    OAUTH_CALLBACK_PORT,
};
pub use protocol::{McpTool, ToolCallResult, ToolContent};
pub use retry::{ErrorClass, RetryPolicy};
pub use transport::{DefaultTransportFactory, Transport, TransportFactory};
