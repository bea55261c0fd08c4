//! Tool catalog: manifest cache, tool naming and bound tool definitions.

use crate::error::{McpError, McpResult};
use crate::protocol::{McpTool, ToolCallResult};
use crate::schema::{ObjectSchema, ParamKind, ParamSchema};
use futures::future::BoxFuture;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use tracing::debug;

/// How long a fetched tool list is served before it is fetched again.
pub const DEFAULT_MANIFEST_TTL: Duration = Duration::from_secs(15 * 60);

/// `{server}.{tool}`.
pub fn namespaced_name(server: &str, tool: &str) -> String {
    format!("{server}.{tool}")
}

/// Replace every character outside `[A-Za-z0-9_-]` with `_`.
pub fn sanitize_name(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Name exposed to consumers for `tool` on `server`.
pub fn tool_name(server: &str, tool: &str) -> String {
    sanitize_name(&namespaced_name(server, tool))
}

/// Parse a `tools/list` result: a bare array or an object with a `tools` array.
pub fn parse_tools_list(result: Value) -> McpResult<Vec<McpTool>> {
    let tools = match result {
        Value::Array(items) => items,
        Value::Object(mut obj) => match obj.remove("tools") {
            Some(Value::Array(items)) => items,
            _ => {
                return Err(McpError::protocol_error(
                    "tools/list result has no tools array",
                ))
            }
        },
        other => {
            return Err(McpError::protocol_error(format!(
                "unexpected tools/list result: {other}"
            )))
        }
    };

    tools
        .into_iter()
        .map(|tool| {
            serde_json::from_value(tool)
                .map_err(|e| McpError::protocol_error(format!("invalid tool descriptor: {e}")))
        })
        .collect()
}

/// Executes a bound tool call with already-validated arguments.
pub type ToolInvoker =
    Arc<dyn Fn(Value) -> BoxFuture<'static, McpResult<ToolCallResult>> + Send + Sync>;

/// A server tool ready for a tool-calling layer.
#[derive(Clone)]
pub struct ToolDefinition {
    /// Sanitized namespaced name, e.g. `fs_read_file`.
    pub name: String,
    /// Namespaced name before sanitizing, e.g. `fs.read_file`.
    pub namespaced_name: String,
    pub description: String,
    pub schema: ObjectSchema,
    pub server_key: String,
    /// Name the server knows the tool by.
    pub original_name: String,
    invoker: ToolInvoker,
}

impl std::fmt::Debug for ToolDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolDefinition")
            .field("name", &self.name)
            .field("server_key", &self.server_key)
            .field("original_name", &self.original_name)
            .field("schema", &self.schema)
            .finish_non_exhaustive()
    }
}

impl ToolDefinition {
    /// JSON Schema for the tool's parameters.
    pub fn parameters_schema(&self) -> Value {
        self.schema.to_json_schema()
    }

    /// Validate `args` against the schema and call the tool.
    pub async fn invoke(&self, args: Value) -> McpResult<ToolCallResult> {
        self.schema.validate(&args)?;
        (self.invoker)(args).await
    }
}

struct ManifestEntry {
    tools: Arc<Vec<McpTool>>,
    expires_at: Instant,
}

/// Per-server caches of tool manifests and derived definitions.
pub struct ToolCatalog {
    ttl: Duration,
    manifests: RwLock<HashMap<String, ManifestEntry>>,
    definitions: RwLock<HashMap<String, Arc<Vec<ToolDefinition>>>>,
    /// Bumped on every invalidation so in-flight fetches do not repopulate.
    generations: RwLock<HashMap<String, u64>>,
    patches: RwLock<HashMap<(String, String), Vec<(String, ParamSchema)>>>,
}

impl Default for ToolCatalog {
    fn default() -> Self {
        Self::new(DEFAULT_MANIFEST_TTL)
    }
}

impl ToolCatalog {
    /// Create a catalog with the built-in schema patches.
    pub fn new(ttl: Duration) -> Self {
        let catalog = Self {
            ttl,
            manifests: RwLock::new(HashMap::new()),
            definitions: RwLock::new(HashMap::new()),
            generations: RwLock::new(HashMap::new()),
            patches: RwLock::new(HashMap::new()),
        };
        for server in ["filesystem", "fs"] {
            for tool in [
                "read_file",
                "read_text_file",
                "write_file",
                "edit_file",
                "list_directory",
                "create_directory",
                "get_file_info",
            ] {
                catalog.register_patch(
                    server,
                    tool,
                    "path",
                    ParamSchema::new(ParamKind::String).with_description("Path of the file or directory"),
                );
            }
        }
        catalog
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Require `param` on `(server, tool)` when the advertised schema omits it.
    pub fn register_patch(&self, server: &str, tool: &str, param: &str, schema: ParamSchema) {
        if let Ok(mut patches) = self.patches.write() {
            patches
                .entry((server.to_string(), tool.to_string()))
                .or_default()
                .push((param.to_string(), schema));
        }
    }

    /// Current invalidation generation of `server`.
    pub fn generation(&self, server: &str) -> u64 {
        self.generations
            .read()
            .ok()
            .and_then(|g| g.get(server).copied())
            .unwrap_or(0)
    }

    /// Unexpired manifest for `server`.
    pub fn cached_tools(&self, server: &str) -> Option<Arc<Vec<McpTool>>> {
        let manifests = self.manifests.read().ok()?;
        let entry = manifests.get(server)?;
        if Instant::now() >= entry.expires_at {
            return None;
        }
        Some(entry.tools.clone())
    }

    /// Cache a manifest fetched while `generation` was current.
    ///
    /// Nothing is cached if the server was invalidated since.
    pub fn store_tools(&self, server: &str, tools: Vec<McpTool>, generation: u64) -> Arc<Vec<McpTool>> {
        let tools = Arc::new(tools);
        if self.generation(server) != generation {
            debug!(server = %server, "Discarding tool list fetched before invalidation");
            return tools;
        }
        if let Ok(mut manifests) = self.manifests.write() {
            manifests.insert(
                server.to_string(),
                ManifestEntry {
                    tools: tools.clone(),
                    expires_at: Instant::now() + self.ttl,
                },
            );
        }
        if let Ok(mut definitions) = self.definitions.write() {
            definitions.remove(server);
        }
        tools
    }

    /// Definitions derived from the current manifest, if still cached.
    pub fn cached_definitions(&self, server: &str) -> Option<Arc<Vec<ToolDefinition>>> {
        self.cached_tools(server)?;
        self.definitions.read().ok()?.get(server).cloned()
    }

    pub fn store_definitions(
        &self,
        server: &str,
        definitions: Vec<ToolDefinition>,
        generation: u64,
    ) -> Arc<Vec<ToolDefinition>> {
        let definitions = Arc::new(definitions);
        if self.generation(server) == generation {
            if let Ok(mut cache) = self.definitions.write() {
                cache.insert(server.to_string(), definitions.clone());
            }
        }
        definitions
    }

    /// Drop the cached manifest and definitions of `server`.
    pub fn invalidate(&self, server: &str) {
        if let Ok(mut generations) = self.generations.write() {
            *generations.entry(server.to_string()).or_default() += 1;
        }
        if let Ok(mut manifests) = self.manifests.write() {
            manifests.remove(server);
        }
        if let Ok(mut definitions) = self.definitions.write() {
            definitions.remove(server);
        }
        debug!(server = %server, "Invalidated tool cache");
    }

    /// Normalized schema for `tool`, with any registered patches applied.
    pub fn schema_for(&self, server: &str, tool: &McpTool) -> ObjectSchema {
        let mut schema = ObjectSchema::normalize(tool.input_schema.as_ref());
        let key = (server.to_string(), tool.name.clone());
        if let Some(patches) = self.patches.read().ok().and_then(|p| p.get(&key).cloned()) {
            for (param, param_schema) in patches {
                if schema.require(&param, param_schema) {
                    debug!(server = %server, tool = %tool.name, param = %param, "Patched tool schema");
                }
            }
        }
        schema
    }

    /// Build the definition of `tool` bound to `invoker`.
    pub fn definition(&self, server: &str, tool: &McpTool, invoker: ToolInvoker) -> ToolDefinition {
        ToolDefinition {
            name: tool_name(server, &tool.name),
            namespaced_name: namespaced_name(server, &tool.name),
            description: tool
                .description
                .clone()
                .unwrap_or_else(|| format!("MCP tool {} from {server}", tool.name)),
            schema: self.schema_for(server, tool),
            server_key: server.to_string(),
            original_name: tool.name.clone(),
            invoker,
        }
    }
}
