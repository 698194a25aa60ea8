use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};

use super::handler::ToolHandler;
use super::remote::RemoteToolInvoker;
use crate::error::PersistError;
use crate::openapi::RemoteOperation;
use crate::types::ToolSchema;

/// How a registered tool gets executed.
#[derive(Clone)]
pub enum ToolSource {
    Local(Arc<dyn ToolHandler>),
    Remote {
        invoker: Arc<RemoteToolInvoker>,
        path: String,
    },
}

impl ToolSource {
    pub fn is_local(&self) -> bool {
        matches!(self, ToolSource::Local(_))
    }
}

/// A tool definition: schema for the model + how to run it.
pub struct RegisteredTool {
    pub schema: ToolSchema,
    pub source: ToolSource,
}

/// One namespace over local handlers and remote operations.
///
/// Name collisions are resolved in favour of local tools: a remote tool never
/// replaces a local one, while a local tool replaces a remote one. Between two
/// tools of the same kind the later registration wins. Collisions are logged.
pub struct ToolRegistry {
    tools: Vec<RegisteredTool>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self { tools: Vec::new() }
    }

    /// Register a local tool.
    pub fn add(self, schema: ToolSchema, handler: impl ToolHandler + 'static) -> Self {
        self.add_shared(schema, Arc::new(handler))
    }

    pub fn add_shared(mut self, schema: ToolSchema, handler: Arc<dyn ToolHandler>) -> Self {
        self.insert(RegisteredTool {
            schema,
            source: ToolSource::Local(handler),
        });
        self
    }

    /// Register a remote tool. Without an explicit path, the path is derived
    /// from the tool name (see [`derive_path`]).
    pub fn add_remote(
        mut self,
        schema: ToolSchema,
        invoker: Arc<RemoteToolInvoker>,
        path: Option<String>,
    ) -> Self {
        let path = path.unwrap_or_else(|| derive_path(&schema.name));
        self.insert(RegisteredTool {
            schema,
            source: ToolSource::Remote { invoker, path },
        });
        self
    }

    /// Register every operation translated from a tool server's OpenAPI document.
    pub fn with_remote_operations(
        self,
        invoker: Arc<RemoteToolInvoker>,
        operations: Vec<RemoteOperation>,
    ) -> Self {
        operations.into_iter().fold(self, |reg, op| {
            reg.add_remote(op.schema, invoker.clone(), Some(op.path))
        })
    }

    /// Pair externally supplied schemas with handlers of the same name.
    /// Anything left without a partner is skipped.
    pub fn with_local_definitions(
        self,
        schemas: Vec<ToolSchema>,
        mut handlers: HashMap<String, Arc<dyn ToolHandler>>,
    ) -> Self {
        let mut reg = self;
        for schema in schemas {
            match handlers.remove(&schema.name) {
                Some(handler) => reg = reg.add_shared(schema, handler),
                None => warn!(tool = %schema.name, "tool definition has no handler, skipping"),
            }
        }
        for name in handlers.keys() {
            warn!(tool = %name, "tool handler has no definition, skipping");
        }
        reg
    }

    fn insert(&mut self, tool: RegisteredTool) {
        let name = tool.schema.name.clone();
        match self.tools.iter().position(|t| t.schema.name == name) {
            None => self.tools.push(tool),
            Some(i) if self.tools[i].source.is_local() && !tool.source.is_local() => {
                warn!(tool = %name, "remote tool hidden by local tool of the same name");
            }
            Some(i) => {
                warn!(tool = %name, "tool registered twice, keeping the later one");
                self.tools[i] = tool;
            }
        }
    }

    /// Look up how a tool runs. `None` means no such tool.
    pub fn resolve(&self, name: &str) -> Option<&ToolSource> {
        self.tools
            .iter()
            .find(|t| t.schema.name == name)
            .map(|t| &t.source)
    }

    /// All tool schemas for the model request, in registration order.
    pub fn schemas(&self) -> Vec<ToolSchema> {
        self.tools.iter().map(|t| t.schema.clone()).collect()
    }

    pub fn schema(&self, name: &str) -> Option<&ToolSchema> {
        self.tools
            .iter()
            .find(|t| t.schema.name == name)
            .map(|t| &t.schema)
    }

    /// Run a tool. Failures, including unknown names, come back as text for
    /// the model rather than as errors.
    pub async fn execute(&self, name: &str, input: &Value) -> String {
        match self.resolve(name) {
            Some(ToolSource::Local(handler)) => {
                debug!(tool = name, "running local tool");
                match handler.call(input).await {
                    Ok(out) => out,
                    Err(e) => format!("Error executing tool: {e}"),
                }
            }
            Some(ToolSource::Remote { invoker, path }) => invoker.invoke(path, input).await,
            None => {
                warn!(tool = name, "model requested unknown tool");
                format!("unknown tool: {name}")
            }
        }
    }

    pub fn tool_names(&self) -> Vec<&str> {
        self.tools.iter().map(|t| t.schema.name.as_str()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// HTTP path for a tool server operation id: the server decorates paths as
/// `tool_<path>_post`, so strip the marker and the verb suffix.
pub fn derive_path(name: &str) -> String {
    let bare = name.strip_prefix("tool_").unwrap_or(name);
    let bare = bare.strip_suffix("_post").unwrap_or(bare);
    format!("/{bare}")
}

#[derive(Deserialize)]
#[serde(untagged)]
enum DefinitionEntry {
    Function { function: ToolSchema },
    Bare(ToolSchema),
}

/// Read a JSON file of tool definitions, either bare schemas or
/// function-calling wrappers (`{"type": "function", "function": {...}}`).
pub async fn read_definitions(path: impl AsRef<Path>) -> Result<Vec<ToolSchema>, PersistError> {
    let path = path.as_ref();
    let json = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| PersistError::from_io(path, e))?;
    let entries: Vec<DefinitionEntry> =
        serde_json::from_str(&json).map_err(|e| PersistError::Encoding {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
    Ok(entries
        .into_iter()
        .map(|entry| match entry {
            DefinitionEntry::Function { function } => function,
            DefinitionEntry::Bare(schema) => schema,
        })
        .collect())
}
