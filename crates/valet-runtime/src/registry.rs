use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::context::ToolContext;
use valet_core::{Result, Tool, ToolCall, ToolResult};

/// A named, schema-described capability invocable by the model.
#[async_trait]
pub trait ToolHandler: Send + Sync {
    /// The immutable definition advertised to the model.
    fn definition(&self) -> Tool;

    /// Whether this specific call needs the approval gate. May depend on the
    /// input (write target outside the sandbox root) or the context (scope
    /// prefixes of a plugin-triggered run). Defaults to gating everything
    /// that is not read-only.
    fn requires_approval(&self, input: &serde_json::Value, ctx: &ToolContext) -> bool {
        let _ = (input, ctx);
        !self.definition().read_only
    }

    /// Execute one call. Errors are captured by the caller as error-tagged
    /// tool results; they never terminate the loop.
    async fn execute(&self, call: &ToolCall, ctx: &ToolContext) -> Result<ToolResult>;
}

/// Maps tool name → handler. Constructed explicitly at process start and
/// passed by reference into each loop, so tests get isolated registries.
#[derive(Default)]
pub struct ToolRegistry {
    handlers: RwLock<HashMap<String, Arc<dyn ToolHandler>>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, handler: Arc<dyn ToolHandler>) {
        let name = handler.definition().name;
        self.handlers.write().insert(name, handler);
    }

    pub fn unregister(&self, name: &str) -> bool {
        self.handlers.write().remove(name).is_some()
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn ToolHandler>> {
        self.handlers.read().get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Definitions of every registered tool, sorted by name for a stable
    /// prompt layout.
    pub fn definitions(&self) -> Vec<Tool> {
        let handlers = self.handlers.read();
        let mut defs: Vec<Tool> = handlers.values().map(|h| h.definition()).collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }

    /// A new registry exposing only the named tools, sharing the same
    /// handlers. Used to scope sub-agents to their capability profile.
    pub fn subset(&self, allowed: &[String]) -> ToolRegistry {
        let handlers = self.handlers.read();
        let filtered = allowed
            .iter()
            .filter_map(|name| {
                handlers
                    .get(name)
                    .map(|h| (name.clone(), Arc::clone(h)))
            })
            .collect();
        ToolRegistry {
            handlers: RwLock::new(filtered),
        }
    }
}
