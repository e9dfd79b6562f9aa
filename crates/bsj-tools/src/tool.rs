use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;

use bsj_llm::ToolDefinition;

/// A capability that a model may call during a stage invocation.
///
/// Connectivity and authentication problems must surface as
/// [`bsj_types::BsjError::ToolUnavailable`]; bad arguments from the model
/// surface as [`bsj_types::BsjError::ToolError`] and are fed back to it.
#[async_trait]
pub trait Tool: Send + Sync {
    fn definition(&self) -> ToolDefinition;

    /// Cheap reachability check, run once when a run starts.
    async fn probe(&self) -> bsj_types::Result<()> {
        Ok(())
    }

    async fn execute(&self, arguments: serde_json::Value) -> bsj_types::Result<String>;
}

/// Registry that holds named tools and provides lookup.
#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: BTreeMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tool: impl Tool + 'static) {
        self.register_arc(Arc::new(tool));
    }

    pub fn register_arc(&mut self, tool: Arc<dyn Tool>) {
        let def = tool.definition();
        tracing::debug!(tool = %def.name, "Tool registered");
        self.tools.insert(def.name, tool);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        self.tools.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
