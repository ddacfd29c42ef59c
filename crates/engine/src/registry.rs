//! Node type → executor lookup table.
//!
//! Built once at startup and handed to the engine; read-only afterwards.

use std::collections::HashMap;
use std::sync::Arc;

use nodes::{NodeExecutor, NodeType};
use tracing::{debug, warn};

#[derive(Default, Clone)]
pub struct ExecutorRegistry {
    executors: HashMap<NodeType, Arc<dyn NodeExecutor>>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register every executor, then let the generic `trigger` executor cover
    /// each trigger variant that has no dedicated implementation.
    pub fn from_executors<I>(executors: I) -> Self
    where
        I: IntoIterator<Item = Arc<dyn NodeExecutor>>,
    {
        let mut registry = Self::new();
        for executor in executors {
            registry.register(executor);
        }

        if let Some(generic) = registry.executors.get(&NodeType::Trigger).cloned() {
            for variant in NodeType::TRIGGER_VARIANTS {
                registry
                    .executors
                    .entry(variant)
                    .or_insert_with(|| Arc::clone(&generic));
            }
        }
        registry
    }

    /// Register under the executor's own node type.
    pub fn register(&mut self, executor: Arc<dyn NodeExecutor>) {
        let node_type = executor.node_type();
        self.register_for(node_type, executor);
    }

    /// Register under `node_type`. A later registration replaces an earlier one.
    pub fn register_for(&mut self, node_type: NodeType, executor: Arc<dyn NodeExecutor>) {
        let name = executor.name().to_string();
        if let Some(previous) = self.executors.insert(node_type, executor) {
            warn!(
                "executor '{}' replaces '{}' for node type '{}'",
                name,
                previous.name(),
                node_type
            );
        } else {
            debug!("registered executor '{}' for node type '{}'", name, node_type);
        }
    }

    pub fn lookup(&self, node_type: NodeType) -> Option<Arc<dyn NodeExecutor>> {
        self.executors.get(&node_type).cloned()
    }

    /// Resolve a raw definition label (case-insensitive, `-` for `_`).
    /// Unknown labels resolve to `None`.
    pub fn lookup_label(&self, label: &str) -> Option<Arc<dyn NodeExecutor>> {
        label.parse::<NodeType>().ok().and_then(|t| self.lookup(t))
    }

    pub fn len(&self) -> usize {
        self.executors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.executors.is_empty()
    }
}
