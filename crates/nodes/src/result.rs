//! What a node reports back to the engine.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Outcome of a single `NodeExecutor::execute` call.
///
/// - `success == false` halts the branch and records `error`.
/// - `waiting == true` (with `success == true`) suspends the whole run.
/// - `next_node_id` overrides the adjacency-derived successors.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeExecutionResult {
    pub success: bool,
    pub output: Map<String, Value>,
    pub error: Option<String>,
    pub next_node_id: Option<String>,
    pub waiting: bool,
}

impl NodeExecutionResult {
    pub fn success(output: Map<String, Value>) -> Self {
        Self {
            success: true,
            output,
            ..Self::default()
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            ..Self::default()
        }
    }

    pub fn waiting(output: Map<String, Value>) -> Self {
        Self {
            success: true,
            output,
            waiting: true,
            ..Self::default()
        }
    }

    /// Follow only `node_id` after this node.
    pub fn with_next(mut self, node_id: impl Into<String>) -> Self {
        self.next_node_id = Some(node_id.into());
        self
    }

    /// The `waitStateId` carried in the output, if any.
    pub fn wait_state_id(&self) -> Option<&str> {
        self.output.get("waitStateId").and_then(Value::as_str)
    }
}
