//! Pass-through trigger executor.

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use crate::{ExecutionContext, NodeError, NodeExecutionResult, NodeExecutor, NodeType};

/// Emits the trigger payload seeded for its node id as its output, so later
/// nodes can read it through `_nodeOutputs.<triggerNodeId>`.
#[derive(Debug, Default, Clone)]
pub struct TriggerNode;

#[async_trait]
impl NodeExecutor for TriggerNode {
    fn node_type(&self) -> NodeType {
        NodeType::Trigger
    }

    async fn execute(
        &self,
        node_id: &str,
        _config: &Value,
        ctx: &mut ExecutionContext,
    ) -> Result<NodeExecutionResult, NodeError> {
        let data = ctx.get_trigger_data_for_node(node_id);
        debug!("trigger node '{}' emitting {} field(s)", node_id, data.len());
        Ok(NodeExecutionResult::success(data))
    }
}
