//! The `NodeExecutor` trait: the contract every node type must fulfil.

use async_trait::async_trait;
use serde_json::Value;

use crate::{ExecutionContext, NodeError, NodeExecutionResult, NodeType};

/// Per node-type behaviour.
///
/// Implementations are registered once at startup and shared across every
/// run, so they must not keep per-execution state of their own; anything a
/// run needs lives in the [`ExecutionContext`].
#[async_trait]
pub trait NodeExecutor: Send + Sync {
    /// The node type this executor handles.
    fn node_type(&self) -> NodeType;

    /// Human-readable name, used in registry diagnostics.
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }

    /// Execute node `node_id` with its definition `config`.
    ///
    /// Returning `Err` is treated like an unexpected crash of the node: the
    /// engine records it as a failed node execution and halts the branch.
    async fn execute(
        &self,
        node_id: &str,
        config: &Value,
        ctx: &mut ExecutionContext,
    ) -> Result<NodeExecutionResult, NodeError>;
}
