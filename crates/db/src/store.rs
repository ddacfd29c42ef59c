//! The durable-store capability the engine depends on.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::{DbError, Execution, ExecutionWaitState, NodeExecution, WorkflowRecord};

/// CRUD for executions, node executions and wait states.
///
/// Updates of versioned records (`Execution`, `ExecutionWaitState`) succeed
/// only when the stored version equals the caller's copy; on success the
/// caller's `version` is bumped to match the stored row, on mismatch
/// [`DbError::ConcurrentModification`] is returned and nothing is written.
#[async_trait]
pub trait ExecutionStore: Send + Sync {
    // workflows
    async fn save_workflow(&self, workflow: &WorkflowRecord) -> Result<(), DbError>;
    async fn get_workflow(&self, id: Uuid) -> Result<Option<WorkflowRecord>, DbError>;

    // executions
    async fn insert_execution(&self, execution: &Execution) -> Result<(), DbError>;
    async fn get_execution(&self, id: Uuid) -> Result<Option<Execution>, DbError>;
    async fn update_execution(&self, execution: &mut Execution) -> Result<(), DbError>;

    // node executions
    async fn insert_node_execution(&self, record: &NodeExecution) -> Result<(), DbError>;
    async fn update_node_execution(&self, record: &NodeExecution) -> Result<(), DbError>;
    /// All node executions of one run, oldest first.
    async fn list_node_executions(&self, execution_id: Uuid)
        -> Result<Vec<NodeExecution>, DbError>;

    // wait states
    async fn insert_wait_state(&self, wait_state: &ExecutionWaitState) -> Result<(), DbError>;
    async fn get_wait_state(
        &self,
        execution_id: Uuid,
        node_id: &str,
    ) -> Result<Option<ExecutionWaitState>, DbError>;
    /// The wait state still in `waiting` status for this correlation id.
    async fn find_waiting_wait_state(
        &self,
        execution_id: Uuid,
        correlation_id: &str,
    ) -> Result<Option<ExecutionWaitState>, DbError>;
    async fn update_wait_state(&self, wait_state: &mut ExecutionWaitState) -> Result<(), DbError>;
    /// Wait states still `waiting` whose `expires_at` is at or before `now`.
    async fn list_expired_wait_states(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<ExecutionWaitState>, DbError>;
}
