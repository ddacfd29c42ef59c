//! Postgres-backed `ExecutionStore`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::repository::{executions, node_executions, wait_states, workflows};
use crate::{
    DbError, DbPool, Execution, ExecutionStore, ExecutionWaitState, NodeExecution, WorkflowRecord,
};

/// Thin adapter from the store capability onto the repository functions.
#[derive(Clone)]
pub struct PgExecutionStore {
    pool: DbPool,
}

impl PgExecutionStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }
}

#[async_trait]
impl ExecutionStore for PgExecutionStore {
    async fn save_workflow(&self, workflow: &WorkflowRecord) -> Result<(), DbError> {
        workflows::upsert_workflow(&self.pool, workflow).await
    }

    async fn get_workflow(&self, id: Uuid) -> Result<Option<WorkflowRecord>, DbError> {
        workflows::get_workflow(&self.pool, id).await
    }

    async fn insert_execution(&self, execution: &Execution) -> Result<(), DbError> {
        executions::insert_execution(&self.pool, execution).await
    }

    async fn get_execution(&self, id: Uuid) -> Result<Option<Execution>, DbError> {
        executions::get_execution(&self.pool, id).await
    }

    async fn update_execution(&self, execution: &mut Execution) -> Result<(), DbError> {
        executions::update_execution(&self.pool, execution).await
    }

    async fn insert_node_execution(&self, record: &NodeExecution) -> Result<(), DbError> {
        node_executions::insert_node_execution(&self.pool, record).await
    }

    async fn update_node_execution(&self, record: &NodeExecution) -> Result<(), DbError> {
        node_executions::update_node_execution(&self.pool, record).await
    }

    async fn list_node_executions(
        &self,
        execution_id: Uuid,
    ) -> Result<Vec<NodeExecution>, DbError> {
        node_executions::list_node_executions(&self.pool, execution_id).await
    }

    async fn insert_wait_state(&self, wait_state: &ExecutionWaitState) -> Result<(), DbError> {
        wait_states::insert_wait_state(&self.pool, wait_state).await
    }

    async fn get_wait_state(
        &self,
        execution_id: Uuid,
        node_id: &str,
    ) -> Result<Option<ExecutionWaitState>, DbError> {
        wait_states::get_wait_state(&self.pool, execution_id, node_id).await
    }

    async fn find_waiting_wait_state(
        &self,
        execution_id: Uuid,
        correlation_id: &str,
    ) -> Result<Option<ExecutionWaitState>, DbError> {
        wait_states::find_waiting_wait_state(&self.pool, execution_id, correlation_id).await
    }

    async fn update_wait_state(&self, wait_state: &mut ExecutionWaitState) -> Result<(), DbError> {
        wait_states::update_wait_state(&self.pool, wait_state).await
    }

    async fn list_expired_wait_states(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<ExecutionWaitState>, DbError> {
        wait_states::list_expired_wait_states(&self.pool, now).await
    }
}
