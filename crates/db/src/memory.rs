//! In-memory `ExecutionStore`, used by tests and single-process setups.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::{
    DbError, Execution, ExecutionStore, ExecutionWaitState, NodeExecution, WaitStateStatus,
    WorkflowRecord,
};

#[derive(Default)]
struct Tables {
    workflows: HashMap<Uuid, WorkflowRecord>,
    executions: HashMap<Uuid, Execution>,
    /// Insertion order doubles as start order.
    node_executions: Vec<NodeExecution>,
    wait_states: Vec<ExecutionWaitState>,
}

/// Mirrors the Postgres store's semantics, version checks included.
#[derive(Default)]
pub struct MemoryExecutionStore {
    tables: Mutex<Tables>,
}

impl MemoryExecutionStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn tables(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl ExecutionStore for MemoryExecutionStore {
    async fn save_workflow(&self, workflow: &WorkflowRecord) -> Result<(), DbError> {
        self.tables().workflows.insert(workflow.id, workflow.clone());
        Ok(())
    }

    async fn get_workflow(&self, id: Uuid) -> Result<Option<WorkflowRecord>, DbError> {
        Ok(self.tables().workflows.get(&id).cloned())
    }

    async fn insert_execution(&self, execution: &Execution) -> Result<(), DbError> {
        let mut tables = self.tables();
        if tables.executions.contains_key(&execution.id) {
            return Err(DbError::conflict("execution", execution.id));
        }
        tables.executions.insert(execution.id, execution.clone());
        Ok(())
    }

    async fn get_execution(&self, id: Uuid) -> Result<Option<Execution>, DbError> {
        Ok(self.tables().executions.get(&id).cloned())
    }

    async fn update_execution(&self, execution: &mut Execution) -> Result<(), DbError> {
        let mut tables = self.tables();
        let stored = tables
            .executions
            .get_mut(&execution.id)
            .ok_or(DbError::NotFound)?;
        if stored.version != execution.version {
            return Err(DbError::conflict("execution", execution.id));
        }
        execution.version += 1;
        *stored = execution.clone();
        Ok(())
    }

    async fn insert_node_execution(&self, record: &NodeExecution) -> Result<(), DbError> {
        self.tables().node_executions.push(record.clone());
        Ok(())
    }

    async fn update_node_execution(&self, record: &NodeExecution) -> Result<(), DbError> {
        let mut tables = self.tables();
        let stored = tables
            .node_executions
            .iter_mut()
            .find(|r| r.id == record.id)
            .ok_or(DbError::NotFound)?;
        *stored = record.clone();
        Ok(())
    }

    async fn list_node_executions(
        &self,
        execution_id: Uuid,
    ) -> Result<Vec<NodeExecution>, DbError> {
        Ok(self
            .tables()
            .node_executions
            .iter()
            .filter(|r| r.execution_id == execution_id)
            .cloned()
            .collect())
    }

    async fn insert_wait_state(&self, wait_state: &ExecutionWaitState) -> Result<(), DbError> {
        let mut tables = self.tables();
        let duplicate = tables.wait_states.iter().any(|w| {
            w.execution_id == wait_state.execution_id && w.node_id == wait_state.node_id
        });
        if duplicate {
            return Err(DbError::conflict("execution_wait_state", wait_state.id));
        }
        tables.wait_states.push(wait_state.clone());
        Ok(())
    }

    async fn get_wait_state(
        &self,
        execution_id: Uuid,
        node_id: &str,
    ) -> Result<Option<ExecutionWaitState>, DbError> {
        Ok(self
            .tables()
            .wait_states
            .iter()
            .find(|w| w.execution_id == execution_id && w.node_id == node_id)
            .cloned())
    }

    async fn find_waiting_wait_state(
        &self,
        execution_id: Uuid,
        correlation_id: &str,
    ) -> Result<Option<ExecutionWaitState>, DbError> {
        Ok(self
            .tables()
            .wait_states
            .iter()
            .find(|w| {
                w.execution_id == execution_id
                    && w.correlation_id == correlation_id
                    && w.status == WaitStateStatus::Waiting
            })
            .cloned())
    }

    async fn update_wait_state(&self, wait_state: &mut ExecutionWaitState) -> Result<(), DbError> {
        let mut tables = self.tables();
        let stored = tables
            .wait_states
            .iter_mut()
            .find(|w| w.id == wait_state.id)
            .ok_or(DbError::NotFound)?;
        if stored.version != wait_state.version {
            return Err(DbError::conflict("execution_wait_state", wait_state.id));
        }
        wait_state.version += 1;
        *stored = wait_state.clone();
        Ok(())
    }

    async fn list_expired_wait_states(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<ExecutionWaitState>, DbError> {
        Ok(self
            .tables()
            .wait_states
            .iter()
            .filter(|w| w.status == WaitStateStatus::Waiting && w.is_expired(now))
            .cloned()
            .collect())
    }
}
