//! `db` crate — durable execution state store.
//!
//! Holds the records the engine persists (executions, node executions, wait
//! states, workflow definitions), the [`ExecutionStore`] capability the engine
//! talks to, and two implementations of it: Postgres for production and an
//! in-memory store for tests.

pub mod error;
pub mod memory;
pub mod models;
pub mod pool;
pub mod postgres;
pub mod repository;
pub mod store;

pub use error::DbError;
pub use memory::MemoryExecutionStore;
pub use models::{
    AggregationStrategy, Execution, ExecutionStatus, ExecutionWaitState, NodeExecution,
    NodeExecutionStatus, WaitStateStatus, WorkflowRecord,
};
pub use pool::DbPool;
pub use postgres::PgExecutionStore;
pub use store::ExecutionStore;
