//! Engine-level error types.

use thiserror::Error;
use uuid::Uuid;

/// Errors produced by the workflow engine (validation + execution).
///
/// Node-level failures never show up here: they are recorded on the node's
/// `NodeExecution`. What remains is definition validation and infrastructure.
#[derive(Debug, Error)]
pub enum EngineError {
    // ------ Validation errors ------

    /// Two or more nodes share the same ID.
    #[error("duplicate node ID: '{0}'")]
    DuplicateNodeId(String),

    /// An edge references a node ID that doesn't exist in the workflow.
    #[error("edge references unknown node '{node_id}' ({side} side)")]
    UnknownNodeReference {
        node_id: String,
        side: &'static str,
    },

    /// Topological sort detected a cycle.
    #[error("workflow graph contains a cycle")]
    CycleDetected,

    #[error("workflow must have exactly one trigger node, found {0}")]
    TriggerCount(usize),

    /// The definition JSON does not have the nodes/edges shape.
    #[error("malformed workflow definition: {0}")]
    MalformedDefinition(String),

    #[error("workflow {0} has no definition")]
    MissingDefinition(Uuid),

    #[error("unknown timeout policy: '{0}'")]
    UnknownTimeoutPolicy(String),

    // ------ Execution errors ------

    #[error("execution {0} not found")]
    ExecutionNotFound(Uuid),

    /// Another instance holds the execution lock.
    #[error("execution {0} is locked by another instance")]
    LockUnavailable(Uuid),

    /// Persistence error from the db crate.
    #[error("database error: {0}")]
    Database(#[from] db::DbError),

    /// Fast-store error from the cache crate.
    #[error("cache error: {0}")]
    Cache(#[from] cache::CacheError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl EngineError {
    /// `true` for an optimistic-concurrency failure from the durable store.
    pub fn is_conflict(&self) -> bool {
        matches!(self, EngineError::Database(e) if e.is_conflict())
    }
}
