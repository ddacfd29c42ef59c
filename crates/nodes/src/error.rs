//! Node-level error type.

use thiserror::Error;

/// Errors returned by a node's `execute` method or while resolving its type.
///
/// An `Err` from `execute` is the equivalent of an uncaught exception inside
/// the node: the engine records it on that node's `NodeExecution` and halts
/// the branch. It never aborts the engine itself.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum NodeError {
    /// The node's declared type label did not match any known node type.
    #[error("unknown node type: '{0}'")]
    UnknownNodeType(String),

    /// The node's configuration could not be interpreted.
    #[error("invalid node config: {0}")]
    InvalidConfig(String),

    /// The node failed while doing its work.
    #[error("node failed: {0}")]
    Failed(String),
}
