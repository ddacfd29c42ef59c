//! `nodes` crate — the `NodeExecutor` capability and the types it exchanges
//! with the engine.
//!
//! Every node type implementation must implement [`NodeExecutor`]. The engine
//! resolves implementations through its registry and dispatches through this
//! trait object; it never knows what a concrete node does.

pub mod context;
pub mod error;
pub mod mock;
pub mod node_type;
pub mod result;
pub mod traits;
pub mod trigger;

pub use context::ExecutionContext;
pub use error::NodeError;
pub use node_type::NodeType;
pub use result::NodeExecutionResult;
pub use traits::NodeExecutor;
pub use trigger::TriggerNode;
