//! `engine` crate — workflow models, DAG validation, and the execution engine.

pub mod config;
pub mod dag;
pub mod error;
pub mod executor;
pub mod graph;
pub mod models;
pub mod registry;
pub mod waits;

pub use config::EngineConfig;
pub use dag::validate_dag;
pub use error::EngineError;
pub use executor::{ResumeOutcome, WorkflowEngine};
pub use graph::WorkflowGraph;
pub use models::{Edge, NodeDefinition, Workflow, WorkflowDefinition};
pub use registry::ExecutorRegistry;
pub use waits::{Delivery, TimeoutPolicy, WaitEventsNode, WaitSpec, WaitStateService};

#[cfg(test)]
mod executor_tests;
