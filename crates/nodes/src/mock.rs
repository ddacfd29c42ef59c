//! `MockNode`: a scriptable test double for `NodeExecutor`.
//!
//! Useful in unit and integration tests where a real node implementation is
//! either unavailable or irrelevant.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use serde_json::{json, Map, Value};

use crate::{ExecutionContext, NodeError, NodeExecutionResult, NodeExecutor, NodeType};

/// Behaviour injected into `MockNode` at construction time.
#[derive(Debug, Clone)]
pub enum MockBehaviour {
    /// Succeed, merging this object into the output.
    Return(Value),
    /// Report `success == false` with this message.
    Fail(String),
    /// Return `Err(NodeError::Failed)`, as if the node crashed.
    Crash(String),
    /// Suspend the run, reporting this wait state id.
    Wait(String),
    /// Succeed and route to this node only.
    Branch(String),
}

/// A mock executor that records every node id it is invoked for and
/// answers with a programmer-specified result.
///
/// Per-node overrides let one registered executor script different
/// outcomes for different node ids of the same type.
pub struct MockNode {
    node_type: NodeType,
    default: MockBehaviour,
    overrides: HashMap<String, MockBehaviour>,
    /// Node ids seen by this executor, in call order.
    pub calls: Arc<Mutex<Vec<String>>>,
}

impl MockNode {
    pub fn new(node_type: NodeType, behaviour: MockBehaviour) -> Self {
        Self {
            node_type,
            default: behaviour,
            overrides: HashMap::new(),
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// A mock that always succeeds with the given value.
    pub fn returning(node_type: NodeType, value: Value) -> Self {
        Self::new(node_type, MockBehaviour::Return(value))
    }

    /// A mock that always reports `success == false`.
    pub fn failing(node_type: NodeType, msg: impl Into<String>) -> Self {
        Self::new(node_type, MockBehaviour::Fail(msg.into()))
    }

    /// A mock that always returns an `Err`.
    pub fn crashing(node_type: NodeType, msg: impl Into<String>) -> Self {
        Self::new(node_type, MockBehaviour::Crash(msg.into()))
    }

    /// A mock that always suspends on `wait_state_id`.
    pub fn waiting(node_type: NodeType, wait_state_id: impl Into<String>) -> Self {
        Self::new(node_type, MockBehaviour::Wait(wait_state_id.into()))
    }

    /// Script a different behaviour for one node id.
    pub fn with_override(mut self, node_id: impl Into<String>, behaviour: MockBehaviour) -> Self {
        self.overrides.insert(node_id.into(), behaviour);
        self
    }

    /// Share a call journal with other mocks to observe cross-type ordering.
    pub fn with_journal(mut self, journal: Arc<Mutex<Vec<String>>>) -> Self {
        self.calls = journal;
        self
    }

    fn journal(&self) -> MutexGuard<'_, Vec<String>> {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of times this node has been executed.
    pub fn call_count(&self) -> usize {
        self.journal().len()
    }

    /// Node ids this mock was executed for, in order.
    pub fn called_ids(&self) -> Vec<String> {
        self.journal().clone()
    }
}

#[async_trait]
impl NodeExecutor for MockNode {
    fn node_type(&self) -> NodeType {
        self.node_type
    }

    fn name(&self) -> &str {
        "MockNode"
    }

    async fn execute(
        &self,
        node_id: &str,
        _config: &Value,
        _ctx: &mut ExecutionContext,
    ) -> Result<NodeExecutionResult, NodeError> {
        self.journal().push(node_id.to_string());

        let behaviour = self.overrides.get(node_id).unwrap_or(&self.default);
        let mut output = Map::new();
        output.insert("node".into(), json!(node_id));

        match behaviour {
            MockBehaviour::Return(v) => {
                if let Some(obj) = v.as_object() {
                    for (k, val) in obj {
                        output.insert(k.clone(), val.clone());
                    }
                }
                Ok(NodeExecutionResult::success(output))
            }
            MockBehaviour::Fail(msg) => Ok(NodeExecutionResult::failure(msg.clone())),
            MockBehaviour::Crash(msg) => Err(NodeError::Failed(msg.clone())),
            MockBehaviour::Wait(wait_state_id) => {
                output.insert("waitStateId".into(), json!(wait_state_id));
                output.insert("status".into(), json!("waiting"));
                Ok(NodeExecutionResult::waiting(output))
            }
            MockBehaviour::Branch(next) => {
                Ok(NodeExecutionResult::success(output).with_next(next.clone()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn overrides_apply_per_node_id() {
        let mock = MockNode::returning(NodeType::Action, json!({ "ok": true }))
            .with_override("boom", MockBehaviour::Fail("nope".into()));
        let mut ctx = ExecutionContext::new("exec", "wf");

        let ok = mock.execute("a", &Value::Null, &mut ctx).await.unwrap();
        assert!(ok.success);
        assert_eq!(ok.output["ok"], true);
        assert_eq!(ok.output["node"], "a");

        let failed = mock.execute("boom", &Value::Null, &mut ctx).await.unwrap();
        assert!(!failed.success);
        assert_eq!(failed.error.as_deref(), Some("nope"));

        assert_eq!(mock.called_ids(), vec!["a", "boom"]);
    }

    #[tokio::test]
    async fn waiting_mock_reports_wait_state_id() {
        let mock = MockNode::waiting(NodeType::WaitEvents, "ws-1");
        let mut ctx = ExecutionContext::new("exec", "wf");
        let result = mock.execute("w", &Value::Null, &mut ctx).await.unwrap();
        assert!(result.waiting);
        assert_eq!(result.wait_state_id(), Some("ws-1"));
    }

    #[tokio::test]
    async fn crashing_mock_returns_err() {
        let mock = MockNode::crashing(NodeType::Data, "panic-ish");
        let mut ctx = ExecutionContext::new("exec", "wf");
        let result = mock.execute("d", &Value::Null, &mut ctx).await;
        assert_eq!(result, Err(NodeError::Failed("panic-ish".into())));
        assert_eq!(mock.call_count(), 1);
    }
}
