//! Per-run mutable state shared by all nodes of one execution.
//!
//! The context is purely in-memory. Caching it and persisting its snapshot
//! are the engine's responsibility; nothing in here performs I/O.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Key under which [`ExecutionContext::data_for_node`] exposes all prior node outputs.
pub const NODE_OUTPUTS_KEY: &str = "_nodeOutputs";
/// Key under which [`ExecutionContext::data_for_node`] exposes run metadata.
pub const METADATA_KEY: &str = "_metadata";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ExecutionContext {
    pub execution_id: String,
    pub workflow_id: String,
    /// Global variables, writable by any node.
    pub variables: Map<String, Value>,
    /// Output of every node visited so far, keyed by node id.
    pub node_outputs: Map<String, Value>,
    pub metadata: Map<String, Value>,
    /// Trigger payload keyed by the trigger node it belongs to.
    #[serde(rename = "triggerDataMap")]
    pub trigger_data_by_node: HashMap<String, Map<String, Value>>,
    pub wait_state_id: Option<String>,
    pub waiting_node_id: Option<String>,
}

impl ExecutionContext {
    pub fn new(execution_id: impl Into<String>, workflow_id: impl Into<String>) -> Self {
        Self {
            execution_id: execution_id.into(),
            workflow_id: workflow_id.into(),
            ..Self::default()
        }
    }

    pub fn set_variable(&mut self, key: impl Into<String>, value: Value) {
        self.variables.insert(key.into(), value);
    }

    pub fn get_variable(&self, key: &str) -> Option<&Value> {
        self.variables.get(key)
    }

    pub fn set_node_output(&mut self, node_id: impl Into<String>, output: Value) {
        self.node_outputs.insert(node_id.into(), output);
    }

    pub fn get_node_output(&self, node_id: &str) -> Option<&Value> {
        self.node_outputs.get(node_id)
    }

    pub fn set_metadata(&mut self, key: impl Into<String>, value: Value) {
        self.metadata.insert(key.into(), value);
    }

    pub fn set_trigger_data_for_node(
        &mut self,
        trigger_node_id: impl Into<String>,
        data: Map<String, Value>,
    ) {
        self.trigger_data_by_node.insert(trigger_node_id.into(), data);
    }

    /// Trigger data seeded for `trigger_node_id`, or an empty map.
    pub fn get_trigger_data_for_node(&self, trigger_node_id: &str) -> Map<String, Value> {
        self.trigger_data_by_node
            .get(trigger_node_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn set_wait_state(&mut self, wait_state_id: impl Into<String>, node_id: impl Into<String>) {
        self.wait_state_id = Some(wait_state_id.into());
        self.waiting_node_id = Some(node_id.into());
    }

    pub fn clear_wait_state(&mut self) {
        self.wait_state_id = None;
        self.waiting_node_id = None;
    }

    /// True iff a non-empty wait state id is set.
    pub fn is_waiting(&self) -> bool {
        self.wait_state_id.as_deref().is_some_and(|id| !id.is_empty())
    }

    /// The view handed to an executor: every variable at the top level, plus
    /// all prior node outputs and the run metadata under reserved keys.
    ///
    /// Any node can read any earlier node's output, not just its parent's.
    pub fn data_for_node(&self, _node_id: &str) -> Map<String, Value> {
        let mut data = self.variables.clone();
        data.insert(
            NODE_OUTPUTS_KEY.to_string(),
            Value::Object(self.node_outputs.clone()),
        );
        data.insert(METADATA_KEY.to_string(), Value::Object(self.metadata.clone()));
        data
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn waiting_requires_non_empty_id() {
        let mut ctx = ExecutionContext::new("exec", "wf");
        assert!(!ctx.is_waiting());

        ctx.set_wait_state("", "wait");
        assert!(!ctx.is_waiting());

        ctx.set_wait_state("ws-1", "wait");
        assert!(ctx.is_waiting());
        assert_eq!(ctx.waiting_node_id.as_deref(), Some("wait"));

        ctx.clear_wait_state();
        assert!(!ctx.is_waiting());
    }

    #[test]
    fn data_for_node_exposes_all_prior_outputs() {
        let mut ctx = ExecutionContext::new("exec", "wf");
        ctx.set_variable("customer", json!("ada"));
        ctx.set_node_output("a", json!({ "x": 1 }));
        ctx.set_node_output("b", json!({ "y": 2 }));
        ctx.set_metadata("attempt", json!(1));

        let data = ctx.data_for_node("c");
        assert_eq!(data["customer"], "ada");
        assert_eq!(data[NODE_OUTPUTS_KEY]["a"]["x"], 1);
        assert_eq!(data[NODE_OUTPUTS_KEY]["b"]["y"], 2);
        assert_eq!(data[METADATA_KEY]["attempt"], 1);
    }

    #[test]
    fn missing_trigger_data_is_empty() {
        let ctx = ExecutionContext::new("exec", "wf");
        assert!(ctx.get_trigger_data_for_node("t").is_empty());
    }

    #[test]
    fn serializes_with_camel_case_keys() {
        let mut ctx = ExecutionContext::new("exec", "wf");
        ctx.set_trigger_data_for_node("t", Map::new());
        ctx.set_wait_state("ws", "w");

        let value = serde_json::to_value(&ctx).unwrap();
        for key in [
            "executionId",
            "workflowId",
            "variables",
            "nodeOutputs",
            "metadata",
            "triggerDataMap",
            "waitStateId",
            "waitingNodeId",
        ] {
            assert!(value.get(key).is_some(), "missing key {key}");
        }
    }
}
