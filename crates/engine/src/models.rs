//! Workflow definition models.
//!
//! Definitions are owned outside the engine; these types only read them.
//! The JSON shape is `{"nodes": [{"id", "type", "data"}], "edges": [{"source", "target"}]}`,
//! with `config` accepted in place of `data`.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use db::WorkflowRecord;
use nodes::{NodeError, NodeType};

use crate::EngineError;

// ---------------------------------------------------------------------------
// NodeDefinition
// ---------------------------------------------------------------------------

/// A single step in the workflow graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeDefinition {
    /// Unique identifier within this workflow (referenced by edges).
    pub id: String,
    /// Raw type label, parsed into a [`NodeType`] when the graph is built.
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub node_type: Option<String>,
    /// Arbitrary configuration passed to the node at execution time.
    #[serde(rename = "data", alias = "config", default)]
    pub config: Value,
}

impl NodeDefinition {
    pub fn new(id: impl Into<String>, node_type: impl Into<String>, config: Value) -> Self {
        Self {
            id: id.into(),
            node_type: Some(node_type.into()),
            config,
        }
    }

    /// Parse the declared type label.
    pub fn parse_type(&self) -> Result<NodeType, NodeError> {
        match self.node_type.as_deref() {
            Some(label) if !label.trim().is_empty() => label.parse(),
            _ => Err(NodeError::InvalidConfig(format!(
                "node '{}' declares no type",
                self.id
            ))),
        }
    }
}

// ---------------------------------------------------------------------------
// Edge
// ---------------------------------------------------------------------------

/// Directed edge: `source` executes before `target`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Edge {
    pub source: String,
    pub target: String,
}

impl Edge {
    pub fn new(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// WorkflowDefinition / Workflow
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    #[serde(default)]
    pub nodes: Vec<NodeDefinition>,
    #[serde(default)]
    pub edges: Vec<Edge>,
}

impl WorkflowDefinition {
    pub fn new(nodes: Vec<NodeDefinition>, edges: Vec<Edge>) -> Self {
        Self { nodes, edges }
    }

    pub fn from_value(value: Value) -> Result<Self, EngineError> {
        serde_json::from_value(value).map_err(|e| EngineError::MalformedDefinition(e.to_string()))
    }
}

/// A workflow as the engine sees it: identity plus parsed definition.
#[derive(Debug, Clone, PartialEq)]
pub struct Workflow {
    pub id: Uuid,
    pub name: String,
    pub definition: WorkflowDefinition,
}

impl Workflow {
    pub fn new(name: impl Into<String>, definition: WorkflowDefinition) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            definition,
        }
    }

    /// Parse a stored workflow. A null definition is an error.
    pub fn from_record(record: WorkflowRecord) -> Result<Self, EngineError> {
        let raw = match record.definition {
            Some(Value::Null) | None => return Err(EngineError::MissingDefinition(record.id)),
            Some(raw) => raw,
        };
        Ok(Self {
            id: record.id,
            name: record.name,
            definition: WorkflowDefinition::from_value(raw)?,
        })
    }

    pub fn to_record(&self) -> Result<WorkflowRecord, EngineError> {
        Ok(WorkflowRecord {
            id: self.id,
            name: self.name.clone(),
            definition: Some(serde_json::to_value(&self.definition)?),
            created_at: Utc::now(),
        })
    }
}
