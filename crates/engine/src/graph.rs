//! Traversal view of a workflow definition.
//!
//! Node type labels are parsed once, here, so the traversal loop only deals
//! with typed [`NodeType`]s and pre-computed parse failures.

use std::collections::{HashMap, HashSet};

use nodes::{NodeError, NodeType};

use crate::models::{NodeDefinition, WorkflowDefinition};

pub struct WorkflowGraph<'a> {
    definition: &'a WorkflowDefinition,
    nodes: HashMap<&'a str, &'a NodeDefinition>,
    types: HashMap<&'a str, Result<NodeType, NodeError>>,
    adjacency: HashMap<&'a str, Vec<&'a str>>,
}

impl<'a> WorkflowGraph<'a> {
    pub fn new(definition: &'a WorkflowDefinition) -> Self {
        let mut nodes = HashMap::with_capacity(definition.nodes.len());
        let mut types = HashMap::with_capacity(definition.nodes.len());
        for node in &definition.nodes {
            // First definition of a duplicated id wins.
            nodes.entry(node.id.as_str()).or_insert(node);
            types.entry(node.id.as_str()).or_insert_with(|| node.parse_type());
        }

        let mut adjacency: HashMap<&str, Vec<&str>> = HashMap::new();
        for edge in &definition.edges {
            adjacency
                .entry(edge.source.as_str())
                .or_default()
                .push(edge.target.as_str());
        }

        Self {
            definition,
            nodes,
            types,
            adjacency,
        }
    }

    pub fn contains(&self, node_id: &str) -> bool {
        self.nodes.contains_key(node_id)
    }

    pub fn node(&self, node_id: &str) -> Option<&'a NodeDefinition> {
        self.nodes.get(node_id).copied()
    }

    /// The parsed type of `node_id`; `None` if the node does not exist.
    pub fn node_type(&self, node_id: &str) -> Option<&Result<NodeType, NodeError>> {
        self.types.get(node_id)
    }

    /// Adjacency-derived children, in edge order.
    pub fn successors(&self, node_id: &str) -> &[&'a str] {
        self.adjacency.get(node_id).map(Vec::as_slice).unwrap_or(&[])
    }

    fn is_trigger(&self, node_id: &str) -> bool {
        matches!(self.types.get(node_id), Some(Ok(t)) if t.is_trigger())
    }

    /// First node, in definition order, whose type is a trigger variant.
    pub fn trigger_node_id(&self) -> Option<&'a str> {
        self.definition
            .nodes
            .iter()
            .map(|n| n.id.as_str())
            .find(|id| self.is_trigger(id))
    }

    /// Trigger nodes plus nodes without incoming edges, in definition order.
    /// Falls back to the first node when that set is empty.
    pub fn start_nodes(&self) -> Vec<&'a str> {
        let targets: HashSet<&str> = self
            .definition
            .edges
            .iter()
            .map(|e| e.target.as_str())
            .collect();

        let mut seen = HashSet::new();
        let starts: Vec<&'a str> = self
            .definition
            .nodes
            .iter()
            .map(|n| n.id.as_str())
            .filter(|id| self.is_trigger(id) || !targets.contains(id))
            .filter(|id| seen.insert(*id))
            .collect();

        if starts.is_empty() {
            return self
                .definition
                .nodes
                .first()
                .map(|n| vec![n.id.as_str()])
                .unwrap_or_default();
        }
        starts
    }
}
