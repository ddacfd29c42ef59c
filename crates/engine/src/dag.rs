//! DAG validation. Run this before persisting or executing a workflow.
//!
//! Rules enforced:
//! 1. Node IDs must be unique within the workflow.
//! 2. Every edge must reference valid node IDs (both `source` and `target`).
//! 3. Exactly one node has a trigger-variant type.
//! 4. The directed graph must be acyclic (topological sort must succeed).
//!
//! Returns a topologically-sorted list of node IDs on success.

use std::collections::{HashMap, HashSet, VecDeque};

use crate::{models::WorkflowDefinition, EngineError};

/// Validate the definition and return its nodes in topological order.
///
/// Ties are broken by definition order, so the result is deterministic.
///
/// # Errors
/// - [`EngineError::DuplicateNodeId`] if two nodes share an ID.
/// - [`EngineError::UnknownNodeReference`] if an edge references a missing node.
/// - [`EngineError::TriggerCount`] unless exactly one trigger node exists.
/// - [`EngineError::CycleDetected`] if the graph is not acyclic.
pub fn validate_dag(definition: &WorkflowDefinition) -> Result<Vec<String>, EngineError> {
    // -----------------------------------------------------------------------
    // 1. Ensure node IDs are unique
    // -----------------------------------------------------------------------
    let mut node_set: HashSet<&str> = HashSet::new();
    for node in &definition.nodes {
        if !node_set.insert(node.id.as_str()) {
            return Err(EngineError::DuplicateNodeId(node.id.clone()));
        }
    }

    // -----------------------------------------------------------------------
    // 2. Validate edge endpoints
    // -----------------------------------------------------------------------
    for edge in &definition.edges {
        if !node_set.contains(edge.source.as_str()) {
            return Err(EngineError::UnknownNodeReference {
                node_id: edge.source.clone(),
                side: "source",
            });
        }
        if !node_set.contains(edge.target.as_str()) {
            return Err(EngineError::UnknownNodeReference {
                node_id: edge.target.clone(),
                side: "target",
            });
        }
    }

    // -----------------------------------------------------------------------
    // 3. Exactly one trigger
    // -----------------------------------------------------------------------
    let triggers = definition
        .nodes
        .iter()
        .filter(|n| n.parse_type().is_ok_and(|t| t.is_trigger()))
        .count();
    if triggers != 1 {
        return Err(EngineError::TriggerCount(triggers));
    }

    // -----------------------------------------------------------------------
    // 4. Topological sort (Kahn's algorithm)
    // -----------------------------------------------------------------------
    let mut adjacency: HashMap<&str, Vec<&str>> = HashMap::new();
    let mut in_degree: HashMap<&str, usize> =
        definition.nodes.iter().map(|n| (n.id.as_str(), 0)).collect();

    for edge in &definition.edges {
        adjacency
            .entry(edge.source.as_str())
            .or_default()
            .push(edge.target.as_str());
        *in_degree.entry(edge.target.as_str()).or_insert(0) += 1;
    }

    let mut queue: VecDeque<&str> = definition
        .nodes
        .iter()
        .map(|n| n.id.as_str())
        .filter(|id| in_degree.get(id) == Some(&0))
        .collect();

    let mut sorted: Vec<String> = Vec::with_capacity(definition.nodes.len());

    while let Some(node_id) = queue.pop_front() {
        sorted.push(node_id.to_owned());

        for &neighbour in adjacency.get(node_id).into_iter().flatten() {
            if let Some(deg) = in_degree.get_mut(neighbour) {
                *deg -= 1;
                if *deg == 0 {
                    queue.push_back(neighbour);
                }
            }
        }
    }

    // If we didn't visit every node the graph contains a cycle.
    if sorted.len() != definition.nodes.len() {
        return Err(EngineError::CycleDetected);
    }

    Ok(sorted)
}
