//! Graph validation: run this before persisting or executing a workflow.
//!
//! Rules enforced:
//! 1. Node IDs must be unique within the workflow.
//! 2. Every edge must reference valid node IDs (both `from` and `to`).
//! 3. At most one edge leaves a node on each port.
//! 4. Exactly one node has no incoming edges (the entry node).
//! 5. Every node type has a registered instruction.
//!
//! Cycles are allowed: loops revisit nodes and each visit creates a new job.
//! Runaway loops are bounded at run time by `EngineConfig::max_steps`.
//!
//! Returns the entry node ID on success.

use std::collections::{HashMap, HashSet, VecDeque};

use instructions::InstructionRegistry;
use tracing::warn;

use crate::{models::Workflow, EngineError};

/// Validate the workflow graph against `registry`.
///
/// # Errors
/// - [`EngineError::DuplicateNodeId`] if two nodes share an ID.
/// - [`EngineError::UnknownNodeReference`] if an edge references a missing node.
/// - [`EngineError::AmbiguousSuccessor`] if two edges leave a node on one port.
/// - [`EngineError::MissingEntryNode`] / [`EngineError::MultipleEntryNodes`]
///   unless exactly one node has no incoming edges.
/// - [`EngineError::UnknownInstruction`] if a node type is not registered.
pub fn validate_graph(
    workflow: &Workflow,
    registry: &InstructionRegistry,
) -> Result<String, EngineError> {
    // -----------------------------------------------------------------------
    // 1. Ensure node IDs are unique
    // -----------------------------------------------------------------------
    let mut seen_ids: HashSet<&str> = HashSet::new();
    for node in &workflow.nodes {
        if !seen_ids.insert(node.id.as_str()) {
            return Err(EngineError::DuplicateNodeId(node.id.clone()));
        }
    }

    // -----------------------------------------------------------------------
    // 2. Validate edge endpoints
    // -----------------------------------------------------------------------
    for edge in &workflow.edges {
        if !seen_ids.contains(edge.from.as_str()) {
            return Err(EngineError::UnknownNodeReference {
                node_id: edge.from.clone(),
                side: "from",
            });
        }
        if !seen_ids.contains(edge.to.as_str()) {
            return Err(EngineError::UnknownNodeReference {
                node_id: edge.to.clone(),
                side: "to",
            });
        }
    }

    // -----------------------------------------------------------------------
    // 3. One successor per (node, port)
    // -----------------------------------------------------------------------
    let mut ports = HashSet::new();
    for edge in &workflow.edges {
        if !ports.insert((edge.from.as_str(), edge.port)) {
            return Err(EngineError::AmbiguousSuccessor {
                node_id: edge.from.clone(),
                port: edge.port.to_string(),
            });
        }
    }

    // -----------------------------------------------------------------------
    // 4. Exactly one entry node
    // -----------------------------------------------------------------------
    let targets: HashSet<&str> = workflow.edges.iter().map(|e| e.to.as_str()).collect();
    let entries: Vec<&str> = workflow
        .nodes
        .iter()
        .map(|n| n.id.as_str())
        .filter(|id| !targets.contains(id))
        .collect();

    let entry = match entries.as_slice() {
        [] => return Err(EngineError::MissingEntryNode),
        [only] => *only,
        many => {
            return Err(EngineError::MultipleEntryNodes(
                many.iter().map(|id| id.to_string()).collect(),
            ))
        }
    };

    // -----------------------------------------------------------------------
    // 5. Every node type is registered
    // -----------------------------------------------------------------------
    for node in &workflow.nodes {
        if !registry.contains(&node.node_type) {
            return Err(EngineError::UnknownInstruction {
                node_id: node.id.clone(),
                node_type: node.node_type.clone(),
            });
        }
    }

    // Nodes only reachable through a cycle that the entry never enters are
    // dead weight, not an error.
    let unreachable = unreachable_from(workflow, entry);
    if !unreachable.is_empty() {
        warn!(workflow_id = %workflow.id, ?unreachable, "workflow has unreachable nodes");
    }

    Ok(entry.to_owned())
}

/// Breadth-first walk from `entry`; returns the nodes it never reaches.
fn unreachable_from<'a>(workflow: &'a Workflow, entry: &'a str) -> Vec<&'a str> {
    let mut adjacency: HashMap<&str, Vec<&str>> = HashMap::new();
    for edge in &workflow.edges {
        adjacency
            .entry(edge.from.as_str())
            .or_default()
            .push(edge.to.as_str());
    }

    let mut visited: HashSet<&str> = HashSet::from([entry]);
    let mut queue: VecDeque<&str> = VecDeque::from([entry]);
    while let Some(node_id) = queue.pop_front() {
        for &next in adjacency.get(node_id).into_iter().flatten() {
            if visited.insert(next) {
                queue.push_back(next);
            }
        }
    }

    workflow
        .nodes
        .iter()
        .map(|n| n.id.as_str())
        .filter(|id| !visited.contains(id))
        .collect()
}
