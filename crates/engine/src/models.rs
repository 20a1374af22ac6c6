//! Core domain models for the workflow engine.
//!
//! These types are the source of truth for what a workflow looks like
//! in memory. The graph part (`trigger`, `nodes`, `edges`) is serialised to
//! the JSON `definition` column of the `workflows` table.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use instructions::Port;
use store::WorkflowRow;

use crate::EngineError;

// ---------------------------------------------------------------------------
// Trigger
// ---------------------------------------------------------------------------

/// How a workflow is started. Trigger adapters live outside the engine; the
/// variant only records which one feeds `start_execution`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Trigger {
    /// Started by hand (CLI, admin action).
    #[default]
    Manual,
    /// Started by a record event on a collection.
    Collection {
        collection: String,
        /// Which events fire the workflow, e.g. `"create"`.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        mode: Option<String>,
    },
    /// Started on a cron schedule.
    Schedule {
        cron: String,
    },
}

// ---------------------------------------------------------------------------
// NodeDefinition
// ---------------------------------------------------------------------------

/// A single step in the workflow graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeDefinition {
    /// Unique identifier within this workflow (referenced by edges).
    pub id: String,
    /// Maps to a registered `Instruction`.
    #[serde(alias = "type")]
    pub node_type: String,
    /// Configuration handed to the instruction once placeholders are resolved.
    #[serde(default)]
    pub config: serde_json::Value,
}

impl NodeDefinition {
    pub fn new(id: impl Into<String>, node_type: impl Into<String>, config: serde_json::Value) -> Self {
        Self { id: id.into(), node_type: node_type.into(), config }
    }

    /// `ignoreFail` from the raw config: the node tolerates its own failure
    /// and the run continues on the default port.
    pub fn ignores_failure(&self) -> bool {
        self.config
            .get("ignoreFail")
            .and_then(serde_json::Value::as_bool)
            .unwrap_or(false)
    }
}

// ---------------------------------------------------------------------------
// Edge
// ---------------------------------------------------------------------------

/// Directed edge leaving `from` on `port`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Edge {
    pub from: String,
    pub to: String,
    #[serde(default)]
    pub port: Port,
}

impl Edge {
    pub fn new(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self { from: from.into(), to: to.into(), port: Port::Default }
    }

    pub fn on(from: impl Into<String>, port: Port, to: impl Into<String>) -> Self {
        Self { from: from.into(), to: to.into(), port }
    }
}

// ---------------------------------------------------------------------------
// Workflow
// ---------------------------------------------------------------------------

/// A complete workflow definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    #[serde(default = "Uuid::new_v4")]
    pub id: Uuid,
    pub name: String,
    #[serde(default)]
    pub trigger: Trigger,
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
    pub nodes: Vec<NodeDefinition>,
    #[serde(default)]
    pub edges: Vec<Edge>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

fn enabled_by_default() -> bool {
    true
}

/// The part of a [`Workflow`] stored as the row's `definition`.
#[derive(Serialize, Deserialize)]
struct Definition {
    trigger: Trigger,
    nodes: Vec<NodeDefinition>,
    edges: Vec<Edge>,
}

impl Workflow {
    /// Convenience constructor for testing.
    pub fn new(
        name: impl Into<String>,
        trigger: Trigger,
        nodes: Vec<NodeDefinition>,
        edges: Vec<Edge>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            trigger,
            enabled: true,
            nodes,
            edges,
            created_at: Utc::now(),
        }
    }

    pub fn node(&self, id: &str) -> Option<&NodeDefinition> {
        self.nodes.iter().find(|n| n.id == id)
    }

    /// First node, in declaration order, with no incoming edges.
    /// Validation guarantees there is exactly one.
    pub fn entry_node(&self) -> Option<&NodeDefinition> {
        self.nodes
            .iter()
            .find(|n| !self.edges.iter().any(|e| e.to == n.id))
    }

    /// Successor of `node_id` after a job settled on `port`.
    ///
    /// Falls back to the default edge when no edge is declared for a
    /// branch port.
    pub fn next_node(&self, node_id: &str, port: Port) -> Option<&str> {
        let on_port = |p: Port| {
            self.edges
                .iter()
                .find(|e| e.from == node_id && e.port == p)
                .map(|e| e.to.as_str())
        };
        on_port(port).or_else(|| {
            if port == Port::Default {
                None
            } else {
                on_port(Port::Default)
            }
        })
    }

    pub fn to_row(&self) -> Result<WorkflowRow, EngineError> {
        let definition = serde_json::to_value(Definition {
            trigger: self.trigger.clone(),
            nodes: self.nodes.clone(),
            edges: self.edges.clone(),
        })
        .map_err(|e| EngineError::InvalidDefinition(e.to_string()))?;

        Ok(WorkflowRow {
            id: self.id,
            name: self.name.clone(),
            enabled: self.enabled,
            definition,
            created_at: self.created_at,
        })
    }
}

impl TryFrom<WorkflowRow> for Workflow {
    type Error = EngineError;

    fn try_from(row: WorkflowRow) -> Result<Self, Self::Error> {
        let definition: Definition = serde_json::from_value(row.definition)
            .map_err(|e| EngineError::InvalidDefinition(format!("workflow {}: {e}", row.id)))?;
        Ok(Self {
            id: row.id,
            name: row.name,
            trigger: definition.trigger,
            enabled: row.enabled,
            nodes: definition.nodes,
            edges: definition.edges,
            created_at: row.created_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn branching() -> Workflow {
        Workflow::new(
            "branching",
            Trigger::Manual,
            vec![
                NodeDefinition::new("check", "condition", json!({})),
                NodeDefinition::new("yes", "calculation", json!({})),
                NodeDefinition::new("after", "calculation", json!({})),
            ],
            vec![
                Edge::on("check", Port::True, "yes"),
                Edge::new("check", "after"),
                Edge::new("yes", "after"),
            ],
        )
    }

    #[test]
    fn next_node_prefers_the_exact_port() {
        let wf = branching();
        assert_eq!(wf.next_node("check", Port::True), Some("yes"));
        assert_eq!(wf.next_node("check", Port::Default), Some("after"));
    }

    #[test]
    fn branch_port_without_an_edge_falls_back_to_default() {
        let wf = branching();
        assert_eq!(wf.next_node("check", Port::False), Some("after"));
        assert_eq!(wf.next_node("after", Port::True), None);
    }

    #[test]
    fn entry_node_has_no_incoming_edges() {
        assert_eq!(branching().entry_node().map(|n| n.id.as_str()), Some("check"));
    }

    #[test]
    fn definition_survives_the_row() {
        let wf = Workflow::new(
            "on create",
            Trigger::Collection { collection: "posts".into(), mode: Some("create".into()) },
            branching().nodes,
            branching().edges,
        );
        let back = Workflow::try_from(wf.to_row().unwrap()).unwrap();
        assert_eq!(back.id, wf.id);
        assert_eq!(back.trigger, wf.trigger);
        assert_eq!(back.edges, wf.edges);
        assert_eq!(back.nodes, wf.nodes);
    }

    #[test]
    fn json_definitions_accept_short_forms() {
        let wf: Workflow = serde_json::from_value(json!({
            "name": "short",
            "nodes": [{ "id": "a", "type": "request", "config": { "url": "http://x" } }],
        }))
        .unwrap();
        assert!(wf.enabled);
        assert_eq!(wf.trigger, Trigger::Manual);
        assert_eq!(wf.nodes[0].node_type, "request");
        assert!(wf.edges.is_empty());
    }

    #[test]
    fn malformed_row_is_an_invalid_definition() {
        let mut row = branching().to_row().unwrap();
        row.definition = json!({ "nodes": "nope" });
        assert!(matches!(Workflow::try_from(row), Err(EngineError::InvalidDefinition(_))));
    }
}
