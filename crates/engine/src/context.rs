//! Accumulated execution context.
//!
//! Persisted on the execution row as `{"trigger": ..., "jobs": {...}}` and
//! exposed to placeholders and expressions as the scope
//! `{"$context", "$jobsMapByNodeId", "$system"}`.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use uuid::Uuid;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunContext {
    /// Payload handed to `start_execution`.
    #[serde(default)]
    pub trigger: Value,
    /// Latest result per node; a loop overwrites earlier visits.
    #[serde(default)]
    pub jobs: Map<String, Value>,
}

impl RunContext {
    pub fn new(trigger: Value) -> Self {
        Self { trigger, jobs: Map::new() }
    }

    /// Read the stored form.
    pub fn from_value(value: &Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(value.clone())
    }

    pub fn to_value(&self) -> Value {
        json!({ "trigger": self.trigger, "jobs": self.jobs })
    }

    pub fn record(&mut self, node_id: &str, result: Value) {
        self.jobs.insert(node_id.to_owned(), result);
    }

    pub fn scope(&self, execution_id: Uuid, workflow_id: Uuid) -> Value {
        json!({
            "$context": self.trigger,
            "$jobsMapByNodeId": self.jobs,
            "$system": {
                "executionId": execution_id,
                "workflowId": workflow_id,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stored_form_round_trips_and_records_overwrite() {
        let mut ctx = RunContext::new(json!({ "data": { "title": "t1" } }));
        ctx.record("fetch", json!(1));
        ctx.record("fetch", json!(2));

        let stored = ctx.to_value();
        assert_eq!(stored, json!({ "trigger": { "data": { "title": "t1" } }, "jobs": { "fetch": 2 } }));
        assert_eq!(RunContext::from_value(&stored).unwrap(), ctx);
    }

    #[test]
    fn undecodable_stored_form_is_an_error() {
        assert!(RunContext::from_value(&json!({ "trigger": {}, "jobs": 5 })).is_err());
        assert!(RunContext::from_value(&json!("not a context")).is_err());
        assert_eq!(RunContext::from_value(&json!({})).unwrap(), RunContext::default());
    }

    #[test]
    fn scope_uses_dollar_names() {
        let (execution_id, workflow_id) = (Uuid::new_v4(), Uuid::new_v4());
        let mut ctx = RunContext::new(json!({ "a": 1 }));
        ctx.record("n1", json!("ok"));

        let scope = ctx.scope(execution_id, workflow_id);
        assert_eq!(scope["$context"]["a"], 1);
        assert_eq!(scope["$jobsMapByNodeId"]["n1"], "ok");
        assert_eq!(scope["$system"]["executionId"], execution_id.to_string());
        assert_eq!(scope["$system"]["workflowId"], workflow_id.to_string());
    }
}
