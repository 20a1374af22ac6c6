//! `condition`: evaluates a boolean expression and branches on it.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::expression::{evaluate, truthy};
use crate::{Completion, ExecutionContext, Instruction, NodeError, Outcome, Port};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConditionConfig {
    expression: String,
    /// Fail the job when the expression is false instead of taking the
    /// `false` branch.
    #[serde(default = "default_reject_on_false")]
    reject_on_false: bool,
}

fn default_reject_on_false() -> bool {
    true
}

/// Settles on port `true` or `false` with the boolean as its result.
pub struct ConditionInstruction;

#[async_trait]
impl Instruction for ConditionInstruction {
    async fn run(&self, config: Value, ctx: &ExecutionContext) -> Result<Outcome, NodeError> {
        let config: ConditionConfig =
            serde_json::from_value(config).map_err(|e| NodeError::invalid_config("condition", e))?;

        let value = match evaluate(&config.expression, ctx) {
            Ok(value) => value,
            Err(message) => {
                return Ok(Completion::failed(json!({ "code": "EEVALUATE", "message": message })).into());
            }
        };

        let passed = truthy(&value);
        if !passed && config.reject_on_false {
            return Ok(Completion::failed(json!(false)).into());
        }
        Ok(Completion::branch(json!(passed), Port::from(passed)).into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> ExecutionContext {
        ExecutionContext {
            workflow_id: uuid::Uuid::new_v4(),
            execution_id: uuid::Uuid::new_v4(),
            node_id: "if".into(),
            scope: json!({ "$context": { "data": { "title": "t1" } } }),
        }
    }

    async fn settle(config: Value) -> Completion {
        match ConditionInstruction.run(config, &ctx()).await.unwrap() {
            Outcome::Settled(c) => c,
            Outcome::Pending(_) => panic!("condition settles synchronously"),
        }
    }

    #[tokio::test]
    async fn true_takes_the_true_port() {
        let c = settle(json!({ "expression": "context.data.title == 't1'" })).await;
        assert_eq!(c, Completion::branch(json!(true), Port::True));
    }

    #[tokio::test]
    async fn false_fails_unless_branching() {
        let c = settle(json!({ "expression": "context.data.title == 'other'" })).await;
        assert_eq!(c, Completion::failed(json!(false)));

        let c = settle(json!({ "expression": "context.data.title == 'other'", "rejectOnFalse": false })).await;
        assert_eq!(c, Completion::branch(json!(false), Port::False));
    }

    #[tokio::test]
    async fn bad_expressions_fail_the_job() {
        let c = settle(json!({ "expression": "==" })).await;
        assert!(c.is_failed());
        assert_eq!(c.result()["code"], "EEVALUATE");
    }
}
