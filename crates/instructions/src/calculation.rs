//! `calculation`: evaluates an expression and records its value.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::expression::evaluate;
use crate::{Completion, ExecutionContext, Instruction, NodeError, Outcome};

#[derive(Debug, Deserialize)]
struct CalculationConfig {
    expression: String,
}

pub struct CalculationInstruction;

#[async_trait]
impl Instruction for CalculationInstruction {
    async fn run(&self, config: Value, ctx: &ExecutionContext) -> Result<Outcome, NodeError> {
        let config: CalculationConfig =
            serde_json::from_value(config).map_err(|e| NodeError::invalid_config("calculation", e))?;

        let completion = match evaluate(&config.expression, ctx) {
            Ok(value) => Completion::resolved(value),
            Err(message) => Completion::failed(json!({ "code": "EEVALUATE", "message": message })),
        };
        Ok(completion.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn resolved_placeholders_are_evaluated() {
        let ctx = ExecutionContext {
            workflow_id: uuid::Uuid::new_v4(),
            execution_id: uuid::Uuid::new_v4(),
            node_id: "calc".into(),
            scope: json!({}),
        };
        // `{{$context.data.price}} * 3` after resolution:
        let outcome = CalculationInstruction
            .run(json!({ "expression": "4 * 3" }), &ctx)
            .await
            .unwrap();
        match outcome {
            Outcome::Settled(Completion::Resolved { result, .. }) => assert_eq!(result.as_f64(), Some(12.0)),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn missing_expression_is_a_config_error() {
        let ctx = ExecutionContext {
            workflow_id: uuid::Uuid::new_v4(),
            execution_id: uuid::Uuid::new_v4(),
            node_id: "calc".into(),
            scope: json!({}),
        };
        let err = CalculationInstruction.run(json!({}), &ctx).await.unwrap_err();
        assert!(matches!(err, NodeError::Fatal(_)));
    }
}
