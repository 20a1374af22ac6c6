//! `delay`: parks the execution for a fixed duration.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::{Completion, ExecutionContext, Instruction, NodeError, Outcome};

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
enum EndStatus {
    #[default]
    Resolved,
    Failed,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DelayConfig {
    /// Milliseconds.
    duration: u64,
    #[serde(default)]
    end_status: EndStatus,
}

pub struct DelayInstruction;

#[async_trait]
impl Instruction for DelayInstruction {
    async fn run(&self, config: Value, _ctx: &ExecutionContext) -> Result<Outcome, NodeError> {
        let config: DelayConfig =
            serde_json::from_value(config).map_err(|e| NodeError::invalid_config("delay", e))?;

        Ok(Outcome::pending(async move {
            tokio::time::sleep(Duration::from_millis(config.duration)).await;
            let result = json!({ "duration": config.duration });
            match config.end_status {
                EndStatus::Resolved => Completion::resolved(result),
                EndStatus::Failed => Completion::failed(result),
            }
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> ExecutionContext {
        ExecutionContext {
            workflow_id: uuid::Uuid::new_v4(),
            execution_id: uuid::Uuid::new_v4(),
            node_id: "wait".into(),
            scope: json!({}),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn settles_after_the_duration() {
        let Outcome::Pending(task) = DelayInstruction
            .run(json!({ "duration": 5000 }), &ctx())
            .await
            .unwrap()
        else {
            panic!("delay must be asynchronous");
        };

        let started = tokio::time::Instant::now();
        let completion = task.await;
        assert!(started.elapsed() >= Duration::from_millis(5000));
        assert_eq!(completion, Completion::resolved(json!({ "duration": 5000 })));
    }

    #[tokio::test(start_paused = true)]
    async fn end_status_can_fail_the_job() {
        let Outcome::Pending(task) = DelayInstruction
            .run(json!({ "duration": 10, "endStatus": "failed" }), &ctx())
            .await
            .unwrap()
        else {
            panic!("delay must be asynchronous");
        };
        assert!(task.await.is_failed());
    }
}
