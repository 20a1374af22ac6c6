//! `MockInstruction`: a test double for `Instruction`.
//!
//! Useful in unit and integration tests where a real instruction is either
//! unavailable or irrelevant.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::{Completion, ExecutionContext, Instruction, NodeError, Outcome};

/// Behaviour injected into `MockInstruction` at construction time.
pub enum MockBehaviour {
    /// Resolve with a specific JSON value.
    ReturnValue(Value),
    /// Settle with the n-th completion on the n-th call; the last one repeats.
    Script(Vec<Completion>),
    /// Fail with a `Retryable` error `failures` times, then resolve.
    Flaky { failures: usize, value: Value },
    /// Fail with a `Retryable` error.
    FailRetryable(String),
    /// Fail with a `Fatal` error.
    FailFatal(String),
    /// Panic inside `run`.
    Panic(String),
    /// Settle asynchronously after a delay.
    SettleAfter(Duration, Completion),
    /// Go pending and never settle on its own; tests complete the job
    /// through the executor.
    Park,
}

/// A mock instruction that records every config it receives and behaves
/// as programmed.
pub struct MockInstruction {
    /// Label used in test assertions.
    pub name: String,
    /// What the instruction will do when `run` is called.
    pub behaviour: MockBehaviour,
    /// All resolved configs seen by this instruction (in call order).
    pub calls: Arc<Mutex<Vec<Value>>>,
}

impl MockInstruction {
    fn with(name: impl Into<String>, behaviour: MockBehaviour) -> Self {
        Self {
            name: name.into(),
            behaviour,
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Create a mock that always succeeds with the given value.
    pub fn returning(name: impl Into<String>, value: Value) -> Self {
        Self::with(name, MockBehaviour::ReturnValue(value))
    }

    pub fn scripted(name: impl Into<String>, script: Vec<Completion>) -> Self {
        Self::with(name, MockBehaviour::Script(script))
    }

    pub fn flaky(name: impl Into<String>, failures: usize, value: Value) -> Self {
        Self::with(name, MockBehaviour::Flaky { failures, value })
    }

    /// Create a mock that always fails with a `Fatal` error.
    pub fn failing_fatal(name: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::with(name, MockBehaviour::FailFatal(msg.into()))
    }

    /// Create a mock that always fails with a `Retryable` error.
    pub fn failing_retryable(name: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::with(name, MockBehaviour::FailRetryable(msg.into()))
    }

    pub fn panicking(name: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::with(name, MockBehaviour::Panic(msg.into()))
    }

    pub fn settling_after(name: impl Into<String>, delay: Duration, completion: Completion) -> Self {
        Self::with(name, MockBehaviour::SettleAfter(delay, completion))
    }

    pub fn parked(name: impl Into<String>) -> Self {
        Self::with(name, MockBehaviour::Park)
    }

    /// Number of times this instruction has been run.
    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    /// Resolved configs in call order.
    pub fn configs(&self) -> Vec<Value> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl Instruction for MockInstruction {
    async fn run(&self, config: Value, _ctx: &ExecutionContext) -> Result<Outcome, NodeError> {
        let call = {
            let mut calls = self.calls.lock().unwrap();
            calls.push(config);
            calls.len()
        };

        match &self.behaviour {
            MockBehaviour::ReturnValue(v) => {
                // Tag the output with the mock's name so tests can trace
                // which instruction produced a job result.
                let mut out = json!({ "node": self.name });
                if let (Some(out_obj), Some(v_obj)) = (out.as_object_mut(), v.as_object()) {
                    for (k, val) in v_obj {
                        out_obj.insert(k.clone(), val.clone());
                    }
                }
                Ok(Completion::resolved(out).into())
            }
            MockBehaviour::Script(script) => {
                let completion = script
                    .get(call - 1)
                    .or_else(|| script.last())
                    .cloned()
                    .unwrap_or_else(|| Completion::resolved(Value::Null));
                Ok(completion.into())
            }
            MockBehaviour::Flaky { failures, value } => {
                if call <= *failures {
                    Err(NodeError::Retryable(format!("{} attempt {call} failed", self.name)))
                } else {
                    Ok(Completion::resolved(value.clone()).into())
                }
            }
            MockBehaviour::FailRetryable(msg) => Err(NodeError::Retryable(msg.clone())),
            MockBehaviour::FailFatal(msg) => Err(NodeError::Fatal(msg.clone())),
            MockBehaviour::Panic(msg) => panic!("{msg}"),
            MockBehaviour::SettleAfter(delay, completion) => {
                let (delay, completion) = (*delay, completion.clone());
                Ok(Outcome::pending(async move {
                    tokio::time::sleep(delay).await;
                    completion
                }))
            }
            MockBehaviour::Park => Ok(Outcome::pending(std::future::pending())),
        }
    }
}
