//! Instruction-level error type.

use thiserror::Error;

/// Errors returned by an instruction's `run` method.
///
/// Handler-level failures that are part of the instruction's contract (a
/// timed-out request, a false condition) are *not* errors: they settle the
/// job through [`crate::Completion::Failed`]. `NodeError` is for the cases
/// where the instruction could not run at all. The engine uses the variant
/// to decide retry behaviour:
/// - `Retryable`: the invocation is retried with exponential back-off.
/// - `Fatal`: the job is recorded as failed immediately.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum NodeError {
    /// Transient failure; the engine should re-try the invocation.
    #[error("retryable node error: {0}")]
    Retryable(String),

    /// Permanent failure (typically a malformed config); no retry.
    #[error("fatal node error: {0}")]
    Fatal(String),
}

impl NodeError {
    pub fn invalid_config(node_type: &str, err: impl std::fmt::Display) -> Self {
        Self::Fatal(format!("invalid {node_type} config: {err}"))
    }
}
