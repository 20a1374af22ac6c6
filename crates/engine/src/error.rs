//! Engine-level error types.

use thiserror::Error;
use uuid::Uuid;

use store::{ExecutionStatus, StoreError};

use crate::resolver::ResolutionError;

/// Errors produced by the workflow engine (validation + execution).
#[derive(Debug, Error)]
pub enum EngineError {
    // ------ Validation errors ------

    /// Two or more nodes share the same ID.
    #[error("duplicate node ID: '{0}'")]
    DuplicateNodeId(String),

    /// An edge references a node ID that doesn't exist in the workflow.
    #[error("edge references unknown node '{node_id}' ({side} side)")]
    UnknownNodeReference {
        node_id: String,
        side: &'static str,
    },

    /// More than one edge leaves the same node on the same port.
    #[error("node '{node_id}' has more than one '{port}' edge")]
    AmbiguousSuccessor {
        node_id: String,
        port: String,
    },

    /// Every node has an incoming edge, so there is nowhere to start.
    #[error("workflow has no entry node")]
    MissingEntryNode,

    /// More than one node has no incoming edge.
    #[error("workflow has several entry nodes: {0:?}")]
    MultipleEntryNodes(Vec<String>),

    /// A node's type has no registered instruction.
    #[error("node '{node_id}' has unknown instruction type '{node_type}'")]
    UnknownInstruction {
        node_id: String,
        node_type: String,
    },

    /// The stored or supplied definition cannot be decoded.
    #[error("invalid workflow definition: {0}")]
    InvalidDefinition(String),

    // ------ Execution errors ------

    #[error("workflow {0} not found")]
    WorkflowNotFound(Uuid),

    #[error("workflow {0} is disabled")]
    WorkflowDisabled(Uuid),

    #[error("execution {0} not found")]
    ExecutionNotFound(Uuid),

    /// The execution reached a terminal status before the operation applied.
    #[error("execution {id} is already {status}")]
    AlreadyFinished {
        id: Uuid,
        status: ExecutionStatus,
    },

    /// The run created more jobs than `EngineConfig::max_steps` allows.
    #[error("execution {id} exceeded the limit of {limit} steps")]
    StepLimitExceeded {
        id: Uuid,
        limit: usize,
    },

    /// The context stored on the execution row cannot be decoded.
    #[error("execution {id} has a corrupt context: {reason}")]
    CorruptContext {
        id: Uuid,
        reason: String,
    },

    /// A placeholder referenced a path that does not exist.
    #[error(transparent)]
    Resolution(#[from] ResolutionError),

    /// A node failed with a fatal error.
    #[error("node '{node_id}' failed fatally: {message}")]
    NodeFatal {
        node_id: String,
        message: String,
    },

    /// A node's retryable error was exhausted.
    #[error("node '{node_id}' exceeded retry limit: {message}")]
    NodeRetryExhausted {
        node_id: String,
        message: String,
    },

    /// Persistence error from the store crate.
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

impl EngineError {
    /// Errors that describe a malformed workflow rather than a failed run.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Self::DuplicateNodeId(_)
                | Self::UnknownNodeReference { .. }
                | Self::AmbiguousSuccessor { .. }
                | Self::MissingEntryNode
                | Self::MultipleEntryNodes(_)
                | Self::UnknownInstruction { .. }
                | Self::InvalidDefinition(_)
                | Self::StepLimitExceeded { .. }
        )
    }
}
