//! The `Instruction` trait, the contract every node type must fulfil,
//! and the outcome types it hands back to the engine.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::str::FromStr;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::NodeError;

/// Shared context passed to every instruction during execution.
///
/// Defined here (in the instructions crate) so both the engine and
/// individual instructions can import it without a circular dependency.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    /// ID of the parent workflow.
    pub workflow_id: uuid::Uuid,
    /// ID of the current execution run.
    pub execution_id: uuid::Uuid,
    /// ID of the node being run.
    pub node_id: String,
    /// Resolver scope (`$context`, `$jobsMapByNodeId`, `$system`) at the
    /// time the node was reached.
    pub scope: Value,
}

// ---------------------------------------------------------------------------
// Port
// ---------------------------------------------------------------------------

/// Outcome label an instruction settles on. The engine follows the edge
/// leaving the node on this port.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Port {
    #[default]
    Default,
    True,
    False,
}

impl Port {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Default => "default",
            Self::True => "true",
            Self::False => "false",
        }
    }
}

impl From<bool> for Port {
    fn from(value: bool) -> Self {
        if value { Self::True } else { Self::False }
    }
}

impl fmt::Display for Port {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Port {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "default" => Ok(Self::Default),
            "true" => Ok(Self::True),
            "false" => Ok(Self::False),
            other => Err(format!("unknown port: {other}")),
        }
    }
}

// ---------------------------------------------------------------------------
// Completion / Outcome
// ---------------------------------------------------------------------------

/// A settled job: what the instruction produced and whether it succeeded.
#[derive(Debug, Clone, PartialEq)]
pub enum Completion {
    Resolved { result: Value, port: Port },
    Failed { result: Value },
}

impl Completion {
    pub fn resolved(result: Value) -> Self {
        Self::Resolved { result, port: Port::Default }
    }

    pub fn branch(result: Value, port: Port) -> Self {
        Self::Resolved { result, port }
    }

    pub fn failed(result: Value) -> Self {
        Self::Failed { result }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed { .. })
    }

    pub fn result(&self) -> &Value {
        match self {
            Self::Resolved { result, .. } | Self::Failed { result } => result,
        }
    }

    /// Failed jobs leave on the default port when the node tolerates failure.
    pub fn port(&self) -> Port {
        match self {
            Self::Resolved { port, .. } => *port,
            Self::Failed { .. } => Port::Default,
        }
    }

    pub fn into_result(self) -> Value {
        match self {
            Self::Resolved { result, .. } | Self::Failed { result } => result,
        }
    }
}

/// Work an asynchronous instruction hands to the engine. It runs on its own
/// task; the engine applies its `Completion` when it finishes.
pub type PendingTask = Pin<Box<dyn Future<Output = Completion> + Send + 'static>>;

/// What `Instruction::run` returns.
pub enum Outcome {
    /// Settled synchronously.
    Settled(Completion),
    /// Settles later; the job is parked as pending until then.
    Pending(PendingTask),
}

impl Outcome {
    pub fn pending<F>(task: F) -> Self
    where
        F: Future<Output = Completion> + Send + 'static,
    {
        Self::Pending(Box::pin(task))
    }
}

impl From<Completion> for Outcome {
    fn from(completion: Completion) -> Self {
        Self::Settled(completion)
    }
}

impl fmt::Debug for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Settled(c) => f.debug_tuple("Settled").field(c).finish(),
            Self::Pending(_) => f.write_str("Pending(..)"),
        }
    }
}

// ---------------------------------------------------------------------------
// Instruction
// ---------------------------------------------------------------------------

/// The core handler trait.
///
/// `config` arrives with every placeholder already resolved. Returning
/// `Err` means the instruction could not run; handler-level failures are
/// reported as [`Completion::Failed`].
#[async_trait]
pub trait Instruction: Send + Sync {
    async fn run(&self, config: Value, ctx: &ExecutionContext) -> Result<Outcome, NodeError>;
}
