//! `instructions` crate: the `Instruction` trait, the registry, and the
//! built-in instructions.
//!
//! Every node type must implement [`Instruction`]. The engine crate
//! dispatches execution through this trait object, looked up by type name
//! in an [`InstructionRegistry`].

pub mod calculation;
pub mod condition;
pub mod delay;
pub mod error;
pub mod expression;
pub mod mock;
pub mod registry;
pub mod request;
pub mod traits;
pub mod transport;

pub use calculation::CalculationInstruction;
pub use condition::ConditionInstruction;
pub use delay::DelayInstruction;
pub use error::NodeError;
pub use registry::InstructionRegistry;
pub use request::RequestInstruction;
pub use traits::{Completion, ExecutionContext, Instruction, Outcome, PendingTask, Port};
pub use transport::{ReqwestTransport, Transport};
