//! `engine` crate: workflow models, graph validation, the expression
//! resolver and the execution state machine.

pub mod context;
pub mod error;
pub mod executor;
pub mod graph;
pub mod models;
pub mod resolver;

pub use context::RunContext;
pub use error::EngineError;
pub use executor::{EngineConfig, ExecutionEvent, WorkflowExecutor};
pub use graph::validate_graph;
pub use models::{Edge, NodeDefinition, Trigger, Workflow};
pub use resolver::{resolve, ResolutionError};
