//! `store` crate: the persistence contract consumed by the engine.
//!
//! Provides the [`Store`] trait, typed rows and status enums, an in-memory
//! implementation, and a Postgres implementation (connection pool,
//! migrations, repository functions). No business logic lives here beyond
//! the status guards the contract requires.

pub mod error;
pub mod memory;
pub mod models;
pub mod pool;
pub mod postgres;
pub mod repository;
pub mod traits;

pub use error::StoreError;
pub use memory::MemoryStore;
pub use models::{
    ExecutionRow, ExecutionState, ExecutionStatus, JobRow, JobStatus, JobUpdate, NewJob,
    WorkflowRow,
};
pub use pool::DbPool;
pub use postgres::PgStore;
pub use traits::Store;
