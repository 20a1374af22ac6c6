//! Postgres repository functions, one per database operation.
//!
//! Every function takes a `&DbPool` and returns a `Result<T, StoreError>`.
//! No business logic beyond the state-machine guards the `Store` contract
//! requires, which run inside a transaction holding the row lock.
//!
//! Queries are built at runtime (`sqlx::query_as`), so the crate compiles
//! without a live database.

pub mod workflows;
pub mod executions;
pub mod jobs;
