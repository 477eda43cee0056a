//! Read-only, session-hardened query execution for Postgres pools.
//!
//! [`QueryExecutor`] runs pre-approved SQL: one `READ ONLY` transaction per
//! attempt, confined by [`SessionHardener`] (statement timeout, search path,
//! optional role), bounded in time and rows, with exponential backoff on
//! transient failures. Results come back as JSON-ready rows.
//!
//! Pools plug in through [`ConnectionPool`]; [`AsyncPool`] is a generic
//! bounded pool and, with the `postgres` feature, [`postgres::PgPool`] wraps
//! it around tokio-postgres.

pub mod async_pool;
pub mod classify;
pub mod error;
pub mod executor;
pub mod hardener;
pub mod limiter;
pub mod policy;
pub mod session;
pub mod value;

#[cfg(all(feature = "postgres", not(target_arch = "wasm32")))]
pub mod postgres;

pub use async_pool::{AcquireError, AsyncPool, AsyncPooled};
pub use classify::{Classification, DEFAULT_TRANSIENT_CODES, TransientCodes, classify};
pub use error::{AttemptError, BackendError, ErrorContext, ExecutorError, FailureClass};
pub use executor::{ExecutionRequest, ExecutionResult, QueryExecutor};
pub use hardener::{SessionHardener, SessionSettings};
pub use limiter::limit_rows;
pub use policy::{PolicyError, RetryPolicy, SecurityPolicy};
pub use session::{ConnectionPool, Session};
pub use value::{JsonRow, PgInterval, PgValue, Row, serialize, serialize_row};
