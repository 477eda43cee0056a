//! The pool and session seams the executor runs against.

use async_trait::async_trait;

use crate::error::BackendError;
use crate::value::Row;

/// A live database session checked out of a pool.
///
/// Dropping the session hands the connection back to its pool. A pool must
/// never reuse a connection that comes back with a transaction still open
/// (an attempt abandoned on timeout does exactly that): it discards the
/// connection or resets it first. Session settings applied by the hardener
/// are transaction-scoped and rely on this.
#[async_trait]
pub trait Session: Send {
    /// Open a `READ ONLY` transaction.
    async fn begin_read_only(&mut self) -> Result<(), BackendError>;

    /// Run a statement that returns no rows.
    async fn execute(&mut self, statement: &str) -> Result<(), BackendError>;

    /// Run a query and collect every row it produces.
    async fn fetch(&mut self, sql: &str) -> Result<Vec<Row>, BackendError>;

    async fn commit(&mut self) -> Result<(), BackendError>;

    async fn rollback(&mut self) -> Result<(), BackendError>;
}

/// Source of sessions; acquisition may wait for a free connection.
#[async_trait]
pub trait ConnectionPool: Send + Sync {
    type Session: Session;

    async fn acquire(&self) -> Result<Self::Session, BackendError>;
}
