//! Database collaborator interface
//!
//! The manager only needs three capabilities from a driver: begin a
//! transaction at an isolation level, commit it, and roll it back. Connection
//! pooling, SQL execution and the wire protocol stay inside the driver.

use async_trait::async_trait;
use tessera_core::{BoxError, Context, ContextError, IsolationLevel};
use thiserror::Error;

/// Result type alias for driver operations
pub type DatabaseResult<T> = std::result::Result<T, DatabaseError>;

/// Errors reported by a database driver
#[derive(Debug, Error)]
pub enum DatabaseError {
    /// No connection could be obtained (pool exhausted, dial failure)
    #[error("database connection error: {0}")]
    Connection(String),

    /// The context ended before the operation could run
    #[error(transparent)]
    Context(#[from] ContextError),

    /// The backend rejected the operation
    #[error("database error: {0}")]
    Backend(#[source] BoxError),

    /// Commit or rollback was requested on a transaction that already ended
    #[error("transaction already resolved")]
    AlreadyResolved,
}

impl DatabaseError {
    /// Wrap a driver error
    pub fn backend(err: impl Into<BoxError>) -> Self {
        DatabaseError::Backend(err.into())
    }

    /// Whether this is a connection-level failure rather than a rejected command
    pub fn is_connection(&self) -> bool {
        matches!(self, DatabaseError::Connection(_))
    }
}

/// Handle to an active transaction
///
/// Terminal operations take `&self` because the handle is shared (`Arc`)
/// with nested invocations through the context. Implementations must make
/// the second terminal call fail with `DatabaseError::AlreadyResolved`
/// without touching the backend.
///
/// The manager rolls back a handle whose owner is cancelled mid-work, but that
/// rollback runs on a spawned task. Implementations holding a live backend
/// transaction should also abort it when the last handle is dropped
/// unresolved, as sqlx does.
#[async_trait]
pub trait Transaction: Send + Sync + 'static {
    /// Make the transaction's effects durable
    async fn commit(&self, ctx: &Context) -> DatabaseResult<()>;

    /// Discard the transaction's effects
    async fn rollback(&self, ctx: &Context) -> DatabaseResult<()>;
}

/// A database that can start transactions
#[async_trait]
pub trait Database: Send + Sync + 'static {
    /// Handle type produced by `begin_transaction`
    type Transaction: Transaction;

    /// Begin a new transaction at `isolation`
    async fn begin_transaction(
        &self,
        ctx: &Context,
        isolation: IsolationLevel,
    ) -> DatabaseResult<Self::Transaction>;
}
