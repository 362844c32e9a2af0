//! Errors returned by the transaction manager
//!
//! Every `Err` means the unit of work's effects are not durably committed.

use std::error::Error as StdError;

use tessera_core::BoxError;
use thiserror::Error;

use crate::database::DatabaseError;

/// Result type alias for transactional execution
pub type TransactionResult<T> = std::result::Result<T, TransactionError>;

/// Outcome classification for `run_in_transaction`
#[derive(Debug, Error)]
pub enum TransactionError {
    /// The transaction could not be started; nothing to clean up
    #[error("cannot begin transaction: {0}")]
    Begin(#[source] DatabaseError),

    /// The unit of work returned an error
    #[error("failed executing code inside transaction: {0}")]
    Work(#[source] BoxError),

    /// The unit of work panicked; the panic was recovered at the boundary
    #[error("panic recovered: {message}")]
    Panic {
        /// Panic payload rendered as text
        message: String,
    },

    /// Rolling back after a failure also failed
    #[error("{cause}; rollback failed: {rollback}")]
    Rollback {
        /// The failure that triggered the rollback
        #[source]
        cause: Box<TransactionError>,
        /// Why the rollback failed
        rollback: DatabaseError,
    },

    /// The unit of work succeeded but the commit did not
    #[error("transaction commit failed: {0}")]
    Commit(#[source] DatabaseError),

    /// A terminal operation was requested on an already-resolved transaction
    #[error("invalid transaction state: {0}")]
    InvalidState(String),

    /// The context could not carry the transaction
    #[error("cannot attach transaction to context: {0}")]
    Carrier(#[from] tessera_core::Error),
}

impl TransactionError {
    /// Classify an error returned by a unit of work
    ///
    /// A `Work` error coming back from a nested region is passed through
    /// as-is so joined regions do not stack wrappers. Anything else becomes
    /// the source of a new `Work` error.
    pub fn from_work(err: BoxError) -> Self {
        match err.downcast::<TransactionError>() {
            Ok(inner) => match *inner {
                TransactionError::Work(source) => TransactionError::Work(source),
                other => TransactionError::Work(Box::new(other)),
            },
            Err(err) => TransactionError::Work(err),
        }
    }

    /// Whether a panic inside the unit of work caused this error
    pub fn is_panic(&self) -> bool {
        match self {
            TransactionError::Panic { .. } => true,
            TransactionError::Rollback { cause, .. } => cause.is_panic(),
            _ => false,
        }
    }

    /// Whether the rollback itself failed
    pub fn is_rollback_failure(&self) -> bool {
        matches!(self, TransactionError::Rollback { .. })
    }

    /// Whether the unit of work succeeded and the commit failed
    pub fn is_commit_failure(&self) -> bool {
        matches!(self, TransactionError::Commit(_))
    }

    /// Whether the transaction was never started
    pub fn is_begin_failure(&self) -> bool {
        matches!(self, TransactionError::Begin(_))
    }

    /// The error returned by the unit of work, looking through a failed rollback
    pub fn work_error(&self) -> Option<&(dyn StdError + Send + Sync + 'static)> {
        match self {
            TransactionError::Work(source) => Some(source.as_ref()),
            TransactionError::Rollback { cause, .. } => cause.work_error(),
            _ => None,
        }
    }
}
