//! Owner-side transaction lifecycle
//!
//! State transitions:
//! - `NotStarted` → `Active` (successful begin)
//! - `Active` → `Committed` (commit accepted)
//! - `Active` → `RolledBack` (rollback issued, or commit rejected)
//!
//! Terminal states (no transitions allowed):
//! - `Committed`
//! - `RolledBack`
//!
//! A rejected commit lands in `RolledBack` because the backend aborts a
//! transaction whose COMMIT fails; no further rollback is sent.
//!
//! An `OwnedTransaction` dropped while still `Active` (its owner's future was
//! cancelled) moves to `RolledBack` and rolls the handle back on the current
//! tokio runtime.

use std::sync::Arc;

use tessera_core::Context;
use tracing::{error, warn};

use crate::database::Transaction;
use crate::error::{TransactionError, TransactionResult};

/// Status of an owned transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionStatus {
    /// Begin has not succeeded yet
    NotStarted,
    /// Begun and not yet resolved
    Active,
    /// Commit accepted by the backend
    Committed,
    /// Rolled back, or aborted by the backend on a failed commit
    RolledBack,
}

impl TransactionStatus {
    /// Whether no further transition is possible
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransactionStatus::Committed | TransactionStatus::RolledBack
        )
    }
}

/// A transaction together with the status its owner tracks
///
/// Guarantees at most one terminal call reaches the backend handle.
pub(crate) struct OwnedTransaction<T: Transaction> {
    txn_id: u64,
    handle: Arc<T>,
    status: TransactionStatus,
}

impl<T: Transaction> OwnedTransaction<T> {
    /// Wrap a freshly begun handle
    pub(crate) fn begun(txn_id: u64, handle: Arc<T>) -> Self {
        Self {
            txn_id,
            handle,
            status: TransactionStatus::Active,
        }
    }

    pub(crate) fn txn_id(&self) -> u64 {
        self.txn_id
    }

    pub(crate) fn status(&self) -> TransactionStatus {
        self.status
    }

    fn ensure_active(&self) -> TransactionResult<()> {
        if self.status == TransactionStatus::Active {
            Ok(())
        } else {
            Err(TransactionError::InvalidState(format!(
                "transaction {} is {:?}",
                self.txn_id, self.status
            )))
        }
    }

    /// Issue the commit
    ///
    /// `Active` → `Committed` on success, `Active` → `RolledBack` on failure.
    pub(crate) async fn commit(&mut self, ctx: &Context) -> TransactionResult<()> {
        self.ensure_active()?;
        let result = self.handle.commit(ctx).await;
        self.status = if result.is_ok() {
            TransactionStatus::Committed
        } else {
            TransactionStatus::RolledBack
        };
        result.map_err(TransactionError::Commit)
    }

    /// Issue the rollback after `cause`, returning the error the caller sees
    ///
    /// `Active` → `RolledBack` whether or not the backend accepted it. A
    /// rejected rollback is folded into the returned error next to `cause`.
    pub(crate) async fn rollback(
        &mut self,
        ctx: &Context,
        cause: TransactionError,
    ) -> TransactionError {
        if let Err(e) = self.ensure_active() {
            return e;
        }
        let result = self.handle.rollback(ctx).await;
        self.status = TransactionStatus::RolledBack;
        match result {
            Ok(()) => cause,
            Err(rollback) => TransactionError::Rollback {
                cause: Box::new(cause),
                rollback,
            },
        }
    }
}

impl<T: Transaction> Drop for OwnedTransaction<T> {
    fn drop(&mut self) {
        if self.status != TransactionStatus::Active {
            return;
        }
        self.status = TransactionStatus::RolledBack;
        let txn_id = self.txn_id;
        warn!(
            target: "tessera::txn",
            txn_id,
            "Transaction dropped before resolving, rolling back"
        );

        let handle = Arc::clone(&self.handle);
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    if let Err(e) = handle.rollback(&Context::background()).await {
                        error!(
                            target: "tessera::txn",
                            txn_id,
                            error = %e,
                            "Rollback of abandoned transaction failed"
                        );
                    }
                });
            }
            Err(_) => {
                error!(
                    target: "tessera::txn",
                    txn_id,
                    "No runtime to roll back abandoned transaction"
                );
            }
        }
    }
}
