//! Transaction manager: the transactional execution boundary
//!
//! `run_in_transaction` either begins a transaction (owner) or joins the one
//! already carried by the context (join). Only the owner resolves.
//!
//! ## Owner Sequence
//!
//! ```text
//! 1. begin_transaction(isolation)   - failure: Begin error, nothing to clean up
//! 2. ctx' = with_transaction(ctx)   - nested calls now join
//! 3. work(ctx') under catch_unwind  - error or panic both count as failure
//! 4. failure → rollback             - rollback failure compounds the cause
//!    success → commit               - commit failure is the call's failure
//! ```
//!
//! Every owner path ends in exactly one commit or one rollback. Nothing is
//! retried here; retry policy belongs around the whole call.

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures::FutureExt;
use tessera_core::{BoxError, Context, Error as CoreError, IsolationLevel};
use tracing::{debug, error, trace, warn};

use crate::carrier;
use crate::database::Database;
use crate::error::{TransactionError, TransactionResult};
use crate::transaction::OwnedTransaction;

/// Snapshot of transaction statistics
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct TransactionMetrics {
    /// Transactions begun and not yet resolved
    pub active_count: u64,
    /// Transactions begun by this manager
    pub total_started: u64,
    /// Transactions committed
    pub total_committed: u64,
    /// Transactions rolled back after a failure or panic
    pub total_rolled_back: u64,
    /// Commits rejected by the backend
    pub total_commit_failures: u64,
    /// Nested regions that joined an existing transaction
    pub total_joined: u64,
    /// Panics recovered at the boundary
    pub total_panics: u64,
    /// Committed / started
    pub commit_rate: f64,
}

/// Runs units of work inside database transactions
///
/// Holds no per-call state; share it behind an `Arc` across tasks.
///
/// The metric counters use Relaxed ordering: they are observational only and
/// synchronize nothing else.
pub struct TransactionManager<D: Database> {
    db: D,
    default_isolation: IsolationLevel,
    next_txn_id: AtomicU64,
    active_count: AtomicU64,
    total_started: AtomicU64,
    total_committed: AtomicU64,
    total_rolled_back: AtomicU64,
    total_commit_failures: AtomicU64,
    total_joined: AtomicU64,
    total_panics: AtomicU64,
}

impl<D: Database> TransactionManager<D> {
    /// Create a manager whose default isolation is read committed
    pub fn new(db: D) -> Self {
        Self::with_default_isolation(db, IsolationLevel::default())
    }

    /// Create a manager with an explicit default isolation level
    ///
    /// The default is used by `run_default`; `run_in_transaction` always
    /// takes the level it is given.
    pub fn with_default_isolation(db: D, isolation: IsolationLevel) -> Self {
        Self {
            db,
            default_isolation: isolation,
            next_txn_id: AtomicU64::new(1),
            active_count: AtomicU64::new(0),
            total_started: AtomicU64::new(0),
            total_committed: AtomicU64::new(0),
            total_rolled_back: AtomicU64::new(0),
            total_commit_failures: AtomicU64::new(0),
            total_joined: AtomicU64::new(0),
            total_panics: AtomicU64::new(0),
        }
    }

    /// The underlying database collaborator
    pub fn database(&self) -> &D {
        &self.db
    }

    /// Isolation level used by `run_default`
    pub fn default_isolation(&self) -> IsolationLevel {
        self.default_isolation
    }

    /// Run `work` in a read-committed transaction
    pub async fn read_committed<F, Fut, T, E>(&self, ctx: &Context, work: F) -> TransactionResult<T>
    where
        F: FnOnce(Context) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Into<BoxError>,
    {
        self.run_in_transaction(ctx, IsolationLevel::ReadCommitted, work)
            .await
    }

    /// Run `work` at the manager's default isolation level
    pub async fn run_default<F, Fut, T, E>(&self, ctx: &Context, work: F) -> TransactionResult<T>
    where
        F: FnOnce(Context) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Into<BoxError>,
    {
        self.run_in_transaction(ctx, self.default_isolation, work)
            .await
    }

    /// Execute `work` inside a transaction
    ///
    /// If `ctx` already carries a transaction of this database, `work` runs
    /// with `ctx` unchanged and the outer owner resolves. Otherwise a new
    /// transaction is begun at `isolation`, attached to the context handed to
    /// `work`, and committed or rolled back here.
    ///
    /// A panic inside `work` is recovered and reported as
    /// `TransactionError::Panic` after rolling back; it never unwinds past
    /// this call when this call is the owner.
    ///
    /// # Errors
    ///
    /// - `Begin` when the transaction could not be started
    /// - `Work` / `Panic` when the unit of work failed and rollback succeeded
    /// - `Rollback` when the unit of work failed and rollback failed too
    /// - `Commit` when the unit of work succeeded but the commit did not
    /// - `Carrier` when `ctx` carries a transaction of a different database
    pub async fn run_in_transaction<F, Fut, T, E>(
        &self,
        ctx: &Context,
        isolation: IsolationLevel,
        work: F,
    ) -> TransactionResult<T>
    where
        F: FnOnce(Context) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Into<BoxError>,
    {
        if carrier::transaction_of::<D::Transaction>(ctx).is_some() {
            self.total_joined.fetch_add(1, Ordering::Relaxed);
            trace!(target: "tessera::txn", "Joining active transaction");
            return work(ctx.clone())
                .await
                .map_err(|e| TransactionError::from_work(e.into()));
        }

        if carrier::has_transaction(ctx) {
            warn!(
                target: "tessera::txn",
                "Context carries a transaction of another database"
            );
            return Err(TransactionError::Carrier(
                CoreError::TransactionAlreadyBound,
            ));
        }

        let handle = match self.db.begin_transaction(ctx, isolation).await {
            Ok(handle) => Arc::new(handle),
            Err(e) => {
                warn!(target: "tessera::txn", error = %e, "Cannot begin transaction");
                return Err(TransactionError::Begin(e));
            }
        };

        let txn_id = self.next_txn_id.fetch_add(1, Ordering::Relaxed);
        self.record_start();
        let unresolved = UnresolvedGuard { manager: self };
        debug!(target: "tessera::txn", txn_id, isolation = %isolation, "Transaction started");

        let mut owned = OwnedTransaction::begun(txn_id, Arc::clone(&handle));

        let result = match carrier::with_transaction(ctx, handle) {
            Ok(tx_ctx) => {
                let outcome = AssertUnwindSafe(async move { work(tx_ctx).await })
                    .catch_unwind()
                    .await;
                match outcome {
                    Ok(Ok(value)) => self.resolve_success(ctx, &mut owned, value).await,
                    Ok(Err(e)) => {
                        let cause = TransactionError::from_work(e.into());
                        Err(self.resolve_failure(ctx, &mut owned, cause).await)
                    }
                    Err(payload) => {
                        self.total_panics.fetch_add(1, Ordering::Relaxed);
                        let message = panic_message(payload.as_ref());
                        error!(
                            target: "tessera::txn",
                            txn_id,
                            panic = %message,
                            "Panic recovered inside transaction"
                        );
                        let cause = TransactionError::Panic { message };
                        Err(self.resolve_failure(ctx, &mut owned, cause).await)
                    }
                }
            }
            Err(e) => Err(self
                .resolve_failure(ctx, &mut owned, TransactionError::Carrier(e))
                .await),
        };

        unresolved.disarm();
        result
    }

    async fn resolve_success<T>(
        &self,
        ctx: &Context,
        owned: &mut OwnedTransaction<D::Transaction>,
        value: T,
    ) -> TransactionResult<T> {
        match owned.commit(ctx).await {
            Ok(()) => {
                self.record_commit();
                debug!(target: "tessera::txn", txn_id = owned.txn_id(), "Transaction committed");
                Ok(value)
            }
            Err(e) => {
                self.record_commit_failure();
                error!(
                    target: "tessera::txn",
                    txn_id = owned.txn_id(),
                    error = %e,
                    "Transaction commit failed"
                );
                Err(e)
            }
        }
    }

    async fn resolve_failure(
        &self,
        ctx: &Context,
        owned: &mut OwnedTransaction<D::Transaction>,
        cause: TransactionError,
    ) -> TransactionError {
        warn!(
            target: "tessera::txn",
            txn_id = owned.txn_id(),
            error = %cause,
            "Rolling back transaction"
        );
        let err = owned.rollback(ctx, cause).await;
        self.record_rollback();
        if err.is_rollback_failure() {
            error!(
                target: "tessera::txn",
                txn_id = owned.txn_id(),
                error = %err,
                "Transaction rollback failed"
            );
        }
        err
    }

    fn record_start(&self) {
        self.active_count.fetch_add(1, Ordering::Relaxed);
        self.total_started.fetch_add(1, Ordering::Relaxed);
    }

    fn finish_active(&self) {
        // Saturating decrement to prevent underflow
        let _ = self
            .active_count
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |x| {
                Some(x.saturating_sub(1))
            });
    }

    fn record_commit(&self) {
        self.finish_active();
        self.total_committed.fetch_add(1, Ordering::Relaxed);
    }

    fn record_commit_failure(&self) {
        self.finish_active();
        self.total_commit_failures.fetch_add(1, Ordering::Relaxed);
    }

    fn record_rollback(&self) {
        self.finish_active();
        self.total_rolled_back.fetch_add(1, Ordering::Relaxed);
    }

    /// Get transaction metrics
    pub fn metrics(&self) -> TransactionMetrics {
        let started = self.total_started.load(Ordering::Relaxed);
        let committed = self.total_committed.load(Ordering::Relaxed);

        TransactionMetrics {
            active_count: self.active_count.load(Ordering::Relaxed),
            total_started: started,
            total_committed: committed,
            total_rolled_back: self.total_rolled_back.load(Ordering::Relaxed),
            total_commit_failures: self.total_commit_failures.load(Ordering::Relaxed),
            total_joined: self.total_joined.load(Ordering::Relaxed),
            total_panics: self.total_panics.load(Ordering::Relaxed),
            commit_rate: if started > 0 {
                committed as f64 / started as f64
            } else {
                0.0
            },
        }
    }
}

/// Counts an owner dropped before resolving as a rollback
///
/// `OwnedTransaction` issues the rollback itself when it is dropped `Active`.
struct UnresolvedGuard<'a, D: Database> {
    manager: &'a TransactionManager<D>,
}

impl<D: Database> UnresolvedGuard<'_, D> {
    fn disarm(self) {
        std::mem::forget(self);
    }
}

impl<D: Database> Drop for UnresolvedGuard<'_, D> {
    fn drop(&mut self) {
        self.manager.record_rollback();
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "(non-string panic)".to_string()
    }
}
