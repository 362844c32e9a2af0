//! Request-scoped context
//!
//! A `Context` is threaded through a call tree and carries:
//! - an optional deadline
//! - zero or more cancellation signals (inherited from every ancestor)
//! - at most one transaction association
//!
//! Contexts are immutable. Every `with_*` method returns a new child value and
//! leaves the receiver untouched, so a transaction attached for one call tree
//! is never visible to a sibling tree holding the parent context.
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//! use tessera_core::Context;
//!
//! let root = Context::background();
//! let (ctx, cancel) = root.with_cancel();
//! let ctx = ctx.with_timeout(Duration::from_secs(5));
//!
//! assert!(ctx.err().is_none());
//! cancel.cancel();
//! assert!(ctx.err().is_some());
//! assert!(root.err().is_none());
//! ```

use std::any::Any;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::error::{ContextError, Error, Result};

type TransactionSlot = Arc<dyn Any + Send + Sync>;

/// Immutable request-scoped carrier
///
/// Cloning is cheap (one `Arc` increment).
#[derive(Clone, Default)]
pub struct Context {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    deadline: Option<Instant>,
    signals: Vec<Arc<CancelState>>,
    transaction: Option<TransactionSlot>,
}

#[derive(Default)]
struct CancelState {
    cancelled: AtomicBool,
    notify: Notify,
}

impl CancelState {
    fn cancel(&self) {
        if !self.cancelled.swap(true, Ordering::SeqCst) {
            self.notify.notify_waiters();
        }
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    async fn wait(&self) {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register before checking the flag so a concurrent cancel is not missed
            notified.as_mut().enable();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

/// Handle that cancels the context returned alongside it
///
/// Dropping the handle does NOT cancel the context.
#[derive(Clone)]
pub struct CancelHandle {
    state: Arc<CancelState>,
}

impl CancelHandle {
    /// Cancel the associated context and every context derived from it
    pub fn cancel(&self) {
        self.state.cancel();
    }

    /// Check whether `cancel` has been called
    pub fn is_cancelled(&self) -> bool {
        self.state.is_cancelled()
    }
}

impl fmt::Debug for CancelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelHandle")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

impl Context {
    /// Root context: no deadline, never cancelled, no transaction
    pub fn background() -> Self {
        Self::default()
    }

    fn derive(&self, f: impl FnOnce(&mut Inner)) -> Context {
        let mut inner = Inner {
            deadline: self.inner.deadline,
            signals: self.inner.signals.clone(),
            transaction: self.inner.transaction.clone(),
        };
        f(&mut inner);
        Context {
            inner: Arc::new(inner),
        }
    }

    /// Derive a child with the given deadline
    ///
    /// A deadline later than the parent's is clamped to the parent's.
    pub fn with_deadline(&self, deadline: Instant) -> Context {
        self.derive(|inner| {
            inner.deadline = Some(match inner.deadline {
                Some(existing) => existing.min(deadline),
                None => deadline,
            });
        })
    }

    /// Derive a child whose deadline is `timeout` from now
    pub fn with_timeout(&self, timeout: Duration) -> Context {
        self.with_deadline(Instant::now() + timeout)
    }

    /// Derive a cancellable child
    ///
    /// The child is cancelled when the returned handle is cancelled or when
    /// any ancestor is cancelled.
    pub fn with_cancel(&self) -> (Context, CancelHandle) {
        let state = Arc::new(CancelState::default());
        let ctx = self.derive(|inner| inner.signals.push(Arc::clone(&state)));
        (ctx, CancelHandle { state })
    }

    /// Deadline of this context, if any
    pub fn deadline(&self) -> Option<Instant> {
        self.inner.deadline
    }

    /// Time left until the deadline (zero once it has passed)
    pub fn remaining(&self) -> Option<Duration> {
        self.inner
            .deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    /// Why this context stopped accepting work, if it has
    pub fn err(&self) -> Option<ContextError> {
        if self.inner.signals.iter().any(|s| s.is_cancelled()) {
            return Some(ContextError::Cancelled);
        }
        match self.inner.deadline {
            Some(deadline) if Instant::now() >= deadline => Some(ContextError::DeadlineExceeded),
            _ => None,
        }
    }

    /// `Ok(())` while the context is live
    pub fn check(&self) -> std::result::Result<(), ContextError> {
        match self.err() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Wait until the context is cancelled or its deadline passes
    ///
    /// Never resolves for a context with neither a deadline nor a cancel signal.
    pub async fn done(&self) -> ContextError {
        if let Some(err) = self.err() {
            return err;
        }

        let cancelled = async {
            if self.inner.signals.is_empty() {
                future::pending::<()>().await;
            } else {
                future::select_all(self.inner.signals.iter().map(|s| Box::pin(s.wait()))).await;
            }
            ContextError::Cancelled
        };

        let expired = async {
            match self.inner.deadline {
                Some(deadline) => {
                    tokio::time::sleep_until(deadline).await;
                    ContextError::DeadlineExceeded
                }
                None => future::pending().await,
            }
        };

        tokio::select! {
            err = cancelled => err,
            err = expired => err,
        }
    }

    /// Run `fut` until it completes or the context ends, whichever comes first
    ///
    /// `fut` is dropped (not polled further) when the context ends first.
    pub async fn run<F: Future>(&self, fut: F) -> std::result::Result<F::Output, ContextError> {
        self.check()?;
        tokio::select! {
            biased;
            err = self.done() => Err(err),
            out = fut => Ok(out),
        }
    }

    /// Derive a child carrying `handle` as its transaction
    ///
    /// # Errors
    ///
    /// `Error::TransactionAlreadyBound` if this context already carries one.
    pub fn with_transaction<T: Any + Send + Sync>(&self, handle: Arc<T>) -> Result<Context> {
        if self.inner.transaction.is_some() {
            return Err(Error::TransactionAlreadyBound);
        }
        let slot: TransactionSlot = handle;
        Ok(self.derive(|inner| inner.transaction = Some(slot)))
    }

    /// The transaction carried by this context, if it is a `T`
    pub fn transaction<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        Arc::clone(self.inner.transaction.as_ref()?).downcast::<T>().ok()
    }

    /// Whether any transaction is carried, whatever its type
    pub fn has_transaction(&self) -> bool {
        self.inner.transaction.is_some()
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("deadline", &self.inner.deadline)
            .field("signals", &self.inner.signals.len())
            .field("transaction", &self.inner.transaction.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct FakeTx(u32);

    #[test]
    fn test_background_is_live() {
        let ctx = Context::background();
        assert!(ctx.err().is_none());
        assert!(ctx.deadline().is_none());
        assert!(!ctx.has_transaction());
    }

    #[test]
    fn test_with_transaction_does_not_mutate_parent() {
        let root = Context::background();
        let child = root.with_transaction(Arc::new(FakeTx(1))).unwrap();

        assert!(!root.has_transaction());
        assert!(root.transaction::<FakeTx>().is_none());
        assert_eq!(child.transaction::<FakeTx>().unwrap().0, 1);
    }

    #[test]
    fn test_transaction_lookup_is_repeatable() {
        let ctx = Context::background()
            .with_transaction(Arc::new(FakeTx(7)))
            .unwrap();
        let first = ctx.transaction::<FakeTx>().unwrap();
        let second = ctx.transaction::<FakeTx>().unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn test_rebinding_transaction_fails() {
        let ctx = Context::background()
            .with_transaction(Arc::new(FakeTx(1)))
            .unwrap();
        let err = ctx.with_transaction(Arc::new(FakeTx(2))).unwrap_err();
        assert!(matches!(err, Error::TransactionAlreadyBound));
        assert_eq!(ctx.transaction::<FakeTx>().unwrap().0, 1);
    }

    #[test]
    fn test_transaction_survives_derivation() {
        let ctx = Context::background()
            .with_transaction(Arc::new(FakeTx(3)))
            .unwrap();
        let (child, _cancel) = ctx.with_timeout(Duration::from_secs(1)).with_cancel();
        let a = ctx.transaction::<FakeTx>().unwrap();
        let b = child.transaction::<FakeTx>().unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn test_wrong_type_lookup_returns_none() {
        let ctx = Context::background()
            .with_transaction(Arc::new(FakeTx(1)))
            .unwrap();
        assert!(ctx.transaction::<String>().is_none());
        assert!(ctx.has_transaction());
    }

    #[test]
    fn test_cancel_propagates_to_children_only() {
        let root = Context::background();
        let (parent, cancel) = root.with_cancel();
        let child = parent.with_timeout(Duration::from_secs(60));

        cancel.cancel();
        assert_eq!(parent.err(), Some(ContextError::Cancelled));
        assert_eq!(child.err(), Some(ContextError::Cancelled));
        assert!(root.err().is_none());
        assert!(cancel.is_cancelled());
    }

    #[test]
    fn test_child_deadline_is_clamped() {
        let parent = Context::background().with_timeout(Duration::from_millis(50));
        let child = parent.with_timeout(Duration::from_secs(60));
        assert_eq!(child.deadline(), parent.deadline());

        let tighter = parent.with_timeout(Duration::from_millis(1));
        assert!(tighter.deadline().unwrap() <= parent.deadline().unwrap());
    }

    #[tokio::test]
    async fn test_deadline_expires() {
        let ctx = Context::background().with_timeout(Duration::from_millis(10));
        let err = ctx.done().await;
        assert_eq!(err, ContextError::DeadlineExceeded);
        assert_eq!(ctx.check(), Err(ContextError::DeadlineExceeded));
        assert_eq!(ctx.remaining(), Some(Duration::ZERO));
    }

    #[tokio::test]
    async fn test_done_wakes_on_cancel() {
        let (ctx, cancel) = Context::background().with_cancel();
        let waiter = tokio::spawn({
            let ctx = ctx.clone();
            async move { ctx.done().await }
        });
        tokio::time::sleep(Duration::from_millis(5)).await;
        cancel.cancel();
        assert_eq!(waiter.await.unwrap(), ContextError::Cancelled);
    }

    #[tokio::test]
    async fn test_run_completes_before_deadline() {
        let ctx = Context::background().with_timeout(Duration::from_secs(5));
        let out = ctx.run(async { 42 }).await;
        assert_eq!(out, Ok(42));
    }

    #[tokio::test]
    async fn test_run_aborts_on_deadline() {
        let ctx = Context::background().with_timeout(Duration::from_millis(10));
        let out = ctx.run(future::pending::<()>()).await;
        assert_eq!(out, Err(ContextError::DeadlineExceeded));
    }

    #[tokio::test]
    async fn test_run_rejects_already_cancelled() {
        let (ctx, cancel) = Context::background().with_cancel();
        cancel.cancel();
        let out = ctx.run(async { 1 }).await;
        assert_eq!(out, Err(ContextError::Cancelled));
    }

    proptest::proptest! {
        #[test]
        fn prop_derived_deadline_never_extends(parent_ms in 1u64..10_000, child_ms in 1u64..10_000) {
            let parent = Context::background().with_timeout(Duration::from_millis(parent_ms));
            let child = parent.with_timeout(Duration::from_millis(child_ms));
            proptest::prop_assert!(child.deadline().unwrap() <= parent.deadline().unwrap());
            proptest::prop_assert!(parent.deadline().is_some());
        }
    }
}
