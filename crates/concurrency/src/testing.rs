//! Testing utilities for the transactional boundary
//!
//! `RecordingDatabase` is an in-memory `Database` that records every
//! begin/commit/rollback, buffers statements per transaction, and applies
//! them to a committed log only on commit. Faults can be injected at each
//! lifecycle point.
//!
//! # Example
//!
//! ```
//! use tessera_concurrency::testing::{FaultPoint, RecordingDatabase};
//!
//! let db = RecordingDatabase::new();
//! db.fail_at(FaultPoint::Commit);
//! assert_eq!(db.begins(), 0);
//! ```

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tessera_core::{Context, IsolationLevel};

use crate::database::{Database, DatabaseError, DatabaseResult, Transaction};

/// Lifecycle points where a failure can be injected
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FaultPoint {
    /// `begin_transaction` fails
    Begin,
    /// `commit` fails (the transaction's statements are discarded)
    Commit,
    /// `rollback` fails
    Rollback,
}

/// One recorded lifecycle event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TxEvent {
    /// A transaction was begun
    Begin {
        /// Transaction id assigned by the fake
        txn: u64,
        /// Requested isolation level
        isolation: IsolationLevel,
    },
    /// Commit was issued
    Commit {
        /// Transaction id
        txn: u64,
    },
    /// Rollback was issued
    Rollback {
        /// Transaction id
        txn: u64,
    },
}

#[derive(Default)]
struct Shared {
    events: Mutex<Vec<TxEvent>>,
    faults: Mutex<HashSet<FaultPoint>>,
    committed: Mutex<Vec<String>>,
    next_txn: AtomicU64,
}

impl Shared {
    fn faulted(&self, point: FaultPoint) -> bool {
        self.faults.lock().contains(&point)
    }

    fn record(&self, event: TxEvent) {
        self.events.lock().push(event);
    }
}

/// In-memory database that records the transaction lifecycle
///
/// Clones share the same log.
#[derive(Clone, Default)]
pub struct RecordingDatabase {
    shared: Arc<Shared>,
}

impl RecordingDatabase {
    /// Create an empty recording database
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every later call at `point` fail
    pub fn fail_at(&self, point: FaultPoint) {
        self.shared.faults.lock().insert(point);
    }

    /// Remove all injected faults
    pub fn clear_faults(&self) {
        self.shared.faults.lock().clear();
    }

    /// All events in the order they happened
    pub fn events(&self) -> Vec<TxEvent> {
        self.shared.events.lock().clone()
    }

    /// Number of begins
    pub fn begins(&self) -> usize {
        self.count(|e| matches!(e, TxEvent::Begin { .. }))
    }

    /// Number of commits issued (accepted or not)
    pub fn commits(&self) -> usize {
        self.count(|e| matches!(e, TxEvent::Commit { .. }))
    }

    /// Number of rollbacks issued (accepted or not)
    pub fn rollbacks(&self) -> usize {
        self.count(|e| matches!(e, TxEvent::Rollback { .. }))
    }

    fn count(&self, pred: impl Fn(&TxEvent) -> bool) -> usize {
        self.shared.events.lock().iter().filter(|e| pred(e)).count()
    }

    /// Statements made durable by successful commits
    pub fn committed_statements(&self) -> Vec<String> {
        self.shared.committed.lock().clone()
    }
}

#[async_trait]
impl Database for RecordingDatabase {
    type Transaction = RecordingTransaction;

    async fn begin_transaction(
        &self,
        ctx: &Context,
        isolation: IsolationLevel,
    ) -> DatabaseResult<RecordingTransaction> {
        ctx.check()?;
        if self.shared.faulted(FaultPoint::Begin) {
            return Err(DatabaseError::Connection(
                "injected begin failure".to_string(),
            ));
        }
        let txn = self.shared.next_txn.fetch_add(1, Ordering::SeqCst) + 1;
        self.shared.record(TxEvent::Begin { txn, isolation });
        Ok(RecordingTransaction {
            txn,
            isolation,
            shared: Arc::clone(&self.shared),
            resolved: AtomicBool::new(false),
            pending: Mutex::new(Vec::new()),
        })
    }
}

/// Transaction handle produced by `RecordingDatabase`
pub struct RecordingTransaction {
    txn: u64,
    isolation: IsolationLevel,
    shared: Arc<Shared>,
    resolved: AtomicBool,
    pending: Mutex<Vec<String>>,
}

impl RecordingTransaction {
    /// Transaction id
    pub fn id(&self) -> u64 {
        self.txn
    }

    /// Isolation level the transaction was begun with
    pub fn isolation(&self) -> IsolationLevel {
        self.isolation
    }

    /// Buffer a statement until commit
    pub fn execute(&self, statement: impl Into<String>) -> DatabaseResult<()> {
        if self.resolved.load(Ordering::SeqCst) {
            return Err(DatabaseError::AlreadyResolved);
        }
        self.pending.lock().push(statement.into());
        Ok(())
    }

    /// Statements buffered so far
    pub fn pending(&self) -> Vec<String> {
        self.pending.lock().clone()
    }

    fn resolve(&self) -> DatabaseResult<()> {
        if self.resolved.swap(true, Ordering::SeqCst) {
            Err(DatabaseError::AlreadyResolved)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl Transaction for RecordingTransaction {
    async fn commit(&self, _ctx: &Context) -> DatabaseResult<()> {
        self.resolve()?;
        self.shared.record(TxEvent::Commit { txn: self.txn });
        let statements = std::mem::take(&mut *self.pending.lock());
        if self.shared.faulted(FaultPoint::Commit) {
            return Err(DatabaseError::backend("injected commit failure"));
        }
        self.shared.committed.lock().extend(statements);
        Ok(())
    }

    async fn rollback(&self, _ctx: &Context) -> DatabaseResult<()> {
        self.resolve()?;
        self.shared.record(TxEvent::Rollback { txn: self.txn });
        self.pending.lock().clear();
        if self.shared.faulted(FaultPoint::Rollback) {
            return Err(DatabaseError::backend("injected rollback failure"));
        }
        Ok(())
    }
}
