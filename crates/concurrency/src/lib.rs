//! Transactional execution boundary for Tessera
//!
//! This crate lets arbitrarily nested business logic run inside a single
//! relational-database transaction:
//! - Database / Transaction: the collaborator traits a driver implements
//! - carrier: attaches the active transaction to a `Context`
//! - TransactionManager: begins or joins, runs the unit of work, resolves
//! - TransactionStatus: owner-side state machine
//! - testing: recording fake database with fault injection
//!
//! # Example
//!
//! ```ignore
//! let manager = TransactionManager::new(db);
//!
//! manager.read_committed(&ctx, |ctx| async move {
//!     accounts::debit(&ctx, from, amount).await?;
//!     // Nested call joins the same transaction
//!     manager.read_committed(&ctx, |ctx| accounts::credit(ctx, to, amount)).await?;
//!     Ok::<_, AppError>(())
//! }).await?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod carrier;
pub mod database;
pub mod error;
pub mod manager;
pub mod testing;
pub mod transaction;

pub use carrier::{has_transaction, transaction_of, with_transaction};
pub use database::{Database, DatabaseError, DatabaseResult, Transaction};
pub use error::{TransactionError, TransactionResult};
pub use manager::{TransactionManager, TransactionMetrics};
pub use transaction::TransactionStatus;
