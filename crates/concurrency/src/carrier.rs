//! Transaction context carrier
//!
//! Narrow read/write contract for the transaction association on a
//! `Context`. Writing derives a new context; reading is O(1), side-effect
//! free, and returns the same handle every time for the same context.

use std::sync::Arc;

use tessera_core::{Context, Result};

use crate::database::Transaction;

/// Derive a context that carries `handle`
///
/// `ctx` itself is left untouched.
///
/// # Errors
///
/// `Error::TransactionAlreadyBound` if `ctx` already carries a transaction.
pub fn with_transaction<T: Transaction>(ctx: &Context, handle: Arc<T>) -> Result<Context> {
    ctx.with_transaction(handle)
}

/// The `T` transaction carried by `ctx`, if any
pub fn transaction_of<T: Transaction>(ctx: &Context) -> Option<Arc<T>> {
    ctx.transaction::<T>()
}

/// Whether `ctx` carries a transaction of any type
pub fn has_transaction(ctx: &Context) -> bool {
    ctx.has_transaction()
}
