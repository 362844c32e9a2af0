//! Tessera - transactional execution boundary and cache client
//!
//! Two building blocks for service code:
//!
//! - [`TransactionManager`] runs a unit of work inside a database
//!   transaction. The first transactional region in a call tree begins the
//!   transaction; nested regions join it through the [`Context`]; the
//!   outermost region commits or rolls back exactly once, even on panic.
//! - [`CacheClient`] is a pooled key/value and hash cache with optional
//!   expiration, over Redis or an in-process store.
//!
//! # Quick Start
//!
//! ```ignore
//! use tessera::{Context, PgDatabase, TesseraConfig, TransactionManager};
//!
//! let config = TesseraConfig::from_file(path)?;
//! let manager = TransactionManager::with_default_isolation(
//!     PgDatabase::connect(&config.database).await?,
//!     config.database.isolation,
//! );
//!
//! manager.run_default(&Context::background(), |ctx| async move {
//!     orders::create(&ctx, order).await?;
//!     inventory::reserve(&ctx, order.items()).await
//! }).await?;
//! ```

pub use tessera_cache as cache;
pub use tessera_concurrency as concurrency;
#[cfg(feature = "postgres")]
pub use tessera_postgres as postgres;

pub use tessera_cache::{
    Cache, CacheClient, CacheError, CacheExt, CacheResult, MemoryCache, MemoryStore,
};
#[cfg(feature = "redis")]
pub use tessera_cache::RedisCache;
pub use tessera_concurrency::{
    Database, DatabaseError, Transaction, TransactionError, TransactionManager,
    TransactionMetrics, TransactionResult,
};
pub use tessera_core::{
    BoxError, CacheConfig, Clock, Context, ContextError, DatabaseConfig, IsolationLevel,
    ManualClock, SystemClock, TesseraConfig,
};
#[cfg(feature = "postgres")]
pub use tessera_postgres::{PgDatabase, PgTransaction};
