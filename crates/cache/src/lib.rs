//! Cache client for Tessera
//!
//! A Redis-protocol key/value and hash cache behind a connection pool:
//! - Cache / CacheExt: raw and typed operations with optional TTL
//! - CacheClient: pooled implementation over any `Connector`
//! - Pool: bounded connection pool with idle reuse and eviction
//! - MemoryStore: in-process backend with Redis semantics
//! - RedisConnector: Redis backend (feature `redis`)
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use std::time::Duration;
//! use tessera_cache::{CacheClient, CacheExt, MemoryStore};
//! use tessera_core::{CacheConfig, Context};
//!
//! # tokio_test_block_on(async {
//! let client = CacheClient::memory(Arc::new(MemoryStore::new()), &CacheConfig::default());
//! let ctx = Context::background();
//!
//! client.set(&ctx, "greeting", "hello", Duration::ZERO).await.unwrap();
//! let value: Option<String> = client.get(&ctx, "greeting").await.unwrap();
//! assert_eq!(value.as_deref(), Some("hello"));
//! # });
//! # fn tokio_test_block_on<F: std::future::Future>(f: F) -> F::Output {
//! #     tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(f)
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod cache;
pub mod client;
pub mod codec;
pub mod command;
pub mod error;
mod expiry;
pub mod memory;
pub mod pool;
#[cfg(feature = "redis")]
pub mod redis;

pub use cache::{Cache, CacheExt};
pub use client::CacheClient;
pub use command::{Command, Reply};
pub use error::{CacheError, CacheResult};
pub use memory::{MemoryConnection, MemoryConnector, MemoryStore};
pub use pool::{Connection, Connector, Pool, PoolConfig, PoolStats, PooledConnection};
#[cfg(feature = "redis")]
pub use self::redis::{RedisConnection, RedisConnector};

/// Client over the in-process backend
pub type MemoryCache = CacheClient<MemoryConnector>;

/// Client over Redis
#[cfg(feature = "redis")]
pub type RedisCache = CacheClient<RedisConnector>;
