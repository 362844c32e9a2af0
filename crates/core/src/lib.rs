//! Core types for Tessera
//!
//! This crate defines the foundational types shared by every layer:
//! - Context: request-scoped carrier for deadlines, cancellation and the active transaction
//! - IsolationLevel: transaction isolation policy
//! - Clock: time source (system or manually driven for tests)
//! - Config: cache and database configuration loaded from TOML
//! - Error: error type hierarchy

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod clock;
pub mod config;
pub mod context;
pub mod error;
pub mod isolation;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{CacheConfig, DatabaseConfig, TesseraConfig, CONFIG_FILE_NAME};
pub use context::{CancelHandle, Context};
pub use error::{ContextError, Error, Result};
pub use isolation::IsolationLevel;

/// Boxed error used at seams where the concrete error type belongs to the caller
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;
