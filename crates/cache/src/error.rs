//! Cache error types

use std::time::Duration;

use tessera_core::ContextError;
use thiserror::Error;

/// Result type alias for cache operations
pub type CacheResult<T> = std::result::Result<T, CacheError>;

/// Errors returned by the cache client
#[derive(Debug, Error)]
pub enum CacheError {
    /// The value could not be serialized
    #[error("can't marshal value: {0}")]
    Encode(#[source] serde_json::Error),

    /// Stored bytes do not fit the requested type
    #[error("can't unmarshal value of '{key}': {source}")]
    Decode {
        /// Key (or `key.field`) whose payload failed to decode
        key: String,
        /// Underlying codec error
        #[source]
        source: serde_json::Error,
    },

    /// No pooled connection became available within the connection timeout
    #[error("timed out after {0:?} waiting for a cache connection")]
    PoolTimeout(Duration),

    /// The caller's context was cancelled or its deadline passed
    #[error(transparent)]
    Context(#[from] ContextError),

    /// The pool was closed
    #[error("cache pool is closed")]
    PoolClosed,

    /// Dialing the backend failed
    #[error("cannot connect to cache: {0}")]
    Connect(String),

    /// The backend rejected the command or the transport failed mid-command
    #[error("cache backend error: {0}")]
    Backend(String),

    /// The backend replied with something the command cannot produce
    #[error("unexpected reply to {command}: {reply}")]
    UnexpectedReply {
        /// Command name
        command: &'static str,
        /// Rendered reply
        reply: String,
    },
}

impl CacheError {
    /// Whether the operation gave up waiting, on the pool or on the context deadline
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            CacheError::PoolTimeout(_) | CacheError::Context(ContextError::DeadlineExceeded)
        )
    }

    /// Whether the backend could not be reached
    pub fn is_connection(&self) -> bool {
        matches!(self, CacheError::Connect(_) | CacheError::PoolClosed)
    }

    /// Whether the value could not be encoded or decoded
    pub fn is_codec(&self) -> bool {
        matches!(self, CacheError::Encode(_) | CacheError::Decode { .. })
    }
}
