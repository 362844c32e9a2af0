//! Cache commands and wire replies
//!
//! Backends translate `Command` into their protocol and report results as
//! `Reply`; the client turns replies into typed results.

use std::fmt;
use std::time::Duration;

use crate::error::{CacheError, CacheResult};

/// A single cache command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// `GET key`
    Get {
        /// Key
        key: String,
    },
    /// `SET key value [EX seconds]`
    Set {
        /// Key
        key: String,
        /// Payload
        value: Vec<u8>,
        /// Expiration in whole seconds; `None` stores without expiration
        expire_secs: Option<u64>,
    },
    /// `DEL key [key ...]`
    Del {
        /// Keys to remove
        keys: Vec<String>,
    },
    /// `HSET key field value`
    HSet {
        /// Hash key
        key: String,
        /// Field
        field: String,
        /// Payload
        value: Vec<u8>,
    },
    /// `HGET key field`
    HGet {
        /// Hash key
        key: String,
        /// Field
        field: String,
    },
    /// `HDEL key field [field ...]`
    HDel {
        /// Hash key
        key: String,
        /// Fields to remove
        fields: Vec<String>,
    },
    /// `HGETALL key`
    HGetAll {
        /// Hash key
        key: String,
    },
    /// `EXPIRE key seconds`
    Expire {
        /// Key
        key: String,
        /// Seconds until expiration; zero expires immediately
        seconds: u64,
    },
    /// `PING`
    Ping,
}

impl Command {
    /// Command name as sent on the wire
    pub fn name(&self) -> &'static str {
        match self {
            Command::Get { .. } => "GET",
            Command::Set { .. } => "SET",
            Command::Del { .. } => "DEL",
            Command::HSet { .. } => "HSET",
            Command::HGet { .. } => "HGET",
            Command::HDel { .. } => "HDEL",
            Command::HGetAll { .. } => "HGETALL",
            Command::Expire { .. } => "EXPIRE",
            Command::Ping => "PING",
        }
    }

    /// First key the command touches, for logging
    pub fn key(&self) -> Option<&str> {
        match self {
            Command::Get { key }
            | Command::Set { key, .. }
            | Command::HSet { key, .. }
            | Command::HGet { key, .. }
            | Command::HDel { key, .. }
            | Command::HGetAll { key }
            | Command::Expire { key, .. } => Some(key),
            Command::Del { keys } => keys.first().map(String::as_str),
            Command::Ping => None,
        }
    }
}

/// Whole seconds for a positive TTL, rounding any remainder up
///
/// Returns `None` for a zero TTL, which means "no expiration".
pub fn ttl_seconds(ttl: Duration) -> Option<u64> {
    if ttl.is_zero() {
        return None;
    }
    let secs = ttl.as_secs();
    Some(if ttl.subsec_nanos() > 0 { secs + 1 } else { secs })
}

/// Reply from the backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// Absent value
    Nil,
    /// Simple status such as `OK` or `PONG`
    Status(String),
    /// Integer reply
    Integer(i64),
    /// Binary-safe payload
    Bulk(Vec<u8>),
    /// Multi-element reply
    Array(Vec<Reply>),
}

impl Reply {
    fn unexpected(self, command: &'static str) -> CacheError {
        CacheError::UnexpectedReply {
            command,
            reply: self.to_string(),
        }
    }

    /// Payload or absence, for GET and HGET
    pub fn into_optional_bulk(self, command: &'static str) -> CacheResult<Option<Vec<u8>>> {
        match self {
            Reply::Nil => Ok(None),
            Reply::Bulk(bytes) => Ok(Some(bytes)),
            other => Err(other.unexpected(command)),
        }
    }

    /// Integer reply, for DEL, HDEL, HSET and EXPIRE
    pub fn into_integer(self, command: &'static str) -> CacheResult<i64> {
        match self {
            Reply::Integer(n) => Ok(n),
            other => Err(other.unexpected(command)),
        }
    }

    /// Any status reply, for SET and PING
    pub fn into_status(self, command: &'static str) -> CacheResult<String> {
        match self {
            Reply::Status(status) => Ok(status),
            other => Err(other.unexpected(command)),
        }
    }

    /// Field/value pairs, for HGETALL
    pub fn into_pairs(self, command: &'static str) -> CacheResult<Vec<(String, Vec<u8>)>> {
        let items = match self {
            Reply::Array(items) if items.len() % 2 == 0 => items,
            other => return Err(other.unexpected(command)),
        };

        let mut pairs = Vec::with_capacity(items.len() / 2);
        let mut iter = items.into_iter();
        while let (Some(field), Some(value)) = (iter.next(), iter.next()) {
            match (field, value) {
                (Reply::Bulk(field), Reply::Bulk(value)) => {
                    let field = String::from_utf8(field).map_err(|e| {
                        CacheError::UnexpectedReply {
                            command,
                            reply: format!("non-UTF-8 field name: {e}"),
                        }
                    })?;
                    pairs.push((field, value));
                }
                (field, _) => return Err(field.unexpected(command)),
            }
        }
        Ok(pairs)
    }
}

impl fmt::Display for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reply::Nil => write!(f, "nil"),
            Reply::Status(s) => write!(f, "status '{s}'"),
            Reply::Integer(n) => write!(f, "integer {n}"),
            Reply::Bulk(bytes) => write!(f, "bulk of {} bytes", bytes.len()),
            Reply::Array(items) => write!(f, "array of {} elements", items.len()),
        }
    }
}
