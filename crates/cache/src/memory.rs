//! In-process cache backend
//!
//! `MemoryStore` executes the client's commands with Redis semantics:
//! - strings and hashes are distinct types; touching one as the other fails
//!   with `WRONGTYPE`
//! - `SET` replaces the value and clears any expiration, `HSET` keeps it
//! - removing the last field of a hash removes the key
//! - `EXPIRE` on a missing key replies 0; `EXPIRE key 0` deletes the key
//!
//! Time is read from a `Clock`. Expired keys are invisible to every command
//! and purged lazily through the expiry index before each command runs.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use tessera_core::{Clock, SystemClock};
use tracing::trace;

use crate::command::{Command, Reply};
use crate::error::{CacheError, CacheResult};
use crate::expiry::ExpiryIndex;
use crate::pool::{Connection, Connector};

const WRONGTYPE: &str = "WRONGTYPE Operation against a key holding the wrong kind of value";

#[derive(Debug, Clone)]
enum StoredValue {
    String(Vec<u8>),
    Hash(HashMap<String, Vec<u8>>),
}

#[derive(Debug)]
struct Entry {
    value: StoredValue,
    expires_at: Option<Instant>,
}

#[derive(Debug, Default)]
struct StoreInner {
    entries: HashMap<String, Entry>,
    expiry: ExpiryIndex,
}

impl StoreInner {
    fn purge(&mut self, now: Instant) {
        for key in self.expiry.drain_expired(now) {
            let due = self
                .entries
                .get(&key)
                .and_then(|e| e.expires_at)
                .is_some_and(|at| at <= now);
            if due {
                self.entries.remove(&key);
                trace!(target: "tessera::cache", key = %key, "Purged expired key");
            }
        }
    }

    fn remove(&mut self, key: &str) -> bool {
        match self.entries.remove(key) {
            Some(entry) => {
                if let Some(at) = entry.expires_at {
                    self.expiry.remove(at, key);
                }
                true
            }
            None => false,
        }
    }

    fn set_expiry(&mut self, key: &str, expires_at: Option<Instant>) {
        let Some(entry) = self.entries.get_mut(key) else {
            return;
        };
        if let Some(old) = entry.expires_at.take() {
            self.expiry.remove(old, key);
        }
        entry.expires_at = expires_at;
        if let Some(at) = expires_at {
            self.expiry.insert(at, key);
        }
    }

    fn hash_mut(&mut self, key: &str) -> CacheResult<&mut HashMap<String, Vec<u8>>> {
        let entry = self.entries.entry(key.to_string()).or_insert_with(|| Entry {
            value: StoredValue::Hash(HashMap::new()),
            expires_at: None,
        });
        match &mut entry.value {
            StoredValue::Hash(fields) => Ok(fields),
            StoredValue::String(_) => Err(wrong_type()),
        }
    }

    fn hash(&self, key: &str) -> CacheResult<Option<&HashMap<String, Vec<u8>>>> {
        match self.entries.get(key).map(|e| &e.value) {
            None => Ok(None),
            Some(StoredValue::Hash(fields)) => Ok(Some(fields)),
            Some(StoredValue::String(_)) => Err(wrong_type()),
        }
    }
}

fn wrong_type() -> CacheError {
    CacheError::Backend(WRONGTYPE.to_string())
}

fn count(n: usize) -> Reply {
    Reply::Integer(i64::try_from(n).unwrap_or(i64::MAX))
}

/// Shared in-memory keyspace
#[derive(Debug)]
pub struct MemoryStore {
    clock: Arc<dyn Clock>,
    inner: Mutex<StoreInner>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// Store reading time from the system clock
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Store reading time from `clock`
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            inner: Mutex::new(StoreInner::default()),
        }
    }

    /// Number of live keys
    pub fn len(&self) -> usize {
        let mut inner = self.inner.lock();
        inner.purge(self.clock.now());
        inner.entries.len()
    }

    /// Whether no live key remains
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remaining time to live of `key`; `None` if missing or persistent
    pub fn ttl(&self, key: &str) -> Option<Duration> {
        let now = self.clock.now();
        let mut inner = self.inner.lock();
        inner.purge(now);
        inner
            .entries
            .get(key)
            .and_then(|e| e.expires_at)
            .map(|at| at.saturating_duration_since(now))
    }

    /// Execute one command atomically
    pub fn execute(&self, command: &Command) -> CacheResult<Reply> {
        let now = self.clock.now();
        let mut inner = self.inner.lock();
        inner.purge(now);

        match command {
            Command::Get { key } => match inner.entries.get(key).map(|e| &e.value) {
                None => Ok(Reply::Nil),
                Some(StoredValue::String(bytes)) => Ok(Reply::Bulk(bytes.clone())),
                Some(StoredValue::Hash(_)) => Err(wrong_type()),
            },
            Command::Set {
                key,
                value,
                expire_secs,
            } => {
                inner.remove(key);
                inner.entries.insert(
                    key.clone(),
                    Entry {
                        value: StoredValue::String(value.clone()),
                        expires_at: None,
                    },
                );
                let deadline = expire_secs.map(|secs| now + Duration::from_secs(secs));
                inner.set_expiry(key, deadline);
                Ok(Reply::Status("OK".to_string()))
            }
            Command::Del { keys } => {
                let removed = keys.iter().filter(|key| inner.remove(key)).count();
                Ok(count(removed))
            }
            Command::HSet { key, field, value } => {
                let fields = inner.hash_mut(key)?;
                let added = fields.insert(field.clone(), value.clone()).is_none();
                Ok(Reply::Integer(i64::from(added)))
            }
            Command::HGet { key, field } => Ok(inner
                .hash(key)?
                .and_then(|fields| fields.get(field))
                .map_or(Reply::Nil, |bytes| Reply::Bulk(bytes.clone()))),
            Command::HDel { key, fields } => {
                if inner.hash(key)?.is_none() {
                    return Ok(Reply::Integer(0));
                }
                let hash = inner.hash_mut(key)?;
                let removed = fields.iter().filter(|f| hash.remove(*f).is_some()).count();
                if hash.is_empty() {
                    inner.remove(key);
                }
                Ok(count(removed))
            }
            Command::HGetAll { key } => {
                let items: Vec<Reply> = inner
                    .hash(key)?
                    .map(|fields| {
                        fields
                            .iter()
                            .flat_map(|(f, v)| {
                                [Reply::Bulk(f.as_bytes().to_vec()), Reply::Bulk(v.clone())]
                            })
                            .collect()
                    })
                    .unwrap_or_default();
                Ok(Reply::Array(items))
            }
            Command::Expire { key, seconds } => {
                if !inner.entries.contains_key(key) {
                    return Ok(Reply::Integer(0));
                }
                if *seconds == 0 {
                    inner.remove(key);
                } else {
                    inner.set_expiry(key, Some(now + Duration::from_secs(*seconds)));
                }
                Ok(Reply::Integer(1))
            }
            Command::Ping => Ok(Reply::Status("PONG".to_string())),
        }
    }
}

#[derive(Debug, Default)]
struct Faults {
    refuse_connect: AtomicBool,
    /// Commands left to succeed before the next one breaks its connection
    break_after: Mutex<Option<usize>>,
    dials: AtomicUsize,
}

/// Connector producing connections to a shared `MemoryStore`
///
/// Clones share the store and the injected faults.
#[derive(Debug, Clone)]
pub struct MemoryConnector {
    store: Arc<MemoryStore>,
    faults: Arc<Faults>,
}

impl MemoryConnector {
    /// Connector over `store`
    pub fn new(store: Arc<MemoryStore>) -> Self {
        Self {
            store,
            faults: Arc::new(Faults::default()),
        }
    }

    /// The backing store
    pub fn store(&self) -> &Arc<MemoryStore> {
        &self.store
    }

    /// Make later dials fail (or succeed again)
    pub fn refuse_connections(&self, refuse: bool) {
        self.faults.refuse_connect.store(refuse, Ordering::SeqCst);
    }

    /// Make the next command fail at the transport level, breaking its connection
    pub fn break_next_command(&self) {
        self.break_after_commands(0);
    }

    /// Let `n` more commands succeed, then break the connection of the next one
    pub fn break_after_commands(&self, n: usize) {
        *self.faults.break_after.lock() = Some(n);
    }

    /// Connections dialed so far
    pub fn dials(&self) -> usize {
        self.faults.dials.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    type Connection = MemoryConnection;

    async fn connect(&self) -> CacheResult<MemoryConnection> {
        if self.faults.refuse_connect.load(Ordering::SeqCst) {
            return Err(CacheError::Connect("connection refused".to_string()));
        }
        self.faults.dials.fetch_add(1, Ordering::SeqCst);
        Ok(MemoryConnection {
            store: Arc::clone(&self.store),
            faults: Arc::clone(&self.faults),
            broken: false,
        })
    }
}

/// Connection to a `MemoryStore`
#[derive(Debug)]
pub struct MemoryConnection {
    store: Arc<MemoryStore>,
    faults: Arc<Faults>,
    broken: bool,
}

#[async_trait]
impl Connection for MemoryConnection {
    async fn execute(&mut self, command: &Command) -> CacheResult<Reply> {
        if self.broken {
            return Err(CacheError::Backend("connection is broken".to_string()));
        }
        let break_now = {
            let mut break_after = self.faults.break_after.lock();
            match *break_after {
                Some(0) => {
                    *break_after = None;
                    true
                }
                Some(n) => {
                    *break_after = Some(n - 1);
                    false
                }
                None => false,
            }
        };
        if break_now {
            self.broken = true;
            return Err(CacheError::Backend("connection reset by peer".to_string()));
        }
        self.store.execute(command)
    }

    fn is_broken(&self) -> bool {
        self.broken
    }
}
