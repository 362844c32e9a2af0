//! Connection pool
//!
//! Checkout order:
//! 1. Reject if the context is done or the pool is closed
//! 2. Take a `max_active` permit (skipped when unlimited)
//! 3. Reuse the most recently returned idle connection, closing any idle
//!    longer than `idle_timeout`
//! 4. Otherwise dial a new one
//!
//! Steps 2-4 are bounded by `min(connection_timeout, context deadline)`.
//! A `PooledConnection` goes back to the idle list on drop unless it is
//! broken, the pool is closed, or the idle list is full.

use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use tessera_core::{CacheConfig, Clock, Context, SystemClock};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, trace, warn};

use crate::command::{Command, Reply};
use crate::error::{CacheError, CacheResult};

/// A live backend connection
#[async_trait]
pub trait Connection: Send + 'static {
    /// Send one command and wait for its reply
    async fn execute(&mut self, command: &Command) -> CacheResult<Reply>;

    /// Whether the transport failed and the connection must not be reused
    fn is_broken(&self) -> bool;
}

/// Dials backend connections
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Connection type produced
    type Connection: Connection;

    /// Open a new connection
    async fn connect(&self) -> CacheResult<Self::Connection>;
}

/// Pool sizing and timeouts
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
    /// Upper bound on waiting for a connection
    pub connection_timeout: Duration,
    /// Idle connections kept for reuse
    pub max_idle: usize,
    /// Idle connections older than this are closed on checkout
    pub idle_timeout: Option<Duration>,
    /// Connections checked out at once (0 = unlimited)
    pub max_active: usize,
}

impl From<&CacheConfig> for PoolConfig {
    fn from(config: &CacheConfig) -> Self {
        Self {
            connection_timeout: config.connection_timeout(),
            max_idle: config.max_idle,
            idle_timeout: config.idle_timeout(),
            max_active: config.max_active,
        }
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        PoolConfig::from(&CacheConfig::default())
    }
}

/// Snapshot of pool occupancy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PoolStats {
    /// Connections waiting in the idle list
    pub idle: usize,
    /// Connections currently checked out
    pub active: usize,
}

struct IdleConnection<T> {
    conn: T,
    returned_at: Instant,
}

struct PoolShared<C: Connector> {
    connector: C,
    config: PoolConfig,
    clock: Arc<dyn Clock>,
    idle: Mutex<Vec<IdleConnection<C::Connection>>>,
    limiter: Option<Arc<Semaphore>>,
    closed: AtomicBool,
    active: AtomicUsize,
}

impl<C: Connector> PoolShared<C> {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Pop the newest idle connection that has not outlived `idle_timeout`
    fn take_idle(&self) -> Option<C::Connection> {
        let now = self.clock.now();
        let mut idle = self.idle.lock();
        while let Some(entry) = idle.pop() {
            let stale = self
                .config
                .idle_timeout
                .is_some_and(|timeout| now.saturating_duration_since(entry.returned_at) >= timeout);
            if stale {
                trace!(target: "tessera::pool", "Closing stale idle connection");
                continue;
            }
            return Some(entry.conn);
        }
        None
    }

    fn put_idle(&self, conn: C::Connection) {
        if self.is_closed() || self.config.max_idle == 0 {
            return;
        }
        let mut idle = self.idle.lock();
        idle.push(IdleConnection {
            conn,
            returned_at: self.clock.now(),
        });
        if idle.len() > self.config.max_idle {
            // Oldest entry sits at the front
            idle.remove(0);
        }
    }
}

/// Bounded pool of backend connections
pub struct Pool<C: Connector> {
    shared: Arc<PoolShared<C>>,
}

impl<C: Connector> Clone for Pool<C> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<C: Connector> fmt::Debug for Pool<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pool")
            .field("config", &self.shared.config)
            .field("stats", &self.stats())
            .field("closed", &self.shared.is_closed())
            .finish()
    }
}

impl<C: Connector> Pool<C> {
    /// Create a pool reading idle ages from the system clock
    pub fn new(connector: C, config: PoolConfig) -> Self {
        Self::with_clock(connector, config, Arc::new(SystemClock))
    }

    /// Create a pool with an explicit clock for idle-timeout checks
    pub fn with_clock(connector: C, config: PoolConfig, clock: Arc<dyn Clock>) -> Self {
        let limiter = (config.max_active > 0).then(|| Arc::new(Semaphore::new(config.max_active)));
        Self {
            shared: Arc::new(PoolShared {
                connector,
                config,
                clock,
                idle: Mutex::new(Vec::new()),
                limiter,
                closed: AtomicBool::new(false),
                active: AtomicUsize::new(0),
            }),
        }
    }

    /// The pool's settings
    pub fn config(&self) -> &PoolConfig {
        &self.shared.config
    }

    /// The connector used to dial new connections
    pub fn connector(&self) -> &C {
        &self.shared.connector
    }

    /// Check out a connection
    ///
    /// # Errors
    ///
    /// - `Context` when `ctx` is cancelled or its deadline passes first
    /// - `PoolTimeout` when the connection timeout elapses first
    /// - `PoolClosed` after `close`
    /// - `Connect` when dialing fails
    pub async fn get(&self, ctx: &Context) -> CacheResult<PooledConnection<C>> {
        ctx.check()?;
        if self.shared.is_closed() {
            return Err(CacheError::PoolClosed);
        }

        let timeout = self.shared.config.connection_timeout;
        match tokio::time::timeout(timeout, ctx.run(self.acquire())).await {
            Ok(Ok(result)) => result,
            Ok(Err(ctx_err)) => {
                debug!(target: "tessera::pool", error = %ctx_err, "Checkout abandoned");
                Err(ctx_err.into())
            }
            Err(_) => {
                warn!(target: "tessera::pool", ?timeout, "Timed out waiting for a connection");
                Err(CacheError::PoolTimeout(timeout))
            }
        }
    }

    async fn acquire(&self) -> CacheResult<PooledConnection<C>> {
        let permit = match &self.shared.limiter {
            Some(limiter) => Some(
                Arc::clone(limiter)
                    .acquire_owned()
                    .await
                    .map_err(|_| CacheError::PoolClosed)?,
            ),
            None => None,
        };

        // A close may have raced the wait
        if self.shared.is_closed() {
            return Err(CacheError::PoolClosed);
        }

        let conn = match self.shared.take_idle() {
            Some(conn) => conn,
            None => {
                let conn = self.shared.connector.connect().await?;
                debug!(target: "tessera::pool", "Dialed new connection");
                conn
            }
        };

        self.shared.active.fetch_add(1, Ordering::Relaxed);
        Ok(PooledConnection {
            conn: Some(conn),
            shared: Arc::clone(&self.shared),
            _permit: permit,
            discard: false,
        })
    }

    /// Close the pool
    ///
    /// Idle connections are dropped, waiting checkouts fail, and connections
    /// returned later are dropped. Returns `false` if already closed.
    pub fn close(&self) -> bool {
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        if let Some(limiter) = &self.shared.limiter {
            limiter.close();
        }
        let dropped = std::mem::take(&mut *self.shared.idle.lock());
        debug!(target: "tessera::pool", idle = dropped.len(), "Pool closed");
        true
    }

    /// Whether `close` has been called
    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    /// Current idle and active counts
    pub fn stats(&self) -> PoolStats {
        PoolStats {
            idle: self.shared.idle.lock().len(),
            active: self.shared.active.load(Ordering::Relaxed),
        }
    }
}

/// A checked-out connection, returned to the pool on drop
pub struct PooledConnection<C: Connector> {
    conn: Option<C::Connection>,
    shared: Arc<PoolShared<C>>,
    _permit: Option<OwnedSemaphorePermit>,
    discard: bool,
}

impl<C: Connector> PooledConnection<C> {
    /// Drop the connection instead of returning it to the pool
    pub fn discard(&mut self) {
        self.discard = true;
    }
}

impl<C: Connector> Deref for PooledConnection<C> {
    type Target = C::Connection;

    fn deref(&self) -> &C::Connection {
        // Only `drop` empties the slot
        self.conn.as_ref().unwrap_or_else(|| unreachable!())
    }
}

impl<C: Connector> DerefMut for PooledConnection<C> {
    fn deref_mut(&mut self) -> &mut C::Connection {
        self.conn.as_mut().unwrap_or_else(|| unreachable!())
    }
}

impl<C: Connector> Drop for PooledConnection<C> {
    fn drop(&mut self) {
        let _ = self
            .shared
            .active
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |x| {
                Some(x.saturating_sub(1))
            });
        if let Some(conn) = self.conn.take() {
            if self.discard || conn.is_broken() {
                trace!(target: "tessera::pool", "Discarding broken connection");
                return;
            }
            self.shared.put_idle(conn);
        }
    }
}
