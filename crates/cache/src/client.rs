//! Pooled cache client
//!
//! `CacheClient` implements `Cache` over any `Connector`. Every operation
//! checks a connection out of the pool, runs its commands under the
//! caller's context, and hands the connection back on every path.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tessera_core::{CacheConfig, Clock, Context};
use tracing::{trace, warn};

use crate::cache::Cache;
use crate::command::{ttl_seconds, Command, Reply};
use crate::error::{CacheError, CacheResult};
use crate::memory::{MemoryConnector, MemoryStore};
use crate::pool::{Connection, Connector, Pool, PoolConfig, PoolStats};

/// Cache client backed by a connection pool
pub struct CacheClient<C: Connector> {
    pool: Pool<C>,
}

impl<C: Connector> std::fmt::Debug for CacheClient<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheClient").field("pool", &self.pool).finish()
    }
}

impl<C: Connector> CacheClient<C> {
    /// Client dialing through `connector` with pool settings from `config`
    pub fn new(connector: C, config: &CacheConfig) -> Self {
        Self::with_pool(Pool::new(connector, PoolConfig::from(config)))
    }

    /// Client over an existing pool
    pub fn with_pool(pool: Pool<C>) -> Self {
        Self { pool }
    }

    /// The connection pool
    pub fn pool(&self) -> &Pool<C> {
        &self.pool
    }

    /// Current pool occupancy
    pub fn stats(&self) -> PoolStats {
        self.pool.stats()
    }

    /// Run `commands` in order on one pooled connection
    ///
    /// Stops at the first failing command. If the context ends while a
    /// command is in flight the connection is discarded, since its reply
    /// may still arrive.
    async fn execute(&self, ctx: &Context, commands: &[Command]) -> CacheResult<Vec<Reply>> {
        let mut conn = self.pool.get(ctx).await?;
        let mut replies = Vec::with_capacity(commands.len());

        for command in commands {
            trace!(
                target: "tessera::cache",
                command = command.name(),
                key = command.key().unwrap_or(""),
                "Executing"
            );
            let outcome = ctx.run(conn.execute(command)).await;
            match outcome {
                Ok(Ok(reply)) => replies.push(reply),
                Ok(Err(e)) => {
                    warn!(
                        target: "tessera::cache",
                        command = command.name(),
                        error = %e,
                        "Cache command failed"
                    );
                    return Err(e);
                }
                Err(ctx_err) => {
                    conn.discard();
                    return Err(ctx_err.into());
                }
            }
        }
        Ok(replies)
    }

    async fn execute_one(&self, ctx: &Context, command: Command) -> CacheResult<Reply> {
        let name = command.name();
        self.execute(ctx, std::slice::from_ref(&command))
            .await?
            .pop()
            .ok_or(CacheError::UnexpectedReply {
                command: name,
                reply: "no reply".to_string(),
            })
    }
}

impl CacheClient<MemoryConnector> {
    /// Client over an in-process store
    pub fn memory(store: Arc<MemoryStore>, config: &CacheConfig) -> Self {
        Self::new(MemoryConnector::new(store), config)
    }

    /// Client over an in-process store whose pool reads idle ages from `clock`
    pub fn memory_with_clock(
        store: Arc<MemoryStore>,
        config: &CacheConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self::with_pool(Pool::with_clock(
            MemoryConnector::new(store),
            PoolConfig::from(config),
            clock,
        ))
    }
}

#[cfg(feature = "redis")]
impl CacheClient<crate::redis::RedisConnector> {
    /// Client for the Redis server at `config.address`
    ///
    /// Connections are dialed on first use.
    pub fn redis(config: &CacheConfig) -> CacheResult<Self> {
        Ok(Self::new(crate::redis::RedisConnector::new(config)?, config))
    }
}

fn to_count(command: &'static str, n: i64) -> CacheResult<u64> {
    u64::try_from(n).map_err(|_| CacheError::UnexpectedReply {
        command,
        reply: format!("negative count {n}"),
    })
}

#[async_trait]
impl<C: Connector> Cache for CacheClient<C> {
    async fn get_raw(&self, ctx: &Context, key: &str) -> CacheResult<Option<Vec<u8>>> {
        self.execute_one(ctx, Command::Get { key: key.to_string() })
            .await?
            .into_optional_bulk("GET")
    }

    async fn set_raw(
        &self,
        ctx: &Context,
        key: &str,
        value: Vec<u8>,
        ttl: Duration,
    ) -> CacheResult<()> {
        let command = Command::Set {
            key: key.to_string(),
            value,
            expire_secs: ttl_seconds(ttl),
        };
        self.execute_one(ctx, command).await?.into_status("SET")?;
        Ok(())
    }

    async fn del(&self, ctx: &Context, keys: &[&str]) -> CacheResult<u64> {
        if keys.is_empty() {
            return Ok(0);
        }
        let command = Command::Del {
            keys: keys.iter().map(|k| k.to_string()).collect(),
        };
        let removed = self.execute_one(ctx, command).await?.into_integer("DEL")?;
        to_count("DEL", removed)
    }

    async fn hash_set_raw(
        &self,
        ctx: &Context,
        key: &str,
        field: &str,
        value: Vec<u8>,
        ttl: Duration,
    ) -> CacheResult<()> {
        let mut commands = vec![Command::HSet {
            key: key.to_string(),
            field: field.to_string(),
            value,
        }];
        if let Some(seconds) = ttl_seconds(ttl) {
            commands.push(Command::Expire {
                key: key.to_string(),
                seconds,
            });
        }

        let mut replies = self.execute(ctx, &commands).await?.into_iter();
        if let Some(reply) = replies.next() {
            reply.into_integer("HSET")?;
        }
        if let Some(reply) = replies.next() {
            reply.into_integer("EXPIRE")?;
        }
        Ok(())
    }

    async fn hash_get_raw(
        &self,
        ctx: &Context,
        key: &str,
        field: &str,
    ) -> CacheResult<Option<Vec<u8>>> {
        let command = Command::HGet {
            key: key.to_string(),
            field: field.to_string(),
        };
        self.execute_one(ctx, command)
            .await?
            .into_optional_bulk("HGET")
    }

    async fn hash_del(&self, ctx: &Context, key: &str, fields: &[&str]) -> CacheResult<u64> {
        if fields.is_empty() {
            return Ok(0);
        }
        let command = Command::HDel {
            key: key.to_string(),
            fields: fields.iter().map(|f| f.to_string()).collect(),
        };
        let removed = self.execute_one(ctx, command).await?.into_integer("HDEL")?;
        to_count("HDEL", removed)
    }

    async fn hash_get_all_raw(
        &self,
        ctx: &Context,
        key: &str,
    ) -> CacheResult<HashMap<String, Vec<u8>>> {
        let reply = self
            .execute_one(ctx, Command::HGetAll { key: key.to_string() })
            .await?;
        Ok(reply.into_pairs("HGETALL")?.into_iter().collect())
    }

    async fn expire(&self, ctx: &Context, key: &str, ttl: Duration) -> CacheResult<bool> {
        let command = Command::Expire {
            key: key.to_string(),
            seconds: ttl_seconds(ttl).unwrap_or(0),
        };
        let applied = self.execute_one(ctx, command).await?.into_integer("EXPIRE")?;
        Ok(applied == 1)
    }

    async fn ping(&self, ctx: &Context) -> CacheResult<()> {
        self.execute_one(ctx, Command::Ping).await?.into_status("PING")?;
        Ok(())
    }

    async fn close(&self) -> CacheResult<()> {
        self.pool.close();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheExt;
    use tessera_core::ManualClock;

    fn client() -> (Arc<MemoryStore>, CacheClient<MemoryConnector>) {
        let store = Arc::new(MemoryStore::new());
        let client = CacheClient::memory(Arc::clone(&store), &CacheConfig::default());
        (store, client)
    }

    #[tokio::test]
    async fn test_connection_is_reused_across_operations() {
        let (_, client) = client();
        let ctx = Context::background();

        client.set(&ctx, "a", &1u32, Duration::ZERO).await.unwrap();
        client.set(&ctx, "b", &2u32, Duration::ZERO).await.unwrap();
        let a: Option<u32> = client.get(&ctx, "a").await.unwrap();

        assert_eq!(a, Some(1));
        assert_eq!(client.pool().connector().dials(), 1);
        assert_eq!(client.stats(), PoolStats { idle: 1, active: 0 });
    }

    #[tokio::test]
    async fn test_transport_failure_discards_connection() {
        let (_, client) = client();
        let ctx = Context::background();

        client.ping(&ctx).await.unwrap();
        client.pool().connector().break_next_command();
        assert!(client.ping(&ctx).await.is_err());
        assert_eq!(client.stats().idle, 0);

        client.ping(&ctx).await.unwrap();
        assert_eq!(client.pool().connector().dials(), 2);
    }

    #[tokio::test]
    async fn test_server_error_keeps_connection() {
        let (_, client) = client();
        let ctx = Context::background();

        client.set(&ctx, "s", "text", Duration::ZERO).await.unwrap();
        let err = client
            .hash_set(&ctx, "s", "f", &1, Duration::ZERO)
            .await
            .unwrap_err();
        assert!(matches!(err, CacheError::Backend(_)));
        assert_eq!(client.stats().idle, 1);
        assert_eq!(client.pool().connector().dials(), 1);
    }

    #[tokio::test]
    async fn test_sub_second_ttl_rounds_up() {
        let clock = Arc::new(ManualClock::new());
        let store = Arc::new(MemoryStore::with_clock(clock.clone()));
        let client = CacheClient::memory(Arc::clone(&store), &CacheConfig::default());
        let ctx = Context::background();

        client
            .set(&ctx, "k", &true, Duration::from_millis(200))
            .await
            .unwrap();
        assert_eq!(store.ttl("k"), Some(Duration::from_secs(1)));

        client
            .hash_set(&ctx, "h", "f", &true, Duration::from_millis(1500))
            .await
            .unwrap();
        assert_eq!(store.ttl("h"), Some(Duration::from_secs(2)));
    }

    #[tokio::test]
    async fn test_failed_expire_leaves_field_without_ttl() {
        let (store, client) = client();
        let ctx = Context::background();

        client.pool().connector().break_after_commands(1);
        let err = client
            .hash_set(&ctx, "h", "f", &1u32, Duration::from_secs(30))
            .await
            .unwrap_err();

        assert!(matches!(err, CacheError::Backend(_)));
        let stored: Option<u32> = client.hash_get(&ctx, "h", "f").await.unwrap();
        assert_eq!(stored, Some(1));
        assert_eq!(store.ttl("h"), None);
        assert_eq!(client.pool().connector().dials(), 2);
    }

    #[tokio::test]
    async fn test_empty_key_lists_skip_round_trip() {
        let (_, client) = client();
        let ctx = Context::background();

        assert_eq!(client.del(&ctx, &[]).await.unwrap(), 0);
        assert_eq!(client.hash_del(&ctx, "h", &[]).await.unwrap(), 0);
        assert_eq!(client.pool().connector().dials(), 0);
    }

    #[tokio::test]
    async fn test_stale_idle_connection_is_replaced() {
        let clock = Arc::new(ManualClock::new());
        let config = CacheConfig {
            idle_timeout_ms: 1_000,
            ..CacheConfig::default()
        };
        let client =
            CacheClient::memory_with_clock(Arc::new(MemoryStore::new()), &config, clock.clone());
        let ctx = Context::background();

        client.ping(&ctx).await.unwrap();
        clock.advance(Duration::from_secs(2));
        client.ping(&ctx).await.unwrap();
        assert_eq!(client.pool().connector().dials(), 2);
    }
}
