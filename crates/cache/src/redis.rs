//! Redis backend
//!
//! Each pooled connection owns one multiplexed connection from the `redis`
//! crate. Server errors (e.g. `WRONGTYPE`) leave the connection usable;
//! transport errors mark it broken so the pool discards it.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::{Client, Cmd, RedisError, Value};
use tessera_core::CacheConfig;
use tracing::{debug, warn};

use crate::command::{Command, Reply};
use crate::error::{CacheError, CacheResult};
use crate::pool::{Connection, Connector};

/// Dials Redis connections for the pool
#[derive(Debug, Clone)]
pub struct RedisConnector {
    client: Client,
    connect_timeout: Duration,
}

impl RedisConnector {
    /// Connector for `config.address` (`host:port` or a full `redis://` URL)
    ///
    /// Nothing is dialed until the pool needs a connection.
    pub fn new(config: &CacheConfig) -> CacheResult<Self> {
        let url = if config.address.contains("://") {
            config.address.clone()
        } else {
            format!("redis://{}", config.address)
        };
        let client = Client::open(url.as_str()).map_err(|e| CacheError::Connect(e.to_string()))?;
        Ok(Self {
            client,
            connect_timeout: config.connection_timeout(),
        })
    }
}

#[async_trait]
impl Connector for RedisConnector {
    type Connection = RedisConnection;

    async fn connect(&self) -> CacheResult<RedisConnection> {
        let dial = self.client.get_multiplexed_async_connection();
        let conn = match tokio::time::timeout(self.connect_timeout, dial).await {
            Ok(Ok(conn)) => conn,
            Ok(Err(e)) => {
                warn!(target: "tessera::cache", error = %e, "Cannot connect to Redis");
                return Err(CacheError::Connect(e.to_string()));
            }
            Err(_) => {
                return Err(CacheError::Connect(format!(
                    "dial timed out after {:?}",
                    self.connect_timeout
                )))
            }
        };
        debug!(target: "tessera::cache", "Connected to Redis");
        Ok(RedisConnection {
            conn,
            broken: false,
        })
    }
}

/// One Redis connection
pub struct RedisConnection {
    conn: MultiplexedConnection,
    broken: bool,
}

fn to_cmd(command: &Command) -> Cmd {
    let mut cmd = redis::cmd(command.name());
    match command {
        Command::Get { key } | Command::HGetAll { key } => {
            cmd.arg(key);
        }
        Command::Set {
            key,
            value,
            expire_secs,
        } => {
            cmd.arg(key).arg(value.as_slice());
            if let Some(secs) = expire_secs {
                cmd.arg("EX").arg(*secs);
            }
        }
        Command::Del { keys } => {
            cmd.arg(keys);
        }
        Command::HSet { key, field, value } => {
            cmd.arg(key).arg(field).arg(value.as_slice());
        }
        Command::HGet { key, field } => {
            cmd.arg(key).arg(field);
        }
        Command::HDel { key, fields } => {
            cmd.arg(key).arg(fields);
        }
        Command::Expire { key, seconds } => {
            cmd.arg(key).arg(*seconds);
        }
        Command::Ping => {}
    }
    cmd
}

fn to_reply(command: &'static str, value: Value) -> CacheResult<Reply> {
    match value {
        Value::Nil => Ok(Reply::Nil),
        Value::Okay => Ok(Reply::Status("OK".to_string())),
        Value::SimpleString(s) => Ok(Reply::Status(s)),
        Value::Int(n) => Ok(Reply::Integer(n)),
        Value::BulkString(bytes) => Ok(Reply::Bulk(bytes)),
        Value::Array(items) => items
            .into_iter()
            .map(|item| to_reply(command, item))
            .collect::<CacheResult<Vec<_>>>()
            .map(Reply::Array),
        other => Err(CacheError::UnexpectedReply {
            command,
            reply: format!("{other:?}"),
        }),
    }
}

fn is_transport_error(err: &RedisError) -> bool {
    err.is_io_error() || err.is_connection_dropped() || err.is_connection_refusal() || err.is_timeout()
}

#[async_trait]
impl Connection for RedisConnection {
    async fn execute(&mut self, command: &Command) -> CacheResult<Reply> {
        let result: Result<Value, RedisError> = to_cmd(command).query_async(&mut self.conn).await;
        match result {
            Ok(value) => to_reply(command.name(), value),
            Err(e) => {
                if is_transport_error(&e) {
                    self.broken = true;
                }
                Err(CacheError::Backend(e.to_string()))
            }
        }
    }

    fn is_broken(&self) -> bool {
        self.broken
    }
}
