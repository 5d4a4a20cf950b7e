//! Redis-backed shared counter store.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::{ConnectionLike, MultiplexedConnection};
use redis::{AsyncCommands, Pipeline, RedisResult, Script};

use super::{CounterStore, Increment};
use crate::error::{RatekeeperError, Result};

const DELETE_IF_EQUALS_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
  return redis.call('DEL', KEYS[1])
else
  return 0
end
"#;

/// Redis implementation of the shared counter store.
#[derive(Clone)]
pub struct RedisCounterStore {
    client: redis::Client,
}

impl RedisCounterStore {
    /// Creates a store on a configured Redis client.
    #[must_use]
    pub fn new(client: redis::Client) -> Self {
        Self { client }
    }

    /// Creates a store from a `redis://` URL.
    pub fn open(url: &str) -> Result<Self> {
        let client = redis::Client::open(url).map_err(|error| {
            RatekeeperError::Config(format!("invalid redis url {url}: {error}"))
        })?;
        Ok(Self::new(client))
    }

    async fn connection(&self) -> Result<MultiplexedConnection> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(|error| {
                RatekeeperError::BackingStore(format!("failed to connect to redis: {error}"))
            })
    }
}

fn ttl_seconds(ttl: Duration) -> i64 {
    i64::try_from(ttl.as_secs().max(1)).unwrap_or(i64::MAX)
}

/// `SET key value NX EX ttl`; a nil reply means the key already existed.
async fn execute_set_if_absent<C: ConnectionLike>(
    conn: &mut C,
    key: &str,
    value: &str,
    ttl: Duration,
) -> RedisResult<bool> {
    let reply: Option<String> = redis::cmd("SET")
        .arg(key)
        .arg(value)
        .arg("NX")
        .arg("EX")
        .arg(ttl_seconds(ttl))
        .query_async(conn)
        .await?;
    Ok(reply.is_some())
}

/// One MULTI/EXEC transaction applying every increment.
fn counter_batch(increments: &[Increment]) -> Pipeline {
    let mut pipe = redis::pipe();
    pipe.atomic();
    for increment in increments {
        pipe.incr(increment.key.as_str(), 1).ignore();
        if let Some(ttl) = increment.ttl {
            pipe.expire(increment.key.as_str(), ttl_seconds(ttl)).ignore();
        }
    }
    pipe
}

async fn execute_increment_all<C: ConnectionLike>(
    conn: &mut C,
    increments: &[Increment],
) -> RedisResult<()> {
    if increments.is_empty() {
        return Ok(());
    }
    counter_batch(increments).query_async::<()>(conn).await
}

/// Compare-and-delete through the release script; a zero reply means the
/// key was missing or held another value.
async fn execute_delete_if_equals<C: ConnectionLike>(
    conn: &mut C,
    key: &str,
    expected: &str,
) -> RedisResult<bool> {
    let removed: i64 = Script::new(DELETE_IF_EQUALS_SCRIPT)
        .key(key)
        .arg(expected)
        .invoke_async(conn)
        .await?;
    Ok(removed > 0)
}

#[async_trait]
impl CounterStore for RedisCounterStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut connection = self.connection().await?;
        let value: Option<String> = connection.get(key).await.map_err(|error| {
            RatekeeperError::BackingStore(format!("failed to read {key}: {error}"))
        })?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut connection = self.connection().await?;
        let (): () = connection.set(key, value).await.map_err(|error| {
            RatekeeperError::BackingStore(format!("failed to write {key}: {error}"))
        })?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let mut connection = self.connection().await?;
        let removed: i64 = connection.del(key).await.map_err(|error| {
            RatekeeperError::BackingStore(format!("failed to delete {key}: {error}"))
        })?;
        Ok(removed > 0)
    }

    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        let mut connection = self.connection().await?;
        execute_set_if_absent(&mut connection, key, value, ttl)
            .await
            .map_err(|error| {
                RatekeeperError::BackingStore(format!("failed to create {key}: {error}"))
            })
    }

    async fn increment_all(&self, increments: &[Increment]) -> Result<()> {
        if increments.is_empty() {
            return Ok(());
        }

        let mut connection = self.connection().await?;
        execute_increment_all(&mut connection, increments)
            .await
            .map_err(|error| {
                RatekeeperError::BackingStore(format!("failed to apply counter batch: {error}"))
            })
    }

    async fn delete_if_equals(&self, key: &str, expected: &str) -> Result<bool> {
        let mut connection = self.connection().await?;
        execute_delete_if_equals(&mut connection, key, expected)
            .await
            .map_err(|error| {
                RatekeeperError::BackingStore(format!("failed to release {key}: {error}"))
            })
    }

    fn store_type(&self) -> &'static str {
        "redis"
    }
}
