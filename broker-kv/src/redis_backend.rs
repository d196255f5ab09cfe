//! Redis-backed queue and cache.
//!
//! The queue is a list under [`TASK_QUEUE_KEY`]: `RPUSH` to enqueue, `BLPOP`
//! to dequeue. `BLPOP` holds its connection for the whole wait, so pops run on
//! a connection of their own and never stall pushes or cache traffic.

use async_trait::async_trait;
use broker_domain::TaskId;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::info;

use crate::cache::Cache;
use crate::error::{KvError, KvResult};
use crate::queue::{TaskQueue, TASK_QUEUE_KEY};

impl From<redis::RedisError> for KvError {
    fn from(err: redis::RedisError) -> Self {
        if err.is_io_error() || err.is_connection_refusal() || err.is_connection_dropped() {
            KvError::Connection(err.to_string())
        } else {
            KvError::Command(err.to_string())
        }
    }
}

async fn connect(redis_url: &str) -> KvResult<ConnectionManager> {
    let client =
        redis::Client::open(redis_url).map_err(|e| KvError::Connection(e.to_string()))?;
    Ok(ConnectionManager::new(client).await?)
}

/// Durable task queue on a Redis list.
pub struct RedisQueue {
    conn: ConnectionManager,
    blocking: Mutex<ConnectionManager>,
    key: String,
}

impl RedisQueue {
    /// Connect to `redis_url` using the default list key.
    pub async fn connect(redis_url: &str) -> KvResult<Self> {
        Self::connect_with_key(redis_url, TASK_QUEUE_KEY).await
    }

    /// Connect using a custom list key (isolates test runs).
    pub async fn connect_with_key(redis_url: &str, key: impl Into<String>) -> KvResult<Self> {
        let conn = connect(redis_url).await?;
        let blocking = connect(redis_url).await?;
        let key = key.into();
        info!(key = %key, "Connected Redis task queue");
        Ok(Self { conn, blocking: Mutex::new(blocking), key })
    }
}

#[async_trait]
impl TaskQueue for RedisQueue {
    async fn push(&self, task_id: TaskId) -> KvResult<()> {
        let mut conn = self.conn.clone();
        let _: i64 = conn.rpush(&self.key, task_id).await?;
        Ok(())
    }

    async fn pop(&self, timeout: Duration) -> KvResult<Option<TaskId>> {
        let mut conn = self.blocking.lock().await;
        // BLPOP treats 0 as "forever"; keep the wait bounded.
        let secs = timeout.as_secs_f64().max(0.01);
        let popped: Option<(String, TaskId)> =
            redis::cmd("BLPOP").arg(&self.key).arg(secs).query_async(&mut *conn).await?;
        Ok(popped.map(|(_, id)| id))
    }

    async fn len(&self) -> KvResult<usize> {
        let mut conn = self.conn.clone();
        Ok(conn.llen(&self.key).await?)
    }
}

/// TTL cache on Redis strings.
#[derive(Clone)]
pub struct RedisCache {
    conn: ConnectionManager,
}

impl RedisCache {
    /// Connect to `redis_url`.
    pub async fn connect(redis_url: &str) -> KvResult<Self> {
        Ok(Self { conn: connect(redis_url).await? })
    }
}

#[async_trait]
impl Cache for RedisCache {
    async fn get(&self, key: &str) -> KvResult<Option<String>> {
        let mut conn = self.conn.clone();
        Ok(conn.get(key).await?)
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> KvResult<()> {
        let mut conn = self.conn.clone();
        let secs = ttl.as_secs().max(1);
        let _: () = conn.set_ex(key, value, secs).await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> KvResult<()> {
        let mut conn = self.conn.clone();
        let _: i64 = conn.del(key).await?;
        Ok(())
    }
}
