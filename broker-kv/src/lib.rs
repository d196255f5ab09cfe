//! Key-value infrastructure for the broker: the durable task queue and the
//! TTL cache.
//!
//! - **Queue**: FIFO of task ids with blocking pop (`task_queue` list key)
//! - **Cache**: string KV with TTL; the key layout lives in [`keys`]
//!
//! Both have an in-memory backend for tests and development and a Redis
//! backend (feature `redis`) for deployments that need the queue to survive a
//! restart.

#![warn(clippy::all)]

pub mod cache;
pub mod error;
pub mod keys;
pub mod queue;
#[cfg(feature = "redis")]
pub mod redis_backend;

pub use cache::{deny_token, get_json, is_token_denied, set_json, Cache, MemoryCache};
pub use error::{KvError, KvResult};
pub use queue::{MemoryQueue, TaskQueue, TASK_QUEUE_KEY};
#[cfg(feature = "redis")]
pub use redis_backend::{RedisCache, RedisQueue};
