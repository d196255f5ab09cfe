//! TTL cache port, in-memory backend and typed helpers.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;

use crate::error::{KvError, KvResult};
use crate::keys;

/// Port for the string KV cache.
#[async_trait]
pub trait Cache: Send + Sync {
    /// Read a live value.
    async fn get(&self, key: &str) -> KvResult<Option<String>>;

    /// Write a value that expires after `ttl`.
    async fn set(&self, key: &str, value: &str, ttl: Duration) -> KvResult<()>;

    /// Remove a key (no error if absent).
    async fn delete(&self, key: &str) -> KvResult<()>;
}

/// In-process cache for tests and single-node development.
#[derive(Default)]
pub struct MemoryCache {
    entries: RwLock<HashMap<String, (String, Instant)>>,
}

impl MemoryCache {
    /// Create an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a live value exists for `key`.
    pub async fn contains(&self, key: &str) -> bool {
        matches!(self.get(key).await, Ok(Some(_)))
    }
}

#[async_trait]
impl Cache for MemoryCache {
    async fn get(&self, key: &str) -> KvResult<Option<String>> {
        let entries = self.entries.read().await;
        Ok(entries
            .get(key)
            .filter(|(_, expires_at)| Instant::now() < *expires_at)
            .map(|(value, _)| value.clone()))
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> KvResult<()> {
        let mut entries = self.entries.write().await;
        let now = Instant::now();
        entries.retain(|_, (_, expires_at)| now < *expires_at);
        entries.insert(key.to_string(), (value.to_string(), now + ttl));
        Ok(())
    }

    async fn delete(&self, key: &str) -> KvResult<()> {
        self.entries.write().await.remove(key);
        Ok(())
    }
}

/// Read and decode a JSON value.
pub async fn get_json<T: DeserializeOwned>(cache: &dyn Cache, key: &str) -> KvResult<Option<T>> {
    match cache.get(key).await? {
        Some(raw) => serde_json::from_str(&raw)
            .map(Some)
            .map_err(|e| KvError::Serialization(e.to_string())),
        None => Ok(None),
    }
}

/// Encode and write a JSON value.
pub async fn set_json<T: Serialize + Sync>(
    cache: &dyn Cache,
    key: &str,
    value: &T,
    ttl: Duration,
) -> KvResult<()> {
    let raw = serde_json::to_string(value).map_err(|e| KvError::Serialization(e.to_string()))?;
    cache.set(key, &raw, ttl).await
}

/// Deny a token for the rest of its lifetime.
pub async fn deny_token(cache: &dyn Cache, token: &str, remaining: Duration) -> KvResult<()> {
    if remaining.is_zero() {
        return Ok(());
    }
    cache.set(&keys::denylist(token), "1", remaining).await
}

/// Whether a token has been denied.
pub async fn is_token_denied(cache: &dyn Cache, token: &str) -> KvResult<bool> {
    Ok(cache.get(&keys::denylist(token)).await?.is_some())
}
