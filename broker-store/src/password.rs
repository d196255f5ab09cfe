//! Credential hashing applied before any password reaches storage.
//!
//! bcrypt is deliberately slow, so both operations run on the blocking pool
//! instead of an async worker thread.

use crate::error::StoreError;

/// Hash a plain-text password with bcrypt. An empty password stays empty
/// (the account cannot log in with a password).
pub async fn hash_password(plain: &str) -> Result<String, StoreError> {
    if plain.is_empty() {
        return Ok(String::new());
    }
    let plain = plain.to_string();
    tokio::task::spawn_blocking(move || bcrypt::hash(plain, bcrypt::DEFAULT_COST))
        .await
        .map_err(|e| StoreError::Password(e.to_string()))?
        .map_err(|e| StoreError::Password(e.to_string()))
}

/// Check a plain-text password against a stored bcrypt hash.
pub async fn verify_password(plain: &str, hash: &str) -> bool {
    if hash.is_empty() {
        return false;
    }
    let (plain, hash) = (plain.to_string(), hash.to_string());
    tokio::task::spawn_blocking(move || bcrypt::verify(plain, &hash).unwrap_or(false))
        .await
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_hash_and_verify() {
        let hash = hash_password("hunter2").await.unwrap();
        assert!(hash.starts_with("$2"));
        assert!(verify_password("hunter2", &hash).await);
        assert!(!verify_password("hunter3", &hash).await);
    }

    #[tokio::test]
    async fn test_empty_password_never_verifies() {
        assert_eq!(hash_password("").await.unwrap(), "");
        assert!(!verify_password("", "").await);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_hashing_leaves_the_runtime_free() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let ticker = {
            let ticks = ticks.clone();
            tokio::spawn(async move {
                loop {
                    tokio::time::sleep(Duration::from_millis(1)).await;
                    ticks.fetch_add(1, Ordering::SeqCst);
                }
            })
        };

        hash_password("hunter2").await.unwrap();
        ticker.abort();

        assert!(ticks.load(Ordering::SeqCst) > 0);
    }
}
