//! Fingerprint counting store

use async_trait::async_trait;
use bulkscan_common::Result;
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

/// Counts how often a key was reported. Counters expire after a TTL that
/// every increment refreshes.
#[async_trait]
pub trait CountStore: Send + Sync {
    /// Increment the counter and return the new count
    async fn increment(&self, key: &str) -> Result<u64>;

    /// Current count, 0 for unknown or expired keys
    async fn get(&self, key: &str) -> Result<u64>;
}

#[derive(Debug, Clone, Copy)]
struct Counter {
    count: u64,
    expires_at: DateTime<Utc>,
}

/// In-process store
#[derive(Debug, Clone)]
pub struct MemoryCountStore {
    ttl: Duration,
    counters: Arc<RwLock<HashMap<String, Counter>>>,
}

impl MemoryCountStore {
    pub fn new(ttl_secs: u64) -> Self {
        let secs = i64::try_from(ttl_secs).unwrap_or(i64::MAX).min(i64::MAX / 1000);
        let ttl = Duration::seconds(secs);
        Self {
            ttl,
            counters: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    async fn increment_at(&self, key: &str, now: DateTime<Utc>) -> u64 {
        let mut counters = self.counters.write().await;
        let expires_at = now.checked_add_signed(self.ttl).unwrap_or(DateTime::<Utc>::MAX_UTC);
        let counter = counters
            .entry(key.to_string())
            .and_modify(|c| {
                if c.expires_at <= now {
                    c.count = 0;
                }
            })
            .or_insert(Counter {
                count: 0,
                expires_at,
            });
        counter.count += 1;
        counter.expires_at = expires_at;
        counter.count
    }

    async fn get_at(&self, key: &str, now: DateTime<Utc>) -> u64 {
        let counters = self.counters.read().await;
        match counters.get(key) {
            Some(counter) if counter.expires_at > now => counter.count,
            _ => 0,
        }
    }

    /// Drop expired counters, returning how many were removed
    pub async fn purge_expired(&self) -> usize {
        self.purge_at(Utc::now()).await
    }

    async fn purge_at(&self, now: DateTime<Utc>) -> usize {
        let mut counters = self.counters.write().await;
        let before = counters.len();
        counters.retain(|_, c| c.expires_at > now);
        let removed = before - counters.len();
        if removed > 0 {
            debug!("Purged {} expired counters", removed);
        }
        removed
    }

    pub async fn len(&self) -> usize {
        self.counters.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.counters.read().await.is_empty()
    }
}

#[async_trait]
impl CountStore for MemoryCountStore {
    async fn increment(&self, key: &str) -> Result<u64> {
        Ok(self.increment_at(key, Utc::now()).await)
    }

    async fn get(&self, key: &str) -> Result<u64> {
        Ok(self.get_at(key, Utc::now()).await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_increment_and_get() {
        let store = MemoryCountStore::new(3600);
        assert_eq!(store.get("abc").await.unwrap(), 0);
        assert_eq!(store.increment("abc").await.unwrap(), 1);
        assert_eq!(store.increment("abc").await.unwrap(), 2);
        assert_eq!(store.get("abc").await.unwrap(), 2);
        assert_eq!(store.get("other").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_expiry_and_refresh() {
        let store = MemoryCountStore::new(60);
        let start = Utc::now();

        store.increment_at("key", start).await;
        assert_eq!(store.get_at("key", start + Duration::seconds(59)).await, 1);
        assert_eq!(store.get_at("key", start + Duration::seconds(60)).await, 0);

        // an increment before expiry extends the lifetime
        store.increment_at("key", start + Duration::seconds(30)).await;
        assert_eq!(store.get_at("key", start + Duration::seconds(80)).await, 2);

        // an increment after expiry starts over
        let later = start + Duration::seconds(200);
        assert_eq!(store.increment_at("key", later).await, 1);
    }

    #[tokio::test]
    async fn test_purge_expired() {
        let store = MemoryCountStore::new(10);
        let start = Utc::now();
        store.increment_at("old", start).await;
        store.increment_at("new", start + Duration::seconds(8)).await;

        assert_eq!(store.purge_at(start + Duration::seconds(12)).await, 1);
        assert_eq!(store.len().await, 1);
        assert_eq!(store.get_at("new", start + Duration::seconds(12)).await, 1);
    }

    #[tokio::test]
    async fn test_shared_between_clones() {
        let store = MemoryCountStore::new(3600);
        let clone = store.clone();
        let handle = tokio::spawn(async move { clone.increment("shared").await.unwrap() });
        handle.await.unwrap();
        assert_eq!(store.get("shared").await.unwrap(), 1);
        assert!(!store.is_empty().await);
    }
}
