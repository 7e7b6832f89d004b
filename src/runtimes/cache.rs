//! Node result caching.
//!
//! A node with a [`CachePolicy`](crate::node::CachePolicy) has its writes
//! keyed by a deterministic hash of its input; a hit skips execution
//! entirely. The store is pluggable and shared; a miss on read is never an
//! error.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rustc_hash::FxHashMap;
use serde_json::Value;
use std::sync::RwLock;
use std::time::Duration;

/// Writes captured from a completed node execution.
pub type CachedWrites = Vec<(String, Value)>;

/// Shared cache for node results.
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Cached writes for `key`, if present and not expired.
    async fn get(&self, key: &str) -> Option<CachedWrites>;

    /// Store writes under `key`, optionally expiring after `ttl`.
    async fn set(&self, key: String, value: CachedWrites, ttl: Option<Duration>);
}

struct CacheEntry {
    writes: CachedWrites,
    expires_at: Option<DateTime<Utc>>,
}

/// In-memory cache with TTL expiry checked on read.
#[derive(Default)]
pub struct InMemoryCache {
    inner: RwLock<FxHashMap<String, CacheEntry>>,
}

impl InMemoryCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CacheStore for InMemoryCache {
    async fn get(&self, key: &str) -> Option<CachedWrites> {
        let Ok(map) = self.inner.read() else {
            return None;
        };
        let entry = map.get(key)?;
        if let Some(expires_at) = entry.expires_at
            && expires_at <= Utc::now()
        {
            return None;
        }
        Some(entry.writes.clone())
    }

    async fn set(&self, key: String, value: CachedWrites, ttl: Option<Duration>) {
        let expires_at = ttl.and_then(|ttl| {
            chrono::Duration::from_std(ttl)
                .ok()
                .map(|ttl| Utc::now() + ttl)
        });
        if let Ok(mut map) = self.inner.write() {
            map.insert(
                key,
                CacheEntry {
                    writes: value,
                    expires_at,
                },
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn miss_on_read_is_none() {
        let cache = InMemoryCache::new();
        assert!(cache.get("absent").await.is_none());
    }

    #[tokio::test]
    async fn set_then_get_round_trips() {
        let cache = InMemoryCache::new();
        cache
            .set("k".into(), vec![("out".into(), json!(1))], None)
            .await;
        assert_eq!(cache.get("k").await, Some(vec![("out".into(), json!(1))]));
    }

    #[tokio::test]
    async fn expired_entries_read_as_misses() {
        let cache = InMemoryCache::new();
        cache
            .set(
                "k".into(),
                vec![("out".into(), json!(1))],
                Some(Duration::ZERO),
            )
            .await;
        assert!(cache.get("k").await.is_none());
    }
}
