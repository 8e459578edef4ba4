//! Cache backend implementations.

use super::key::RequestKey;
use crate::Result;
use async_trait::async_trait;
use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;

/// A stored response. Replaced wholesale on refresh, never mutated in place.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub data: Arc<[u8]>,
    pub stored_at: Instant,
    pub expires_at: Instant,
}

impl CacheEntry {
    pub fn new(data: Vec<u8>, ttl: Duration) -> Self {
        let now = Instant::now();
        Self {
            data: data.into(),
            stored_at: now,
            expires_at: now + ttl,
        }
    }

    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }

    /// Past `expires_at + grace`; no longer usable even as a fallback.
    pub fn is_evictable(&self, now: Instant, grace: Duration) -> bool {
        now >= self.expires_at + grace
    }
}

/// Storage for serialized responses.
///
/// Backends return expired entries as well; freshness is decided by
/// [`ResponseCache`](super::ResponseCache).
#[async_trait]
pub trait CacheBackend: Send + Sync {
    async fn get(&self, key: &RequestKey) -> Result<Option<CacheEntry>>;
    async fn set(&self, key: &RequestKey, entry: CacheEntry) -> Result<()>;
    async fn delete(&self, key: &RequestKey) -> Result<bool>;
    /// True if a non-expired entry exists.
    async fn exists(&self, key: &RequestKey) -> Result<bool>;
    async fn clear(&self) -> Result<()>;
    async fn len(&self) -> Result<usize>;
    /// True if an entry is stored for `key`, expired or not. Does not count as a use.
    fn holds(&self, key: &RequestKey) -> bool;
    /// Drop entries past `expires_at + grace`. Returns the number dropped.
    fn evict_expired(&self, grace: Duration) -> usize;
    fn name(&self) -> &'static str;
}

/// In-memory, LRU-bounded backend.
pub struct MemoryCache {
    entries: Mutex<LruCache<String, CacheEntry>>,
}

impl MemoryCache {
    pub fn new(max_entries: usize) -> Self {
        let cap = NonZeroUsize::new(max_entries.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(cap)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, LruCache<String, CacheEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl CacheBackend for MemoryCache {
    async fn get(&self, key: &RequestKey) -> Result<Option<CacheEntry>> {
        Ok(self.lock().get(key.as_str()).cloned())
    }
    async fn set(&self, key: &RequestKey, entry: CacheEntry) -> Result<()> {
        self.lock().put(key.as_str().to_string(), entry);
        Ok(())
    }
    async fn delete(&self, key: &RequestKey) -> Result<bool> {
        Ok(self.lock().pop(key.as_str()).is_some())
    }
    async fn exists(&self, key: &RequestKey) -> Result<bool> {
        Ok(self
            .lock()
            .peek(key.as_str())
            .map(|e| !e.is_expired())
            .unwrap_or(false))
    }
    async fn clear(&self) -> Result<()> {
        self.lock().clear();
        Ok(())
    }
    async fn len(&self) -> Result<usize> {
        Ok(self.lock().len())
    }
    fn holds(&self, key: &RequestKey) -> bool {
        self.lock().contains(key.as_str())
    }
    fn evict_expired(&self, grace: Duration) -> usize {
        let now = Instant::now();
        let mut entries = self.lock();
        let doomed: Vec<String> = entries
            .iter()
            .filter(|(_, e)| e.is_evictable(now, grace))
            .map(|(k, _)| k.clone())
            .collect();
        for k in &doomed {
            entries.pop(k);
        }
        doomed.len()
    }
    fn name(&self) -> &'static str {
        "memory"
    }
}

/// Backend that stores nothing. Every lookup misses.
pub struct NullCache;
impl NullCache {
    pub fn new() -> Self {
        Self
    }
}
impl Default for NullCache {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CacheBackend for NullCache {
    async fn get(&self, _: &RequestKey) -> Result<Option<CacheEntry>> {
        Ok(None)
    }
    async fn set(&self, _: &RequestKey, _: CacheEntry) -> Result<()> {
        Ok(())
    }
    async fn delete(&self, _: &RequestKey) -> Result<bool> {
        Ok(false)
    }
    async fn exists(&self, _: &RequestKey) -> Result<bool> {
        Ok(false)
    }
    async fn clear(&self) -> Result<()> {
        Ok(())
    }
    async fn len(&self) -> Result<usize> {
        Ok(0)
    }
    fn holds(&self, _: &RequestKey) -> bool {
        false
    }
    fn evict_expired(&self, _: Duration) -> usize {
        0
    }
    fn name(&self) -> &'static str {
        "null"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_memory_cache_keeps_expired_until_evicted() {
        let cache = MemoryCache::new(10);
        let key = RequestKey::new("rk:a");
        cache
            .set(&key, CacheEntry::new(b"v".to_vec(), Duration::from_secs(5)))
            .await
            .unwrap();
        assert!(cache.exists(&key).await.unwrap());

        tokio::time::advance(Duration::from_secs(6)).await;
        assert!(!cache.exists(&key).await.unwrap());
        assert!(cache.get(&key).await.unwrap().is_some());

        assert_eq!(cache.evict_expired(Duration::from_secs(10)), 0);
        tokio::time::advance(Duration::from_secs(10)).await;
        assert_eq!(cache.evict_expired(Duration::from_secs(10)), 1);
        assert!(cache.get(&key).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_memory_cache_lru_bound() {
        let cache = MemoryCache::new(2);
        for k in ["rk:1", "rk:2", "rk:3"] {
            cache
                .set(&RequestKey::new(k), CacheEntry::new(vec![1], Duration::from_secs(60)))
                .await
                .unwrap();
        }
        assert_eq!(cache.len().await.unwrap(), 2);
        assert!(cache.get(&RequestKey::new("rk:1")).await.unwrap().is_none());
        assert!(cache.get(&RequestKey::new("rk:3")).await.unwrap().is_some());
    }

    #[test]
    fn test_null_cache_stores_nothing() {
        let cache = NullCache::new();
        let key = RequestKey::new("rk:a");
        tokio_test::block_on(async {
            cache
                .set(&key, CacheEntry::new(vec![1], Duration::from_secs(60)))
                .await
                .unwrap();
            assert!(cache.get(&key).await.unwrap().is_none());
        });
        assert_eq!(cache.name(), "null");
    }
}
