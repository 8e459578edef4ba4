//! Response cache with stale-while-revalidate and error-time fallback.

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::backend::{CacheBackend, CacheEntry, MemoryCache};
use super::key::RequestKey;
use crate::config::duration_ms;
use crate::sweep::{Sweep, Sweeper};
use crate::{Error, ErrorContext, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub enabled: bool,
    /// Serve expired entries immediately while the caller refreshes them.
    pub stale_while_revalidate: bool,
    pub max_entries: usize,
    pub max_entry_size: usize,
    pub key_prefix: Option<String>,
    /// How long past `expires_at` an entry is kept for stale serving.
    #[serde(with = "duration_ms", rename = "eviction_grace_ms")]
    pub eviction_grace: Duration,
    #[serde(with = "duration_ms", rename = "sweep_interval_ms")]
    pub sweep_interval: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            stale_while_revalidate: true,
            max_entries: 10_000,
            max_entry_size: 2 * 1024 * 1024,
            key_prefix: None,
            eviction_grace: Duration::from_secs(3600),
            sweep_interval: Duration::from_secs(60),
        }
    }
}

impl CacheConfig {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }
    pub fn with_stale_while_revalidate(mut self, swr: bool) -> Self {
        self.stale_while_revalidate = swr;
        self
    }
    pub fn with_max_entries(mut self, max: usize) -> Self {
        self.max_entries = max;
        self
    }
    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = Some(prefix.into());
        self
    }
    pub fn with_eviction_grace(mut self, grace: Duration) -> Self {
        self.eviction_grace = grace;
        self
    }
    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }
}

/// How trustworthy a cached value is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Freshness {
    /// Within its TTL.
    Fresh,
    /// Expired; a refresh is expected to be in progress.
    Revalidating,
    /// Expired and the last refresh attempt failed (or no refresh is possible).
    Unconfirmed,
}

impl Freshness {
    pub fn is_stale(&self) -> bool {
        !matches!(self, Self::Fresh)
    }
}

/// A value read from the cache.
#[derive(Debug, Clone)]
pub struct CacheLookup<T> {
    pub value: T,
    pub freshness: Freshness,
    pub stored_at: Instant,
    pub expires_at: Instant,
}

impl<T> CacheLookup<T> {
    pub fn is_stale(&self) -> bool {
        self.freshness.is_stale()
    }
}

#[derive(Debug, Clone, Default)]
pub struct CacheStats {
    pub hits: u64,
    pub stale_hits: u64,
    pub misses: u64,
    pub sets: u64,
    pub evictions: u64,
    pub errors: u64,
}

impl CacheStats {
    pub fn hit_ratio(&self) -> f64 {
        let hits = self.hits + self.stale_hits;
        let total = hits + self.misses;
        if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64
        }
    }
}

struct AtomicStats {
    hits: AtomicU64,
    stale_hits: AtomicU64,
    misses: AtomicU64,
    sets: AtomicU64,
    evictions: AtomicU64,
    errors: AtomicU64,
}
impl AtomicStats {
    fn new() -> Self {
        Self {
            hits: AtomicU64::new(0),
            stale_hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            sets: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            errors: AtomicU64::new(0),
        }
    }
    fn to_stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            stale_hits: self.stale_hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            sets: self.sets.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }
}

/// Time-bounded response store.
///
/// Reads never trigger upstream calls. With stale-while-revalidate enabled an
/// expired entry is returned flagged [`Freshness::Revalidating`]; scheduling the
/// refresh is the caller's job.
pub struct ResponseCache {
    config: CacheConfig,
    backend: Box<dyn CacheBackend>,
    stats: AtomicStats,
    /// Keys whose last refresh failed while a stale entry was held.
    unconfirmed: Mutex<HashSet<RequestKey>>,
    sweeper: Sweeper,
}

impl ResponseCache {
    /// Build a cache over `backend` and start its eviction sweep.
    pub fn new(config: CacheConfig, backend: Box<dyn CacheBackend>) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            sweeper: Sweeper::spawn(config.sweep_interval, weak.clone()),
            config,
            backend,
            stats: AtomicStats::new(),
            unconfirmed: Mutex::new(HashSet::new()),
        })
    }

    /// In-memory cache sized from `config.max_entries`.
    pub fn in_memory(config: CacheConfig) -> Arc<Self> {
        let backend = MemoryCache::new(config.max_entries);
        Self::new(config, Box::new(backend))
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub async fn get<T: DeserializeOwned>(&self, key: &RequestKey) -> Result<Option<CacheLookup<T>>> {
        let Some(entry) = self.read_entry(key).await? else {
            self.stats.misses.fetch_add(1, Ordering::Relaxed);
            return Ok(None);
        };

        let freshness = if !entry.is_expired() {
            Freshness::Fresh
        } else if self.config.stale_while_revalidate {
            self.stale_freshness(key)
        } else {
            self.stats.misses.fetch_add(1, Ordering::Relaxed);
            return Ok(None);
        };

        let Some(lookup) = self.decode(key, entry, freshness) else {
            self.stats.misses.fetch_add(1, Ordering::Relaxed);
            return Ok(None);
        };
        if freshness.is_stale() {
            self.stats.stale_hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.stats.hits.fetch_add(1, Ordering::Relaxed);
        }
        Ok(Some(lookup))
    }

    /// Any entry still held for `key`, regardless of expiry.
    ///
    /// Only for serving last-known-good data after an upstream failure. Expired
    /// values come back flagged [`Freshness::Unconfirmed`].
    pub async fn get_stale<T: DeserializeOwned>(&self, key: &RequestKey) -> Result<Option<CacheLookup<T>>> {
        let Some(entry) = self.read_entry(key).await? else {
            return Ok(None);
        };
        let freshness = if entry.is_expired() {
            Freshness::Unconfirmed
        } else {
            Freshness::Fresh
        };
        let lookup = self.decode(key, entry, freshness);
        if lookup.is_some() {
            self.stats.stale_hits.fetch_add(1, Ordering::Relaxed);
        }
        Ok(lookup)
    }

    pub async fn set<T: Serialize>(&self, key: &RequestKey, value: &T, ttl: Duration) -> Result<()> {
        if !self.config.enabled || key.is_degenerate() {
            return Ok(());
        }
        let data = serde_json::to_vec(value).map_err(|e| {
            self.stats.errors.fetch_add(1, Ordering::Relaxed);
            Error::cache_with_context(
                format!("failed to encode cache entry: {e}"),
                ErrorContext::new()
                    .with_field_path(key.as_str())
                    .with_source("response_cache"),
            )
        })?;
        if data.len() > self.config.max_entry_size {
            debug!(key = %key, size = data.len(), "skipping oversized cache entry");
            return Ok(());
        }
        let prefixed = self.prefix_key(key);
        match self.backend.set(&prefixed, CacheEntry::new(data, ttl)).await {
            Ok(()) => {
                self.stats.sets.fetch_add(1, Ordering::Relaxed);
                self.unconfirmed_set().remove(key);
                Ok(())
            }
            Err(e) => {
                self.stats.errors.fetch_add(1, Ordering::Relaxed);
                Err(e)
            }
        }
    }

    /// Record that refreshing `key` failed. The held entry is left untouched;
    /// keys with no held entry are ignored.
    pub fn mark_unconfirmed(&self, key: &RequestKey) {
        if self.backend.holds(&self.prefix_key(key)) {
            self.unconfirmed_set().insert(key.clone());
        }
    }

    pub async fn delete(&self, key: &RequestKey) -> Result<bool> {
        self.unconfirmed_set().remove(key);
        let prefixed = self.prefix_key(key);
        self.backend.delete(&prefixed).await
    }

    pub async fn clear(&self) -> Result<()> {
        self.unconfirmed_set().clear();
        self.backend.clear().await
    }

    pub async fn len(&self) -> Result<usize> {
        self.backend.len().await
    }

    pub fn stats(&self) -> CacheStats {
        self.stats.to_stats()
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    /// Stop the eviction sweep.
    pub fn shutdown(&self) {
        self.sweeper.shutdown();
    }

    async fn read_entry(&self, key: &RequestKey) -> Result<Option<CacheEntry>> {
        if !self.config.enabled || key.is_degenerate() {
            return Ok(None);
        }
        let prefixed = self.prefix_key(key);
        match self.backend.get(&prefixed).await {
            Ok(Some(entry)) if entry.is_evictable(Instant::now(), self.config.eviction_grace) => {
                Ok(None)
            }
            Ok(entry) => Ok(entry),
            Err(e) => {
                self.stats.errors.fetch_add(1, Ordering::Relaxed);
                Err(e)
            }
        }
    }

    fn decode<T: DeserializeOwned>(&self, key: &RequestKey, entry: CacheEntry, freshness: Freshness) -> Option<CacheLookup<T>> {
        match serde_json::from_slice(&entry.data) {
            Ok(value) => Some(CacheLookup {
                value,
                freshness,
                stored_at: entry.stored_at,
                expires_at: entry.expires_at,
            }),
            Err(e) => {
                warn!(key = %key, error = %e, "cached entry failed to decode");
                self.stats.errors.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    fn stale_freshness(&self, key: &RequestKey) -> Freshness {
        if self.unconfirmed_set().contains(key) {
            Freshness::Unconfirmed
        } else {
            Freshness::Revalidating
        }
    }

    fn unconfirmed_set(&self) -> std::sync::MutexGuard<'_, HashSet<RequestKey>> {
        self.unconfirmed.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn prefix_key(&self, key: &RequestKey) -> RequestKey {
        if let Some(ref p) = self.config.key_prefix {
            RequestKey::new(format!("{}:{}", p, key.as_str()))
        } else {
            key.clone()
        }
    }
}

impl Sweep for ResponseCache {
    fn sweep(&self) -> usize {
        let removed = self.backend.evict_expired(self.config.eviction_grace);
        // Evicted or LRU-displaced entries take their unconfirmed flag with them.
        self.unconfirmed_set()
            .retain(|key| self.backend.holds(&self.prefix_key(key)));
        self.stats
            .evictions
            .fetch_add(removed as u64, Ordering::Relaxed);
        removed
    }

    fn sweep_name(&self) -> &'static str {
        "response_cache"
    }
}

/// Reject configurations that would make the cache useless or unbounded.
pub(crate) fn validate(config: &CacheConfig) -> Result<()> {
    if config.enabled && config.max_entries == 0 {
        return Err(Error::configuration_with_context(
            "cache.max_entries must be positive when the cache is enabled",
            ErrorContext::new()
                .with_field_path("cache.max_entries")
                .with_source("config_loader"),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::NullCache;

    fn key(s: &str) -> RequestKey {
        RequestKey::new(s)
    }

    #[tokio::test(start_paused = true)]
    async fn test_round_trip_then_miss_without_swr() {
        let cache = ResponseCache::in_memory(CacheConfig::new().with_stale_while_revalidate(false));
        cache
            .set(&key("rk:a"), &vec!["v1".to_string()], Duration::from_secs(300))
            .await
            .unwrap();

        let hit: CacheLookup<Vec<String>> = cache.get(&key("rk:a")).await.unwrap().unwrap();
        assert_eq!(hit.value, vec!["v1".to_string()]);
        assert_eq!(hit.freshness, Freshness::Fresh);

        tokio::time::advance(Duration::from_secs(301)).await;
        let miss: Option<CacheLookup<Vec<String>>> = cache.get(&key("rk:a")).await.unwrap();
        assert!(miss.is_none());

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.sets, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_swr_returns_stale_then_refreshed() {
        let cache = ResponseCache::in_memory(CacheConfig::new());
        cache.set(&key("rk:a"), &1u32, Duration::from_secs(60)).await.unwrap();
        tokio::time::advance(Duration::from_secs(61)).await;

        let stale: CacheLookup<u32> = cache.get(&key("rk:a")).await.unwrap().unwrap();
        assert_eq!(stale.value, 1);
        assert_eq!(stale.freshness, Freshness::Revalidating);

        cache.set(&key("rk:a"), &2u32, Duration::from_secs(60)).await.unwrap();
        let fresh: CacheLookup<u32> = cache.get(&key("rk:a")).await.unwrap().unwrap();
        assert_eq!(fresh.value, 2);
        assert!(!fresh.is_stale());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_refresh_flags_unconfirmed_until_next_set() {
        let cache = ResponseCache::in_memory(CacheConfig::new());
        cache.set(&key("rk:a"), &"old", Duration::from_secs(10)).await.unwrap();
        tokio::time::advance(Duration::from_secs(11)).await;

        cache.mark_unconfirmed(&key("rk:a"));
        let lookup: CacheLookup<String> = cache.get(&key("rk:a")).await.unwrap().unwrap();
        assert_eq!(lookup.value, "old");
        assert_eq!(lookup.freshness, Freshness::Unconfirmed);

        cache.set(&key("rk:a"), &"new", Duration::from_secs(10)).await.unwrap();
        let lookup: CacheLookup<String> = cache.get(&key("rk:a")).await.unwrap().unwrap();
        assert_eq!(lookup.freshness, Freshness::Fresh);
    }

    #[tokio::test(start_paused = true)]
    async fn test_get_stale_serves_expired_until_grace_elapses() {
        let config = CacheConfig::new()
            .with_stale_while_revalidate(false)
            .with_eviction_grace(Duration::from_secs(100));
        let cache = ResponseCache::in_memory(config);
        cache.set(&key("rk:a"), &7i64, Duration::from_secs(10)).await.unwrap();
        tokio::time::advance(Duration::from_secs(50)).await;

        let plain: Option<CacheLookup<i64>> = cache.get(&key("rk:a")).await.unwrap();
        assert!(plain.is_none());
        let fallback: CacheLookup<i64> = cache.get_stale(&key("rk:a")).await.unwrap().unwrap();
        assert_eq!(fallback.value, 7);
        assert_eq!(fallback.freshness, Freshness::Unconfirmed);

        tokio::time::advance(Duration::from_secs(61)).await;
        let gone: Option<CacheLookup<i64>> = cache.get_stale(&key("rk:a")).await.unwrap();
        assert!(gone.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_evicts_past_grace() {
        let config = CacheConfig::new()
            .with_eviction_grace(Duration::from_secs(5))
            .with_sweep_interval(Duration::from_secs(30));
        let cache = ResponseCache::in_memory(config);
        cache.set(&key("rk:a"), &1u8, Duration::from_secs(10)).await.unwrap();
        cache.set(&key("rk:b"), &2u8, Duration::from_secs(600)).await.unwrap();

        tokio::time::sleep(Duration::from_secs(31)).await;
        assert_eq!(cache.len().await.unwrap(), 1);
        assert_eq!(cache.stats().evictions, 1);
        cache.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn test_unconfirmed_flags_go_with_evicted_entries() {
        let config = CacheConfig::new()
            .with_eviction_grace(Duration::from_secs(5))
            .with_sweep_interval(Duration::from_secs(30));
        let cache = ResponseCache::in_memory(config);
        for i in 0..100 {
            let k = key(&format!("rk:{i}"));
            cache.set(&k, &i, Duration::from_secs(1)).await.unwrap();
            cache.mark_unconfirmed(&k);
        }
        assert_eq!(cache.unconfirmed_set().len(), 100);

        tokio::time::sleep(Duration::from_secs(31)).await;
        assert_eq!(cache.len().await.unwrap(), 0);
        assert!(cache.unconfirmed_set().is_empty());

        // Nothing held, nothing to flag.
        cache.mark_unconfirmed(&key("rk:gone"));
        assert!(cache.unconfirmed_set().is_empty());
        cache.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn test_unconfirmed_flags_go_with_lru_displaced_entries() {
        let cache = ResponseCache::in_memory(CacheConfig::new().with_max_entries(2));
        cache.set(&key("rk:a"), &1u8, Duration::from_secs(60)).await.unwrap();
        cache.mark_unconfirmed(&key("rk:a"));
        cache.set(&key("rk:b"), &2u8, Duration::from_secs(60)).await.unwrap();
        cache.set(&key("rk:c"), &3u8, Duration::from_secs(60)).await.unwrap();

        cache.sweep();
        assert!(!cache.unconfirmed_set().contains(&key("rk:a")));
        cache.shutdown();
    }

    #[tokio::test]
    async fn test_unencodable_value_is_a_cache_error() {
        let cache = ResponseCache::in_memory(CacheConfig::new());
        let value: std::collections::HashMap<(u8, u8), u8> = [((1, 2), 3)].into_iter().collect();
        let err = cache.set(&key("rk:a"), &value, Duration::from_secs(60)).await.unwrap_err();
        assert!(matches!(err, Error::Cache { .. }));
        assert_eq!(err.context().and_then(|c| c.field_path.as_deref()), Some("rk:a"));
        assert_eq!(cache.stats().errors, 1);
        cache.shutdown();
    }

    #[tokio::test]
    async fn test_disabled_and_degenerate_keys_bypass_storage() {
        let cache = ResponseCache::in_memory(CacheConfig::new().with_enabled(false));
        cache.set(&key("rk:a"), &1u8, Duration::from_secs(60)).await.unwrap();
        assert!(cache.get::<u8>(&key("rk:a")).await.unwrap().is_none());

        let cache = ResponseCache::in_memory(CacheConfig::new());
        let degenerate = crate::cache::KeyGenerator::new().generate("", "", "", "u1");
        cache.set(&degenerate, &1u8, Duration::from_secs(60)).await.unwrap();
        assert_eq!(cache.len().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_key_prefix_and_null_backend() {
        let cache = ResponseCache::in_memory(CacheConfig::new().with_key_prefix("v1"));
        cache.set(&key("rk:a"), &1u8, Duration::from_secs(60)).await.unwrap();
        assert!(cache.get::<u8>(&key("rk:a")).await.unwrap().is_some());
        assert!(cache.delete(&key("rk:a")).await.unwrap());

        let cache = ResponseCache::new(CacheConfig::new(), Box::new(NullCache::new()));
        cache.set(&key("rk:a"), &1u8, Duration::from_secs(60)).await.unwrap();
        assert!(cache.get::<u8>(&key("rk:a")).await.unwrap().is_none());
        assert_eq!(cache.backend_name(), "null");
    }

    #[test]
    fn test_hit_ratio() {
        let stats = CacheStats {
            hits: 3,
            stale_hits: 1,
            misses: 4,
            ..Default::default()
        };
        assert!((stats.hit_ratio() - 0.5).abs() < f64::EPSILON);
    }
}
