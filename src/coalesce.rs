//! In-flight request coalescing.
//!
//! Concurrent calls for the same [`RequestKey`] share one pending future. The
//! first caller's factory runs; everyone else awaits a clone of its result.

use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tracing::trace;

use crate::cache::RequestKey;
use crate::config::duration_ms;
use crate::{Error, ErrorContext, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoalesceConfig {
    /// Maximum age of a pending entry that new callers may join. Must outlast
    /// the slowest fetch the retry policy allows.
    #[serde(with = "duration_ms", rename = "ttl_ms")]
    pub ttl: Duration,
    /// How long a settled entry lingers so callers arriving right after
    /// settlement still share it.
    #[serde(with = "duration_ms", rename = "grace_ms")]
    pub grace: Duration,
}

impl Default for CoalesceConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(180),
            grace: Duration::from_millis(100),
        }
    }
}

impl CoalesceConfig {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }
    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.ttl.is_zero() {
            return Err(Error::configuration_with_context(
                "coalescing ttl must be positive",
                ErrorContext::new()
                    .with_field_path("coalesce.ttl_ms")
                    .with_source("config_loader"),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
pub struct CoalescerStats {
    /// Calls to `deduplicate`.
    pub total: u64,
    /// Calls that joined an existing entry.
    pub coalesced: u64,
    /// Calls that invoked their factory.
    pub started: u64,
    pub in_flight: usize,
}

impl CoalescerStats {
    pub fn coalescing_ratio(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.coalesced as f64 / self.total as f64
        }
    }
}

struct InFlightEntry<V> {
    future: Shared<BoxFuture<'static, V>>,
    created_at: Instant,
    /// Set by the shared future itself the moment it completes.
    settled_at: Option<Instant>,
    generation: u64,
}

impl<V> InFlightEntry<V> {
    fn joinable(&self, ttl: Duration, grace: Duration) -> bool {
        match self.settled_at {
            None => self.created_at.elapsed() < ttl,
            Some(at) => at.elapsed() < grace,
        }
    }
}

type EntryMap<V> = Arc<Mutex<HashMap<RequestKey, InFlightEntry<V>>>>;

fn lock_map<V>(map: &Mutex<HashMap<RequestKey, InFlightEntry<V>>>) -> MutexGuard<'_, HashMap<RequestKey, InFlightEntry<V>>> {
    map.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Removes the entry it was created for, unless a newer generation replaced it.
/// Runs on normal completion and on unwind alike.
struct RemoveOnDrop<V> {
    entries: EntryMap<V>,
    key: RequestKey,
    generation: u64,
}

impl<V> Drop for RemoveOnDrop<V> {
    fn drop(&mut self) {
        let mut entries = lock_map(&self.entries);
        if entries
            .get(&self.key)
            .map(|e| e.generation == self.generation)
            .unwrap_or(false)
        {
            entries.remove(&self.key);
        }
    }
}

/// At most one outstanding call per key.
///
/// Failures are ordinary values here (use `V = Result<_, _>`), so every
/// coalesced caller observes the same settlement, success or error.
///
/// A caller dropping its own await does not cancel the shared call: a cleanup
/// task owns a clone of the future and drives it to completion.
pub struct InFlightCoalescer<V>
where
    V: Clone + Send + Sync + 'static,
{
    entries: EntryMap<V>,
    grace: Duration,
    next_generation: AtomicU64,
    total: AtomicU64,
    coalesced: AtomicU64,
    started: AtomicU64,
}

impl<V> InFlightCoalescer<V>
where
    V: Clone + Send + Sync + 'static,
{
    pub fn new(grace: Duration) -> Self {
        Self {
            entries: Arc::new(Mutex::new(HashMap::new())),
            grace,
            next_generation: AtomicU64::new(0),
            total: AtomicU64::new(0),
            coalesced: AtomicU64::new(0),
            started: AtomicU64::new(0),
        }
    }

    pub fn from_config(config: &CoalesceConfig) -> Self {
        Self::new(config.grace)
    }

    /// Return the result of the in-flight call for `key` if one younger than
    /// `ttl` is pending, or one settled less than `grace` ago; otherwise start
    /// `factory()` and share it.
    ///
    /// Must be called from within a tokio runtime.
    pub async fn deduplicate<F, Fut>(&self, key: &RequestKey, factory: F, ttl: Duration) -> V
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = V> + Send + 'static,
    {
        self.total.fetch_add(1, Ordering::Relaxed);

        if key.is_degenerate() {
            self.started.fetch_add(1, Ordering::Relaxed);
            return factory().await;
        }

        let shared = {
            let mut entries = lock_map(&self.entries);
            match entries.get(key) {
                Some(entry) if entry.joinable(ttl, self.grace) => {
                    self.coalesced.fetch_add(1, Ordering::Relaxed);
                    trace!(key = %key, generation = entry.generation, "joining in-flight request");
                    entry.future.clone()
                }
                _ => {
                    self.started.fetch_add(1, Ordering::Relaxed);
                    let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
                    let future = self.stamped(key.clone(), generation, factory()).boxed().shared();
                    entries.insert(
                        key.clone(),
                        InFlightEntry {
                            future: future.clone(),
                            created_at: Instant::now(),
                            settled_at: None,
                            generation,
                        },
                    );
                    self.spawn_cleanup(key.clone(), generation, future.clone());
                    future
                }
            }
        };

        shared.await
    }

    /// Wrap `fut` so that whoever polls it to completion records the settlement
    /// time on its own generation's entry.
    fn stamped<Fut>(&self, key: RequestKey, generation: u64, fut: Fut) -> impl Future<Output = V> + Send + 'static
    where
        Fut: Future<Output = V> + Send + 'static,
    {
        let entries = Arc::clone(&self.entries);
        async move {
            let value = fut.await;
            if let Some(entry) = lock_map(&entries)
                .get_mut(&key)
                .filter(|e| e.generation == generation)
            {
                entry.settled_at = Some(Instant::now());
            }
            value
        }
    }

    fn spawn_cleanup(&self, key: RequestKey, generation: u64, future: Shared<BoxFuture<'static, V>>) {
        let guard = RemoveOnDrop {
            entries: Arc::clone(&self.entries),
            key,
            generation,
        };
        let grace = self.grace;
        tokio::spawn(async move {
            let _ = future.await;
            let settled_at = lock_map(&guard.entries)
                .get(&guard.key)
                .filter(|e| e.generation == guard.generation)
                .and_then(|e| e.settled_at);
            if let Some(at) = settled_at {
                tokio::time::sleep_until(at + grace).await;
            }
            drop(guard);
        });
    }

    pub fn in_flight_len(&self) -> usize {
        lock_map(&self.entries).len()
    }

    /// Forget every entry. Running calls continue; new callers start fresh ones.
    pub fn clear(&self) {
        lock_map(&self.entries).clear();
    }

    pub fn stats(&self) -> CoalescerStats {
        CoalescerStats {
            total: self.total.load(Ordering::Relaxed),
            coalesced: self.coalesced.load(Ordering::Relaxed),
            started: self.started.load(Ordering::Relaxed),
            in_flight: self.in_flight_len(),
        }
    }
}

impl<V> Default for InFlightCoalescer<V>
where
    V: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::from_config(&CoalesceConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    fn key(s: &str) -> RequestKey {
        RequestKey::new(s)
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_calls_invoke_factory_once() {
        let coalescer: Arc<InFlightCoalescer<u32>> = Arc::new(InFlightCoalescer::new(Duration::from_millis(100)));
        let calls = Arc::new(AtomicU32::new(0));

        let mut handles = Vec::new();
        for _ in 0..10 {
            let coalescer = coalescer.clone();
            let calls = calls.clone();
            handles.push(tokio::spawn(async move {
                coalescer
                    .deduplicate(
                        &key("rk:a"),
                        move || async move {
                            calls.fetch_add(1, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(50)).await;
                            42
                        },
                        Duration::from_secs(30),
                    )
                    .await
            }));
        }

        for h in handles {
            assert_eq!(h.await.unwrap(), 42);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let stats = coalescer.stats();
        assert_eq!(stats.started, 1);
        assert_eq!(stats.coalesced, 9);
    }

    #[tokio::test(start_paused = true)]
    async fn test_errors_are_shared_and_entry_is_cleaned_up() {
        let coalescer: InFlightCoalescer<std::result::Result<u32, String>> =
            InFlightCoalescer::new(Duration::from_millis(100));
        let ttl = Duration::from_secs(30);

        let k = key("rk:a");
        let (a, b) = tokio::join!(
            coalescer.deduplicate(
                &k,
                || async {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    Err::<u32, _>("upstream down".to_string())
                },
                ttl
            ),
            coalescer.deduplicate(&k, || async { Ok(1) }, ttl),
        );
        assert_eq!(a, Err("upstream down".to_string()));
        assert_eq!(b, a);

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(coalescer.in_flight_len(), 0);

        let retried = coalescer.deduplicate(&key("rk:a"), || async { Ok(7) }, ttl).await;
        assert_eq!(retried, Ok(7));
    }

    #[tokio::test(start_paused = true)]
    async fn test_callers_within_grace_share_settled_result() {
        let coalescer: InFlightCoalescer<u32> = InFlightCoalescer::new(Duration::from_millis(100));
        let ttl = Duration::from_secs(30);
        assert_eq!(coalescer.deduplicate(&key("rk:a"), || async { 1 }, ttl).await, 1);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(coalescer.deduplicate(&key("rk:a"), || async { 2 }, ttl).await, 1);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(coalescer.deduplicate(&key("rk:a"), || async { 3 }, ttl).await, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_grace_runs_from_settlement_not_from_cleanup() {
        let coalescer: InFlightCoalescer<u32> = InFlightCoalescer::new(Duration::from_millis(100));
        let ttl = Duration::from_secs(30);
        assert_eq!(coalescer.deduplicate(&key("rk:a"), || async { 1 }, ttl).await, 1);

        // Jump the clock before the cleanup task gets a chance to run.
        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(coalescer.deduplicate(&key("rk:a"), || async { 2 }, ttl).await, 2);
        assert_eq!(coalescer.stats().started, 2);
        assert_eq!(coalescer.stats().coalesced, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_settled_entry_is_removed_after_grace() {
        let coalescer: InFlightCoalescer<u32> = InFlightCoalescer::new(Duration::from_millis(100));
        coalescer
            .deduplicate(&key("rk:a"), || async { 1 }, Duration::from_secs(30))
            .await;
        assert_eq!(coalescer.in_flight_len(), 1);
        tokio::time::sleep(Duration::from_millis(101)).await;
        assert_eq!(coalescer.in_flight_len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_entry_older_than_ttl_is_replaced() {
        let coalescer: InFlightCoalescer<u32> = InFlightCoalescer::new(Duration::from_millis(10));
        let k = key("rk:a");
        let slow = coalescer.deduplicate(
            &k,
            || async {
                tokio::time::sleep(Duration::from_secs(10)).await;
                1
            },
            Duration::from_secs(1),
        );
        let late = async {
            tokio::time::sleep(Duration::from_secs(2)).await;
            coalescer
                .deduplicate(&key("rk:a"), || async { 2 }, Duration::from_secs(1))
                .await
        };
        let (first, second) = tokio::join!(slow, late);
        assert_eq!(first, 1);
        assert_eq!(second, 2);
        assert_eq!(coalescer.stats().started, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_caller_does_not_cancel_shared_call() {
        let coalescer: InFlightCoalescer<u32> = InFlightCoalescer::new(Duration::from_millis(100));
        let finished = Arc::new(AtomicU32::new(0));
        let flag = finished.clone();

        let abandoned = tokio::time::timeout(
            Duration::from_millis(10),
            coalescer.deduplicate(
                &key("rk:a"),
                move || async move {
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    flag.fetch_add(1, Ordering::SeqCst);
                    5
                },
                Duration::from_secs(30),
            ),
        )
        .await;
        assert!(abandoned.is_err());

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(finished.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_degenerate_keys_are_never_coalesced() {
        let coalescer: InFlightCoalescer<u32> = InFlightCoalescer::default();
        let degenerate = crate::cache::KeyGenerator::new().generate("", "", "", "");
        let calls = AtomicU32::new(0);
        for _ in 0..3 {
            coalescer
                .deduplicate(
                    &degenerate,
                    || {
                        calls.fetch_add(1, Ordering::SeqCst);
                        async { 0 }
                    },
                    Duration::from_secs(30),
                )
                .await;
        }
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(coalescer.in_flight_len(), 0);
    }
}
