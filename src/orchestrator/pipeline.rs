use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use super::request::SearchRequest;
use super::response::ApiResponse;
use super::OrchestratorBuilder;
use crate::cache::{CacheStats, KeyGenerator, RequestKey, ResponseCache};
use crate::coalesce::{CoalescerStats, InFlightCoalescer};
use crate::config::GuardConfig;
use crate::provider::{SearchPage, SearchProvider};
use crate::quota::{QuotaManager, QuotaStatus};
use crate::resilience::rate_limiter::{RateLimiter, RateLimiterStats};
use crate::resilience::retry::{RetryError, RetryPolicy};
use crate::Result;

/// Why the shared part of the pipeline produced no page.
#[derive(Debug, Clone, thiserror::Error)]
pub(crate) enum FetchFailure {
    #[error("rate limited, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },
    #[error("{0}")]
    Upstream(RetryError),
    #[error("orchestrator shut down")]
    Cancelled,
}

/// Settlement shared by every caller coalesced onto one fetch.
pub(crate) type FetchOutcome = std::result::Result<SearchPage, FetchFailure>;

/// Per-outcome request counters.
#[derive(Debug, Clone, Default)]
pub struct RequestStats {
    pub requests: u64,
    pub cache_hits: u64,
    /// Stale entries served while a background refresh was scheduled.
    pub stale_served: u64,
    /// Successful provider calls (coalesced callers count once).
    pub fetched: u64,
    pub quota_rejected: u64,
    pub rate_limited: u64,
    /// Upstream failures answered with last known-good data.
    pub stale_fallbacks: u64,
    /// Upstream failures answered with an error.
    pub failures: u64,
    pub background_refreshes: u64,
    pub refresh_failures: u64,
}

/// Point-in-time facts about every service the orchestrator owns.
#[derive(Debug, Clone)]
pub struct OrchestratorStats {
    pub requests: RequestStats,
    pub coalescer: CoalescerStats,
    pub cache: CacheStats,
    pub rate_limiter: RateLimiterStats,
    /// Global quota status.
    pub quota: QuotaStatus,
}

#[derive(Default)]
struct Counters {
    requests: AtomicU64,
    cache_hits: AtomicU64,
    stale_served: AtomicU64,
    fetched: AtomicU64,
    quota_rejected: AtomicU64,
    rate_limited: AtomicU64,
    stale_fallbacks: AtomicU64,
    failures: AtomicU64,
    background_refreshes: AtomicU64,
    refresh_failures: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> RequestStats {
        RequestStats {
            requests: self.requests.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            stale_served: self.stale_served.load(Ordering::Relaxed),
            fetched: self.fetched.load(Ordering::Relaxed),
            quota_rejected: self.quota_rejected.load(Ordering::Relaxed),
            rate_limited: self.rate_limited.load(Ordering::Relaxed),
            stale_fallbacks: self.stale_fallbacks.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            background_refreshes: self.background_refreshes.load(Ordering::Relaxed),
            refresh_failures: self.refresh_failures.load(Ordering::Relaxed),
        }
    }
}

pub(crate) struct Inner {
    pub(crate) provider: Arc<dyn SearchProvider>,
    pub(crate) keys: KeyGenerator,
    pub(crate) coalescer: InFlightCoalescer<FetchOutcome>,
    pub(crate) coalesce_ttl: Duration,
    pub(crate) limiter: Arc<RateLimiter>,
    pub(crate) cache: Arc<ResponseCache>,
    pub(crate) quota: Arc<QuotaManager>,
    pub(crate) retry: RetryPolicy,
    /// Cancelled by `shutdown()`; aborts upstream fetches still in flight.
    pub(crate) shutdown: CancellationToken,
    counters: Counters,
}

impl Inner {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        provider: Arc<dyn SearchProvider>,
        keys: KeyGenerator,
        coalescer: InFlightCoalescer<FetchOutcome>,
        coalesce_ttl: Duration,
        limiter: Arc<RateLimiter>,
        cache: Arc<ResponseCache>,
        quota: Arc<QuotaManager>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            provider,
            keys,
            coalescer,
            coalesce_ttl,
            limiter,
            cache,
            quota,
            retry,
            shutdown: CancellationToken::new(),
            counters: Counters::default(),
        }
    }

    fn key_for(&self, request: &SearchRequest) -> RequestKey {
        self.keys.generate_from_json(
            &request.method,
            &request.resource,
            &Value::Object(request.params.clone()),
            request.effective_identity(),
        )
    }

    async fn run(self: Arc<Self>, request: SearchRequest) -> ApiResponse {
        Counters::bump(&self.counters.requests);
        let identity = request.effective_identity();
        let key = self.key_for(&request);
        let cost = request
            .cost_units
            .unwrap_or_else(|| self.quota.config().cost_of(&request.resource));

        let status = self.quota.get_status(Some(identity));
        if status.units_remaining < cost {
            Counters::bump(&self.counters.quota_rejected);
            info!(cost, remaining = status.units_remaining, "quota exhausted, rejecting request");
            return ApiResponse::quota_exhausted(&status);
        }

        let swr = request.stale_while_revalidate.unwrap_or(true);
        match self.cache.get::<SearchPage>(&key).await {
            Ok(Some(lookup)) if !lookup.is_stale() => {
                Counters::bump(&self.counters.cache_hits);
                debug!(key = %key, "fresh cache hit");
                return ApiResponse::cached(lookup);
            }
            Ok(Some(lookup)) if swr => {
                Counters::bump(&self.counters.stale_served);
                debug!(key = %key, freshness = ?lookup.freshness, "serving stale entry, refreshing in background");
                self.schedule_refresh(key, request, cost);
                return ApiResponse::cached(lookup);
            }
            Ok(_) => {}
            Err(e) => warn!(key = %key, error = %e, "cache read failed, fetching from provider"),
        }

        match self.fetch(&key, &request, cost).await {
            Ok(page) => ApiResponse::fetched(page),
            Err(FetchFailure::RateLimited { retry_after_secs }) => ApiResponse::rate_limited(retry_after_secs),
            Err(FetchFailure::Upstream(err)) => self.fall_back(&key, &err).await,
            Err(FetchFailure::Cancelled) => ApiResponse::shutting_down(),
        }
    }

    /// Everything from the dedup gate onward. Callers with the same key share one run.
    async fn fetch(self: &Arc<Self>, key: &RequestKey, request: &SearchRequest, cost: u64) -> FetchOutcome {
        let inner = Arc::clone(self);
        let owned_key = key.clone();
        let query = request.to_query();
        let identity = request.effective_identity().to_string();
        let ttl = request.cache_ttl;
        self.coalescer
            .deduplicate(
                key,
                move || inner.fetch_upstream(owned_key, query, identity, cost, ttl),
                self.coalesce_ttl,
            )
            .await
    }

    async fn fetch_upstream(
        self: Arc<Self>,
        key: RequestKey,
        query: crate::provider::SearchQuery,
        identity: String,
        cost: u64,
        ttl: Duration,
    ) -> FetchOutcome {
        if self.shutdown.is_cancelled() {
            return Err(FetchFailure::Cancelled);
        }
        let decision = self.limiter.check_and_increment(&identity);
        if !decision.allowed {
            let retry_after_secs = decision.retry_after_secs.unwrap_or(1);
            Counters::bump(&self.counters.rate_limited);
            info!(identity = %identity, retry_after_secs, "request throttled");
            return Err(FetchFailure::RateLimited { retry_after_secs });
        }

        // The shared future outlives its callers, so shutdown has to stop it here.
        let attempt = self.retry.run(|| self.provider.query(&query));
        let page = tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => {
                debug!(key = %key, "upstream fetch abandoned on shutdown");
                return Err(FetchFailure::Cancelled);
            }
            result = attempt => match result {
                Ok(page) => page,
                Err(err) => {
                    warn!(
                        provider = self.provider.name(),
                        error = %err.last,
                        attempts = err.attempts,
                        "upstream fetch failed"
                    );
                    return Err(FetchFailure::Upstream(err));
                }
            },
        };

        if let Err(e) = self.cache.set(&key, &page, ttl).await {
            warn!(key = %key, error = %e, "failed to store fetched page");
        }
        let units = page.cost_units.unwrap_or(cost);
        self.quota.charge(units, Some(&identity));
        Counters::bump(&self.counters.fetched);
        debug!(key = %key, units, items = page.items.len(), "fetched from provider");
        Ok(page)
    }

    async fn fall_back(&self, key: &RequestKey, err: &RetryError) -> ApiResponse {
        match self.cache.get_stale::<SearchPage>(key).await {
            Ok(Some(lookup)) if !lookup.is_stale() => ApiResponse::cached(lookup),
            Ok(Some(lookup)) => {
                self.cache.mark_unconfirmed(key);
                Counters::bump(&self.counters.stale_fallbacks);
                info!(key = %key, error = %err.last, "serving stale data after upstream failure");
                ApiResponse::stale_fallback(lookup)
            }
            Ok(None) => {
                Counters::bump(&self.counters.failures);
                ApiResponse::upstream_failure(err)
            }
            Err(e) => {
                warn!(key = %key, error = %e, "stale lookup failed");
                Counters::bump(&self.counters.failures);
                ApiResponse::upstream_failure(err)
            }
        }
    }

    fn schedule_refresh(self: &Arc<Self>, key: RequestKey, request: SearchRequest, cost: u64) {
        Counters::bump(&self.counters.background_refreshes);
        let inner = Arc::clone(self);
        let token = self.shutdown.clone();
        let task = async move {
            tokio::select! {
                biased;
                _ = token.cancelled() => debug!(key = %key, "background refresh cancelled"),
                outcome = inner.fetch(&key, &request, cost) => match outcome {
                    Ok(_) => {}
                    Err(FetchFailure::Cancelled) => debug!(key = %key, "background refresh cancelled"),
                    Err(failure) => {
                        inner.cache.mark_unconfirmed(&key);
                        Counters::bump(&inner.counters.refresh_failures);
                        warn!(key = %key, reason = %failure, "background refresh failed, keeping stale entry");
                    }
                },
            }
        };
        tokio::spawn(task.in_current_span());
    }
}

/// Single entry point every feature-level search goes through.
///
/// Pipeline per request: quota check, cache check, dedup gate, throttle check,
/// fetch with retry, then cache update and quota charge. Every exit is an
/// [`ApiResponse`]; nothing here returns an error or panics on bad input.
#[derive(Clone)]
pub struct Orchestrator {
    pub(crate) inner: Arc<Inner>,
}

impl Orchestrator {
    pub fn builder() -> OrchestratorBuilder {
        OrchestratorBuilder::new()
    }

    /// Orchestrator over `provider` with services built from `config`.
    pub fn new(config: GuardConfig, provider: Arc<dyn SearchProvider>) -> Result<Self> {
        OrchestratorBuilder::new().config(config).provider(provider).build()
    }

    pub async fn execute(&self, request: SearchRequest) -> ApiResponse {
        let request_id = Uuid::new_v4();
        let span = info_span!(
            "search_request",
            request_id = %request_id,
            identity = %request.effective_identity(),
            resource = %request.resource
        );
        Arc::clone(&self.inner).run(request).instrument(span).await
    }

    /// Key the request would be cached and coalesced under.
    pub fn key_for(&self, request: &SearchRequest) -> RequestKey {
        self.inner.key_for(request)
    }

    pub fn cache(&self) -> &Arc<ResponseCache> {
        &self.inner.cache
    }

    pub fn quota(&self) -> &Arc<QuotaManager> {
        &self.inner.quota
    }

    pub fn rate_limiter(&self) -> &Arc<RateLimiter> {
        &self.inner.limiter
    }

    pub fn stats(&self) -> OrchestratorStats {
        OrchestratorStats {
            requests: self.inner.counters.snapshot(),
            coalescer: self.inner.coalescer.stats(),
            cache: self.inner.cache.stats(),
            rate_limiter: self.inner.limiter.stats(),
            quota: self.inner.quota.get_status(None),
        }
    }

    /// Cancel pending background refreshes and in-flight provider calls, then
    /// stop every owned sweep. Later requests get [`ApiResponse::shutting_down`].
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
        self.inner.cache.shutdown();
        self.inner.limiter.shutdown();
        self.inner.quota.shutdown();
        info!("orchestrator shut down");
    }
}
