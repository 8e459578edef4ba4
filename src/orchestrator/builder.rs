use std::sync::Arc;

use super::pipeline::Inner;
use super::Orchestrator;
use crate::cache::{CacheBackend, KeyGenerator, ResponseCache};
use crate::coalesce::InFlightCoalescer;
use crate::config::GuardConfig;
use crate::provider::{HttpSearchProvider, SearchProvider};
use crate::quota::QuotaManager;
use crate::resilience::rate_limiter::RateLimiter;
use crate::resilience::retry::RetryPolicy;
use crate::Result;

/// Builder for [`Orchestrator`].
///
/// Services not supplied explicitly are built from the [`GuardConfig`]. Without a
/// provider, an [`HttpSearchProvider`] is built from `config.provider`.
pub struct OrchestratorBuilder {
    config: GuardConfig,
    provider: Option<Arc<dyn SearchProvider>>,
    cache: Option<Arc<ResponseCache>>,
    cache_backend: Option<Box<dyn CacheBackend>>,
    rate_limiter: Option<Arc<RateLimiter>>,
    quota: Option<Arc<QuotaManager>>,
    key_generator: KeyGenerator,
}

impl OrchestratorBuilder {
    pub fn new() -> Self {
        Self {
            config: GuardConfig::default(),
            provider: None,
            cache: None,
            cache_backend: None,
            rate_limiter: None,
            quota: None,
            key_generator: KeyGenerator::new(),
        }
    }

    pub fn config(mut self, config: GuardConfig) -> Self {
        self.config = config;
        self
    }

    pub fn provider(mut self, provider: Arc<dyn SearchProvider>) -> Self {
        self.provider = Some(provider);
        self
    }

    /// Share an existing cache, e.g. between orchestrators for different features.
    pub fn cache(mut self, cache: Arc<ResponseCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Storage for a cache built from `config.cache`. Ignored when [`cache`](Self::cache) is set.
    pub fn cache_backend(mut self, backend: Box<dyn CacheBackend>) -> Self {
        self.cache_backend = Some(backend);
        self
    }

    pub fn rate_limiter(mut self, limiter: Arc<RateLimiter>) -> Self {
        self.rate_limiter = Some(limiter);
        self
    }

    pub fn quota(mut self, quota: Arc<QuotaManager>) -> Self {
        self.quota = Some(quota);
        self
    }

    pub fn key_generator(mut self, keys: KeyGenerator) -> Self {
        self.key_generator = keys;
        self
    }

    /// Validate the config and assemble the services. Sweeps start here, so call
    /// this inside a tokio runtime.
    pub fn build(self) -> Result<Orchestrator> {
        self.config.validate()?;
        let config = self.config;

        let provider = match self.provider {
            Some(p) => p,
            None => Arc::new(HttpSearchProvider::new(&config.provider)?),
        };
        let cache = match (self.cache, self.cache_backend) {
            (Some(cache), _) => cache,
            (None, Some(backend)) => ResponseCache::new(config.cache.clone(), backend),
            (None, None) => ResponseCache::in_memory(config.cache.clone()),
        };
        let limiter = self
            .rate_limiter
            .unwrap_or_else(|| RateLimiter::new(config.rate_limit.clone()));
        let quota = self
            .quota
            .unwrap_or_else(|| QuotaManager::new(config.quota.clone()));

        let inner = Inner::new(
            provider,
            self.key_generator,
            InFlightCoalescer::from_config(&config.coalesce),
            config.coalesce.ttl,
            limiter,
            cache,
            quota,
            RetryPolicy::new(config.retry.clone()),
        );
        Ok(Orchestrator {
            inner: Arc::new(inner),
        })
    }
}

impl Default for OrchestratorBuilder {
    fn default() -> Self {
        Self::new()
    }
}
