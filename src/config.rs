//! 配置模块：YAML 加载、环境变量覆盖与校验。
//!
//! # Configuration
//!
//! [`GuardConfig`] bundles the settings of every service the orchestrator owns.
//! Each section deserializes with defaults, so a YAML file only needs the keys it
//! changes:
//!
//! ```yaml
//! rate_limit:
//!   max_requests: 5
//!   window_ms: 60000
//! quota:
//!   daily_budget: 10000
//!   anchor:
//!     kind: utc_offset
//!     offset_secs: -28800
//! ```
//!
//! Environment overrides (applied by [`GuardConfig::apply_env_overrides`]):
//! - `SEARCH_GUARD_DAILY_QUOTA`
//! - `SEARCH_GUARD_RATE_LIMIT_MAX`, `SEARCH_GUARD_RATE_LIMIT_WINDOW_MS`
//! - `SEARCH_GUARD_MAX_RETRIES`, `SEARCH_GUARD_RETRY_BASE_DELAY_MS`
//! - `SEARCH_GUARD_CACHE_SWR` (`1`/`true` or `0`/`false`)
//! - `SEARCH_GUARD_BASE_URL`, `SEARCH_GUARD_API_KEY`, `SEARCH_GUARD_HTTP_TIMEOUT_SECS`

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::warn;

use crate::cache::CacheConfig;
use crate::coalesce::CoalesceConfig;
use crate::provider::ProviderConfig;
use crate::quota::QuotaConfig;
use crate::resilience::rate_limiter::RateLimiterConfig;
use crate::resilience::retry::{RetryConfig, RetryPolicy};
use crate::{Error, ErrorContext, Result};

/// `Duration` as integer milliseconds.
pub(crate) mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GuardConfig {
    pub cache: CacheConfig,
    pub rate_limit: RateLimiterConfig,
    pub quota: QuotaConfig,
    pub retry: RetryConfig,
    pub coalesce: CoalesceConfig,
    pub provider: ProviderConfig,
}

impl GuardConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            Error::configuration_with_context(
                format!("failed to read config file: {}", e),
                ErrorContext::new()
                    .with_details(path.display().to_string())
                    .with_source("config_loader"),
            )
        })?;
        Self::from_yaml_str(&text)
    }

    /// Apply `SEARCH_GUARD_*` environment variables on top of the current values.
    pub fn apply_env_overrides(self) -> Self {
        self.apply_overrides_from(|name| std::env::var(name).ok())
    }

    /// Same as [`apply_env_overrides`](Self::apply_env_overrides) with a custom
    /// variable source. Unparseable values are logged and ignored.
    pub fn apply_overrides_from<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = parse_var::<u64, _>(&lookup, "SEARCH_GUARD_DAILY_QUOTA") {
            self.quota.daily_budget = v;
        }
        if let Some(v) = parse_var::<u32, _>(&lookup, "SEARCH_GUARD_RATE_LIMIT_MAX") {
            self.rate_limit.max_requests = v;
        }
        if let Some(v) = parse_var::<u64, _>(&lookup, "SEARCH_GUARD_RATE_LIMIT_WINDOW_MS") {
            self.rate_limit.window = Duration::from_millis(v);
        }
        if let Some(v) = parse_var::<u32, _>(&lookup, "SEARCH_GUARD_MAX_RETRIES") {
            self.retry.max_retries = v;
        }
        if let Some(v) = parse_var::<u64, _>(&lookup, "SEARCH_GUARD_RETRY_BASE_DELAY_MS") {
            self.retry.base_delay = Duration::from_millis(v);
        }
        if let Some(raw) = lookup("SEARCH_GUARD_CACHE_SWR") {
            match raw.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => self.cache.stale_while_revalidate = true,
                "0" | "false" | "no" | "off" => self.cache.stale_while_revalidate = false,
                other => warn!(var = "SEARCH_GUARD_CACHE_SWR", value = other, "ignoring unparseable override"),
            }
        }
        if let Some(url) = lookup("SEARCH_GUARD_BASE_URL").filter(|s| !s.trim().is_empty()) {
            self.provider.base_url = url.trim().to_string();
        }
        if let Some(key) = lookup("SEARCH_GUARD_API_KEY").filter(|s| !s.trim().is_empty()) {
            self.provider.api_key = Some(key.trim().to_string());
        }
        if let Some(v) = parse_var::<u64, _>(&lookup, "SEARCH_GUARD_HTTP_TIMEOUT_SECS") {
            self.provider.timeout = Duration::from_secs(v);
        }
        self
    }

    pub fn validate(&self) -> Result<()> {
        crate::cache::validate(&self.cache)?;
        self.rate_limit.validate()?;
        self.quota.validate()?;
        self.coalesce.validate()?;
        self.provider.validate()?;

        let slowest_fetch = RetryPolicy::new(self.retry.clone()).worst_case_elapsed(self.provider.timeout);
        if self.coalesce.ttl < slowest_fetch {
            return Err(Error::configuration_with_context(
                format!(
                    "coalescing ttl {}ms is shorter than the slowest retried fetch ({}ms)",
                    self.coalesce.ttl.as_millis(),
                    slowest_fetch.as_millis()
                ),
                ErrorContext::new()
                    .with_field_path("coalesce.ttl_ms")
                    .with_details("raise coalesce.ttl_ms or lower provider.timeout_ms / retry.max_retries")
                    .with_source("config_loader"),
            ));
        }
        Ok(())
    }

    pub fn with_cache(mut self, cache: CacheConfig) -> Self {
        self.cache = cache;
        self
    }
    pub fn with_rate_limit(mut self, rate_limit: RateLimiterConfig) -> Self {
        self.rate_limit = rate_limit;
        self
    }
    pub fn with_quota(mut self, quota: QuotaConfig) -> Self {
        self.quota = quota;
        self
    }
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }
    pub fn with_coalesce(mut self, coalesce: CoalesceConfig) -> Self {
        self.coalesce = coalesce;
        self
    }
    pub fn with_provider(mut self, provider: ProviderConfig) -> Self {
        self.provider = provider;
        self
    }
}

fn parse_var<T, F>(lookup: &F, name: &str) -> Option<T>
where
    T: std::str::FromStr,
    F: Fn(&str) -> Option<String>,
{
    let raw = lookup(name)?;
    match raw.trim().parse::<T>() {
        Ok(v) => Some(v),
        Err(_) => {
            warn!(var = name, value = %raw, "ignoring unparseable override");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quota::PeriodAnchor;
    use std::collections::HashMap;

    #[test]
    fn test_defaults_validate() {
        let config = GuardConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.quota.daily_budget, 10_000);
        assert_eq!(config.retry.max_retries, 3);
        assert!(config.cache.stale_while_revalidate);
    }

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let yaml = r#"
rate_limit:
  max_requests: 5
  window_ms: 60000
quota:
  daily_budget: 500
  anchor:
    kind: utc_offset
    offset_secs: -28800
  operation_costs:
    SEARCH: 100
    VIDEOS: 1
cache:
  stale_while_revalidate: false
"#;
        let config = GuardConfig::from_yaml_str(yaml).unwrap();
        assert_eq!(config.rate_limit.max_requests, 5);
        assert_eq!(config.rate_limit.window, Duration::from_secs(60));
        assert_eq!(config.quota.daily_budget, 500);
        assert_eq!(config.quota.anchor, PeriodAnchor::UtcOffset { offset_secs: -28_800 });
        assert_eq!(config.quota.cost_of("videos"), 1);
        assert!(!config.cache.stale_while_revalidate);
        assert_eq!(config.retry.base_delay, Duration::from_millis(1000));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_yaml_is_an_error() {
        let err = GuardConfig::from_yaml_str("rate_limit: [1, 2").unwrap_err();
        assert!(matches!(err, Error::Yaml(_)));
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = [
            ("SEARCH_GUARD_DAILY_QUOTA", "2000"),
            ("SEARCH_GUARD_RATE_LIMIT_MAX", "7"),
            ("SEARCH_GUARD_RATE_LIMIT_WINDOW_MS", "1000"),
            ("SEARCH_GUARD_MAX_RETRIES", "   1 "),
            ("SEARCH_GUARD_CACHE_SWR", "off"),
            ("SEARCH_GUARD_API_KEY", "secret"),
            ("SEARCH_GUARD_HTTP_TIMEOUT_SECS", "not-a-number"),
        ]
        .into_iter()
        .collect();

        let config = GuardConfig::default()
            .apply_overrides_from(|name| vars.get(name).map(|v| v.to_string()));
        assert_eq!(config.quota.daily_budget, 2000);
        assert_eq!(config.rate_limit.max_requests, 7);
        assert_eq!(config.rate_limit.window, Duration::from_millis(1000));
        assert_eq!(config.retry.max_retries, 1);
        assert!(!config.cache.stale_while_revalidate);
        assert_eq!(config.provider.api_key.as_deref(), Some("secret"));
        assert_eq!(config.provider.timeout, ProviderConfig::default().timeout);
    }

    #[test]
    fn test_validate_rejects_zero_limits() {
        let config = GuardConfig::default()
            .with_rate_limit(RateLimiterConfig::new().with_window(Duration::ZERO));
        let err = config.validate().unwrap_err();
        assert_eq!(
            err.context().and_then(|c| c.field_path.as_deref()),
            Some("rate_limit.window_ms")
        );

        let config = GuardConfig::default().with_quota(QuotaConfig::new().with_daily_budget(0));
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_coalesce_ttl_must_outlast_slowest_fetch() {
        // Defaults: 4 attempts of 30s plus 1s + 2s + 4s of backoff.
        let slowest = RetryPolicy::new(RetryConfig::default()).worst_case_elapsed(Duration::from_secs(30));
        assert_eq!(slowest, Duration::from_secs(127));
        assert!(GuardConfig::default().coalesce.ttl >= slowest);

        let config = GuardConfig::default().with_coalesce(CoalesceConfig::new().with_ttl(Duration::from_secs(30)));
        let err = config.validate().unwrap_err();
        assert_eq!(
            err.context().and_then(|c| c.field_path.as_deref()),
            Some("coalesce.ttl_ms")
        );

        let config = config.with_provider(ProviderConfig::new().with_timeout(Duration::from_secs(5)));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_missing_path() {
        let err = GuardConfig::from_path("/definitely/not/here.yaml").unwrap_err();
        assert!(matches!(err, Error::Configuration { .. }));
    }
}
