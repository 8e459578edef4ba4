use reqwest::header::{HeaderMap, HeaderValue, RETRY_AFTER};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::cache::{CacheLookup, Freshness};
use crate::error::UpstreamErrorKind;
use crate::provider::SearchPage;
use crate::quota::QuotaStatus;
use crate::resilience::retry::RetryError;

pub const RATE_LIMIT_ERROR: &str = "Rate limit exceeded";
pub const QUOTA_EXHAUSTED_ERROR: &str = "Quota exhausted";
pub const UPSTREAM_ERROR: &str = "Upstream request failed";
pub const SHUTTING_DOWN_ERROR: &str = "Service shutting down";

/// Result of one orchestrated request, as handed to the UI layer.
///
/// Every exit of [`Orchestrator::execute`](super::Orchestrator::execute) is one
/// of these. `data` is `null` exactly when `error` is set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiResponse {
    pub data: Option<Vec<Value>>,
    pub from_cache: bool,
    /// Whether producing this response spent upstream quota.
    pub quota_used: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_page_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub status: u16,
    /// Seconds the caller should wait before retrying.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<u64>,
    /// Data may be outdated: revalidation is pending or failed.
    #[serde(default)]
    pub stale: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub freshness: Option<Freshness>,
    /// Quota period reset, milliseconds since the Unix epoch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reset_at: Option<u64>,
}

/// Body of a 429 response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitPayload {
    pub error: String,
    pub message: String,
    pub retry_after: u64,
    pub status: u16,
}

impl ApiResponse {
    fn data(page: SearchPage) -> Self {
        Self {
            data: Some(page.items),
            from_cache: false,
            quota_used: false,
            next_page_token: page.next_page_token,
            error: None,
            message: None,
            status: 200,
            retry_after: None,
            stale: false,
            freshness: None,
            reset_at: None,
        }
    }

    fn failure(status: u16, error: &str, message: String) -> Self {
        Self {
            data: None,
            from_cache: false,
            quota_used: false,
            next_page_token: None,
            error: Some(error.to_string()),
            message: Some(message),
            status,
            retry_after: None,
            stale: false,
            freshness: None,
            reset_at: None,
        }
    }

    /// Freshly fetched from the provider.
    pub fn fetched(page: SearchPage) -> Self {
        Self {
            quota_used: true,
            freshness: Some(Freshness::Fresh),
            ..Self::data(page)
        }
    }

    /// Served from the cache, fresh or under stale-while-revalidate.
    pub fn cached(lookup: CacheLookup<SearchPage>) -> Self {
        Self {
            from_cache: true,
            stale: lookup.is_stale(),
            freshness: Some(lookup.freshness),
            ..Self::data(lookup.value)
        }
    }

    /// Last known-good data served because the upstream call failed.
    pub fn stale_fallback(lookup: CacheLookup<SearchPage>) -> Self {
        Self {
            from_cache: true,
            stale: true,
            freshness: Some(Freshness::Unconfirmed),
            ..Self::data(lookup.value)
        }
    }

    pub fn quota_exhausted(status: &QuotaStatus) -> Self {
        let wait = status.resets_in();
        let minutes = wait.as_secs().div_ceil(60).max(1);
        Self {
            retry_after: Some(wait.as_secs().max(1)),
            reset_at: Some(status.reset_at_unix_ms()),
            ..Self::failure(
                503,
                QUOTA_EXHAUSTED_ERROR,
                format!(
                    "The search quota for this period is used up. Please try again later (resets in about {} minute{}).",
                    minutes,
                    if minutes == 1 { "" } else { "s" }
                ),
            )
        }
    }

    pub fn rate_limited(retry_after_secs: u64) -> Self {
        Self {
            retry_after: Some(retry_after_secs),
            ..Self::failure(
                429,
                RATE_LIMIT_ERROR,
                format!(
                    "Too many requests. Please wait {} second{} before trying again.",
                    retry_after_secs,
                    if retry_after_secs == 1 { "" } else { "s" }
                ),
            )
        }
    }

    /// The provider call failed and no stale data was available.
    pub fn upstream_failure(err: &RetryError) -> Self {
        let status = match err.last.kind {
            UpstreamErrorKind::QuotaExceeded => 503,
            UpstreamErrorKind::Timeout => 504,
            UpstreamErrorKind::Throttled => 429,
            UpstreamErrorKind::Network | UpstreamErrorKind::MalformedResponse => 502,
            UpstreamErrorKind::Server => err.last.status.unwrap_or(502),
            UpstreamErrorKind::BadRequest => err.last.status.unwrap_or(400),
            UpstreamErrorKind::Unauthorized => err.last.status.unwrap_or(401),
        };
        let message = if err.class.is_retryable() {
            "Search is temporarily unavailable. Please try again later.".to_string()
        } else {
            err.last.message.clone()
        };
        Self {
            retry_after: err.last.retry_after.map(|d| d.as_secs().max(1)),
            ..Self::failure(status, UPSTREAM_ERROR, message)
        }
    }

    /// The orchestrator was shut down before the provider call finished.
    pub fn shutting_down() -> Self {
        Self::failure(
            503,
            SHUTTING_DOWN_ERROR,
            "Search is shutting down. Please try again later.".to_string(),
        )
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }

    pub fn is_rate_limited(&self) -> bool {
        self.status == 429 && self.error.as_deref() == Some(RATE_LIMIT_ERROR)
    }

    pub fn is_quota_exhausted(&self) -> bool {
        self.error.as_deref() == Some(QUOTA_EXHAUSTED_ERROR)
    }

    /// The structured 429 body, for rate-limit rejections only.
    pub fn rate_limit_payload(&self) -> Option<RateLimitPayload> {
        if !self.is_rate_limited() {
            return None;
        }
        Some(RateLimitPayload {
            error: RATE_LIMIT_ERROR.to_string(),
            message: self.message.clone().unwrap_or_default(),
            retry_after: self.retry_after.unwrap_or(1),
            status: 429,
        })
    }

    /// Response headers the UI layer should send. Carries `Retry-After` whenever
    /// a wait hint exists.
    pub fn headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        if let Some(secs) = self.retry_after {
            headers.insert(RETRY_AFTER, HeaderValue::from(secs));
        }
        headers
    }
}
