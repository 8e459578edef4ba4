use async_trait::async_trait;
use reqwest::header::RETRY_AFTER;
use reqwest::{Method, Response, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

use super::{SearchPage, SearchProvider, SearchQuery};
use crate::config::duration_ms;
use crate::error::{UpstreamError, UpstreamErrorKind};
use crate::{Error, ErrorContext, Result};

/// Error reasons that mean the provider's own budget is spent. Never retried.
const QUOTA_REASONS: &[&str] = &["quotaExceeded", "dailyLimitExceeded"];
/// Error reasons the provider uses for short-term throttling.
const THROTTLE_REASONS: &[&str] = &["rateLimitExceeded", "userRateLimitExceeded"];

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    pub base_url: String,
    /// Sent as the `key` query parameter. Falls back to `SEARCH_GUARD_API_KEY`.
    #[serde(skip_serializing)]
    pub api_key: Option<String>,
    #[serde(with = "duration_ms", rename = "timeout_ms")]
    pub timeout: Duration,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            base_url: "https://www.googleapis.com/youtube/v3".to_string(),
            api_key: None,
            timeout: Duration::from_secs(30),
        }
    }
}

impl ProviderConfig {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }
    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if let Err(e) = Url::parse(&self.base_url) {
            return Err(Error::configuration_with_context(
                format!("invalid provider base_url: {}", e),
                ErrorContext::new()
                    .with_field_path("provider.base_url")
                    .with_details(self.base_url.clone())
                    .with_source("config_loader"),
            ));
        }
        if self.timeout.is_zero() {
            return Err(Error::configuration_with_context(
                "provider timeout must be positive",
                ErrorContext::new()
                    .with_field_path("provider.timeout_ms")
                    .with_source("config_loader"),
            ));
        }
        Ok(())
    }
}

/// [`SearchProvider`] over the provider's REST API.
///
/// Calls `{base_url}/{resource}?{params}&key={api_key}`. Scalar params are sent
/// as-is, arrays comma-joined (the provider's `part=id,snippet` convention),
/// nulls dropped.
pub struct HttpSearchProvider {
    client: reqwest::Client,
    base_url: Url,
    api_key: Option<String>,
}

impl HttpSearchProvider {
    pub fn new(config: &ProviderConfig) -> Result<Self> {
        config.validate()?;
        let base_url = Url::parse(&config.base_url).map_err(|e| {
            Error::configuration_with_context(
                format!("invalid provider base_url: {}", e),
                ErrorContext::new().with_field_path("provider.base_url"),
            )
        })?;
        let api_key = config
            .api_key
            .clone()
            .or_else(|| std::env::var("SEARCH_GUARD_API_KEY").ok())
            .filter(|k| !k.trim().is_empty());

        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .pool_max_idle_per_host(8)
            .build()
            .map_err(|e| {
                Error::configuration_with_context(
                    format!("failed to build HTTP client: {}", e),
                    ErrorContext::new().with_source("http_provider"),
                )
            })?;

        Ok(Self {
            client,
            base_url,
            api_key,
        })
    }

    fn endpoint(&self, query: &SearchQuery) -> std::result::Result<Url, UpstreamError> {
        let mut url = self.base_url.clone();
        {
            let mut segments = url.path_segments_mut().map_err(|_| {
                UpstreamError::new(UpstreamErrorKind::BadRequest, "provider base_url cannot carry a path")
            })?;
            segments.pop_if_empty();
            for part in query.resource.split('/').filter(|s| !s.is_empty()) {
                segments.push(part);
            }
        }
        {
            let mut pairs = url.query_pairs_mut();
            for (name, value) in &query.params {
                if let Some(rendered) = render_param(value) {
                    pairs.append_pair(name, &rendered);
                }
            }
            if let Some(key) = &self.api_key {
                pairs.append_pair("key", key);
            }
        }
        if url.query() == Some("") {
            url.set_query(None);
        }
        Ok(url)
    }

    async fn into_failure(response: Response) -> UpstreamError {
        let status = response.status();
        let retry_after = response
            .headers()
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map(Duration::from_secs);
        let body = response.text().await.unwrap_or_default();
        let mut err = classify_failure(status, &body);
        if let Some(delay) = retry_after {
            err = err.with_retry_after(delay);
        }
        err
    }
}

#[async_trait]
impl SearchProvider for HttpSearchProvider {
    async fn query(&self, query: &SearchQuery) -> std::result::Result<SearchPage, UpstreamError> {
        let url = self.endpoint(query)?;
        let method = Method::from_bytes(query.method.trim().to_ascii_uppercase().as_bytes())
            .unwrap_or(Method::GET);
        debug!(method = %method, resource = %query.resource, "calling search provider");

        let response = self
            .client
            .request(method, url)
            .header("accept", "application/json")
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    UpstreamError::timeout(e.to_string())
                } else {
                    UpstreamError::network(e.to_string())
                }
            })?;

        if !response.status().is_success() {
            let err = Self::into_failure(response).await;
            warn!(error = %err, "search provider returned an error");
            return Err(err);
        }

        let status = response.status().as_u16();
        let bytes = response.bytes().await.map_err(|e| {
            if e.is_timeout() {
                UpstreamError::timeout(e.to_string())
            } else {
                UpstreamError::network(e.to_string())
            }
        })?;
        serde_json::from_slice::<SearchPage>(&bytes).map_err(|e| {
            UpstreamError::new(
                UpstreamErrorKind::MalformedResponse,
                format!("failed to decode provider response: {}", e),
            )
            .with_status(status)
        })
    }

    fn name(&self) -> &str {
        "http"
    }
}

fn render_param(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        Value::Array(items) => Some(
            items
                .iter()
                .filter_map(render_param)
                .collect::<Vec<_>>()
                .join(","),
        ),
        other => Some(other.to_string()),
    }
}

/// Map a non-2xx response to an [`UpstreamError`], using the provider's error
/// reason when the body carries one.
fn classify_failure(status: StatusCode, body: &str) -> UpstreamError {
    let code = status.as_u16();
    let parsed: Option<Value> = serde_json::from_str(body).ok();
    let error = parsed.as_ref().and_then(|v| v.get("error"));

    let message = error
        .and_then(|e| e.get("message"))
        .and_then(|m| m.as_str())
        .map(str::to_string)
        .or_else(|| status.canonical_reason().map(str::to_string))
        .unwrap_or_else(|| format!("HTTP {}", code));

    let reasons: Vec<&str> = error
        .and_then(|e| e.get("errors"))
        .and_then(|e| e.as_array())
        .map(|list| {
            list.iter()
                .filter_map(|e| e.get("reason").and_then(|r| r.as_str()))
                .collect()
        })
        .unwrap_or_default();

    let kind = if reasons.iter().any(|r| QUOTA_REASONS.contains(r)) {
        UpstreamErrorKind::QuotaExceeded
    } else if reasons.iter().any(|r| THROTTLE_REASONS.contains(r)) {
        UpstreamErrorKind::Throttled
    } else {
        UpstreamErrorKind::from_status(code)
    };

    UpstreamError::new(kind, message).with_status(code)
}
