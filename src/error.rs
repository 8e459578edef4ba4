use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Structured error context for configuration and validation failures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorContext {
    /// Field path or configuration key that caused the error (e.g., "rate_limit.window_ms")
    pub field_path: Option<String>,
    /// Additional context about the error (e.g., expected range, actual value)
    pub details: Option<String>,
    /// Source of the error (e.g., "config_loader", "response_cache")
    pub source: Option<String>,
}

impl ErrorContext {
    pub fn new() -> Self {
        Self {
            field_path: None,
            details: None,
            source: None,
        }
    }

    pub fn with_field_path(mut self, path: impl Into<String>) -> Self {
        self.field_path = Some(path.into());
        self
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }
}

impl Default for ErrorContext {
    fn default() -> Self {
        Self::new()
    }
}

/// Unified error type for the crate.
///
/// Orchestrated requests never surface this type; the orchestrator folds every
/// failure into an [`ApiResponse`](crate::orchestrator::ApiResponse). It shows up
/// on the lower-level building blocks (cache, config loading, providers).
#[derive(Debug, Error)]
pub enum Error {
    #[error("Configuration error: {message}{}", format_context(.context))]
    Configuration {
        message: String,
        context: ErrorContext,
    },

    #[error("Cache error: {message}{}", format_context(.context))]
    Cache {
        message: String,
        context: ErrorContext,
    },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

fn format_context(ctx: &ErrorContext) -> String {
    let mut parts = Vec::new();
    if let Some(ref field) = ctx.field_path {
        parts.push(format!("field: {}", field));
    }
    if let Some(ref details) = ctx.details {
        parts.push(format!("details: {}", details));
    }
    if let Some(ref source) = ctx.source {
        parts.push(format!("source: {}", source));
    }
    if parts.is_empty() {
        String::new()
    } else {
        format!(" ({})", parts.join(", "))
    }
}

impl Error {
    /// Create a new configuration error with structured context
    pub fn configuration_with_context(msg: impl Into<String>, context: ErrorContext) -> Self {
        Error::Configuration {
            message: msg.into(),
            context,
        }
    }

    /// Create a new cache error with structured context
    pub fn cache_with_context(msg: impl Into<String>, context: ErrorContext) -> Self {
        Error::Cache {
            message: msg.into(),
            context,
        }
    }

    /// Extract error context if available
    pub fn context(&self) -> Option<&ErrorContext> {
        match self {
            Error::Configuration { context, .. } | Error::Cache { context, .. } => Some(context),
            _ => None,
        }
    }
}

/// Whether a failed upstream attempt is worth repeating.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureClass {
    /// Network, timeout, 5xx-equivalent. Retried with backoff.
    Retryable,
    /// Malformed input, auth, 4xx-equivalent. Surfaced immediately.
    Terminal,
}

impl FailureClass {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Retryable)
    }
}

/// What went wrong talking to the search provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UpstreamErrorKind {
    /// Connection refused, reset, DNS failure
    Network,
    /// Request timed out before a response arrived
    Timeout,
    /// HTTP 5xx
    Server,
    /// HTTP 429 from the provider itself
    Throttled,
    /// HTTP 400 / 404 / 422 and friends
    BadRequest,
    /// HTTP 401, or 403 without a quota reason
    Unauthorized,
    /// Provider reported its own quota as exceeded (403 quotaExceeded)
    QuotaExceeded,
    /// Response body could not be decoded
    MalformedResponse,
}

impl UpstreamErrorKind {
    /// Map an HTTP status to an error kind. Only meaningful for non-2xx statuses.
    pub fn from_status(status: u16) -> Self {
        match status {
            401 | 403 => Self::Unauthorized,
            408 => Self::Timeout,
            429 => Self::Throttled,
            500..=599 => Self::Server,
            _ => Self::BadRequest,
        }
    }

    pub fn class(&self) -> FailureClass {
        match self {
            Self::Network | Self::Timeout | Self::Server | Self::Throttled => {
                FailureClass::Retryable
            }
            Self::BadRequest
            | Self::Unauthorized
            | Self::QuotaExceeded
            | Self::MalformedResponse => FailureClass::Terminal,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Network => "network",
            Self::Timeout => "timeout",
            Self::Server => "server_error",
            Self::Throttled => "throttled",
            Self::BadRequest => "bad_request",
            Self::Unauthorized => "unauthorized",
            Self::QuotaExceeded => "quota_exceeded",
            Self::MalformedResponse => "malformed_response",
        }
    }
}

impl fmt::Display for UpstreamErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Failure reported by a [`SearchProvider`](crate::provider::SearchProvider).
///
/// Classification is carried as data (`kind`), so retry and fallback decisions
/// never depend on message text.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind}{}: {message}", format_status(.status))]
pub struct UpstreamError {
    pub kind: UpstreamErrorKind,
    pub status: Option<u16>,
    pub message: String,
    /// Provider-supplied `Retry-After` hint, if any.
    pub retry_after: Option<Duration>,
}

fn format_status(status: &Option<u16>) -> String {
    match status {
        Some(s) => format!(" (HTTP {})", s),
        None => String::new(),
    }
}

impl UpstreamError {
    pub fn new(kind: UpstreamErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            status: None,
            message: message.into(),
            retry_after: None,
        }
    }

    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        Self {
            kind: UpstreamErrorKind::from_status(status),
            status: Some(status),
            message: message.into(),
            retry_after: None,
        }
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(UpstreamErrorKind::Network, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(UpstreamErrorKind::Timeout, message)
    }

    pub fn server(status: u16, message: impl Into<String>) -> Self {
        Self::new(UpstreamErrorKind::Server, message).with_status(status)
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(UpstreamErrorKind::BadRequest, message).with_status(400)
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_retry_after(mut self, retry_after: Duration) -> Self {
        self.retry_after = Some(retry_after);
        self
    }

    pub fn class(&self) -> FailureClass {
        self.kind.class()
    }

    pub fn is_retryable(&self) -> bool {
        self.class().is_retryable()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        assert_eq!(UpstreamErrorKind::from_status(500).class(), FailureClass::Retryable);
        assert_eq!(UpstreamErrorKind::from_status(503).class(), FailureClass::Retryable);
        assert_eq!(UpstreamErrorKind::from_status(429).class(), FailureClass::Retryable);
        assert_eq!(UpstreamErrorKind::from_status(408).class(), FailureClass::Retryable);
        assert_eq!(UpstreamErrorKind::from_status(400).class(), FailureClass::Terminal);
        assert_eq!(UpstreamErrorKind::from_status(401).class(), FailureClass::Terminal);
        assert_eq!(UpstreamErrorKind::from_status(404).class(), FailureClass::Terminal);
    }

    #[test]
    fn test_quota_and_decode_failures_are_terminal() {
        assert!(!UpstreamError::new(UpstreamErrorKind::QuotaExceeded, "daily limit").is_retryable());
        assert!(!UpstreamError::new(UpstreamErrorKind::MalformedResponse, "eof").is_retryable());
        assert!(UpstreamError::network("connection reset").is_retryable());
    }

    #[test]
    fn test_upstream_error_display() {
        let err = UpstreamError::server(502, "bad gateway");
        assert_eq!(err.to_string(), "server_error (HTTP 502): bad gateway");
        let err = UpstreamError::timeout("deadline elapsed");
        assert_eq!(err.to_string(), "timeout: deadline elapsed");
    }

    #[test]
    fn test_error_context_formatting() {
        let err = Error::configuration_with_context(
            "window must be positive",
            ErrorContext::new()
                .with_field_path("rate_limit.window_ms")
                .with_source("config_loader"),
        );
        assert_eq!(
            err.to_string(),
            "Configuration error: window must be positive (field: rate_limit.window_ms, source: config_loader)"
        );
        assert!(err.context().is_some());
    }
}
