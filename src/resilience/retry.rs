//! Retry with exponential backoff for upstream calls.
//!
//! Each attempt's result is turned into an [`Attempt`] before any decision is
//! made, so "retry or stop" is a match on data rather than on error shape.

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::duration_ms;
use crate::error::{FailureClass, UpstreamError};

/// Configuration for retry logic
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Retries after the first attempt.
    pub max_retries: u32,
    #[serde(with = "duration_ms", rename = "base_delay_ms")]
    pub base_delay: Duration,
    #[serde(with = "duration_ms", rename = "max_delay_ms")]
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryConfig {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn with_max_retries(mut self, n: u32) -> Self {
        self.max_retries = n;
        self
    }
    pub fn with_base_delay(mut self, d: Duration) -> Self {
        self.base_delay = d;
        self
    }
    pub fn with_max_delay(mut self, d: Duration) -> Self {
        self.max_delay = d;
        self
    }
}

/// Tagged result of a single attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Attempt<T> {
    Ok(T),
    Retryable(UpstreamError),
    Terminal(UpstreamError),
}

impl<T> Attempt<T> {
    pub fn classify(result: Result<T, UpstreamError>) -> Self {
        match result {
            Ok(v) => Attempt::Ok(v),
            Err(e) => match e.class() {
                FailureClass::Retryable => Attempt::Retryable(e),
                FailureClass::Terminal => Attempt::Terminal(e),
            },
        }
    }
}

impl<T> From<Result<T, UpstreamError>> for Attempt<T> {
    fn from(result: Result<T, UpstreamError>) -> Self {
        Self::classify(result)
    }
}

/// Final failure after the retry loop gave up.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{last} (after {attempts} attempt(s))")]
pub struct RetryError {
    pub last: UpstreamError,
    pub attempts: u32,
    pub class: FailureClass,
}

impl RetryError {
    /// True if the loop stopped because retries ran out rather than on a terminal error.
    pub fn exhausted(&self) -> bool {
        self.class.is_retryable()
    }
}

/// Bounded exponential-backoff retry policy.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    config: RetryConfig,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Delay before retry number `attempt + 1` (0-based): `base × 2^attempt`,
    /// replaced by the provider's `Retry-After` hint when present, capped at `max_delay`.
    pub fn backoff(&self, attempt: u32, retry_after: Option<Duration>) -> Duration {
        let base = millis(self.config.base_delay);
        let cap = millis(self.config.max_delay);
        let factor = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
        let computed = base.saturating_mul(factor);
        let chosen = retry_after.map(millis).unwrap_or(computed).min(cap);
        Duration::from_millis(chosen)
    }

    /// Longest time a run can take when each attempt is bounded by
    /// `per_attempt` and no `Retry-After` hints are given.
    pub fn worst_case_elapsed(&self, per_attempt: Duration) -> Duration {
        let attempts = self.config.max_retries.saturating_add(1);
        (0..self.config.max_retries).fold(per_attempt.saturating_mul(attempts), |total, n| {
            total.saturating_add(self.backoff(n, None))
        })
    }

    /// Run `op` until it succeeds, fails terminally, or retries run out.
    pub async fn run<T, F, Fut>(&self, mut op: F) -> Result<T, RetryError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, UpstreamError>>,
    {
        let mut attempt: u32 = 0;
        loop {
            match Attempt::classify(op().await) {
                Attempt::Ok(v) => {
                    if attempt > 0 {
                        debug!(attempts = attempt + 1, "upstream call recovered after retry");
                    }
                    return Ok(v);
                }
                Attempt::Terminal(e) => {
                    debug!(error = %e, attempts = attempt + 1, "terminal upstream failure, not retrying");
                    return Err(RetryError {
                        last: e,
                        attempts: attempt + 1,
                        class: FailureClass::Terminal,
                    });
                }
                Attempt::Retryable(e) if attempt >= self.config.max_retries => {
                    warn!(error = %e, attempts = attempt + 1, "retries exhausted");
                    return Err(RetryError {
                        last: e,
                        attempts: attempt + 1,
                        class: FailureClass::Retryable,
                    });
                }
                Attempt::Retryable(e) => {
                    let delay = self.backoff(attempt, e.retry_after);
                    debug!(
                        error = %e,
                        attempt = attempt + 1,
                        delay_ms = millis(delay),
                        "transient upstream failure, backing off"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(RetryConfig::default())
    }
}

/// Run `op` with `max_retries` retries and `base_delay × 2^attempt` backoff.
pub async fn retry<T, F, Fut>(op: F, max_retries: u32, base_delay: Duration) -> Result<T, RetryError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, UpstreamError>>,
{
    let config = RetryConfig {
        max_retries,
        base_delay,
        max_delay: Duration::MAX,
    };
    RetryPolicy::new(config).run(op).await
}
