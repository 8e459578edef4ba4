use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;

use crate::config::duration_ms;
use crate::sweep::{Sweep, Sweeper};
use crate::{Error, ErrorContext, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimiterConfig {
    /// Requests admitted per identity per window.
    pub max_requests: u32,
    #[serde(with = "duration_ms", rename = "window_ms")]
    pub window: Duration,
    #[serde(with = "duration_ms", rename = "sweep_interval_ms")]
    pub sweep_interval: Duration,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            max_requests: 30,
            window: Duration::from_secs(60),
            sweep_interval: Duration::from_secs(300),
        }
    }
}

impl RateLimiterConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_requests(mut self, max: u32) -> Self {
        self.max_requests = max;
        self
    }

    pub fn with_window(mut self, window: Duration) -> Self {
        self.window = window;
        self
    }

    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.max_requests == 0 {
            return Err(Error::configuration_with_context(
                "rate limit must admit at least one request per window",
                ErrorContext::new()
                    .with_field_path("rate_limit.max_requests")
                    .with_source("config_loader"),
            ));
        }
        if self.window.is_zero() {
            return Err(Error::configuration_with_context(
                "rate limit window must be positive",
                ErrorContext::new()
                    .with_field_path("rate_limit.window_ms")
                    .with_source("config_loader"),
            ));
        }
        Ok(())
    }
}

/// Outcome of an admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThrottleDecision {
    pub allowed: bool,
    /// Whole seconds until the window resets. Set only on rejection.
    pub retry_after_secs: Option<u64>,
}

impl ThrottleDecision {
    fn allow() -> Self {
        Self {
            allowed: true,
            retry_after_secs: None,
        }
    }

    fn reject(retry_after_secs: u64) -> Self {
        Self {
            allowed: false,
            retry_after_secs: Some(retry_after_secs),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RateLimiterSnapshot {
    pub max_requests: u32,
    pub window_ms: u64,
    /// Checks, admitted or rejected, in the identity's current window (0 if none
    /// is active).
    pub count: u32,
    /// Remaining time in the current window, if one is active.
    pub reset_in_ms: Option<u64>,
}

#[derive(Debug, Clone, Default)]
pub struct RateLimiterStats {
    pub admitted: u64,
    pub rejected: u64,
    /// Identities with a window record.
    pub tracked: usize,
}

#[derive(Debug, Clone, Copy)]
struct ThrottleWindow {
    count: u32,
    reset_at: Instant,
}

/// Fixed-window admission control keyed by caller identity.
///
/// - The first check in a window opens it with count 1
/// - Every check in an open window increments `count`, so it passes
///   `max_requests` only on rejected checks
/// - Windows are fixed, so up to `2 × max_requests` can be admitted in a short
///   span straddling a boundary
pub struct RateLimiter {
    cfg: RateLimiterConfig,
    windows: Mutex<HashMap<String, ThrottleWindow>>,
    admitted: AtomicU64,
    rejected: AtomicU64,
    sweeper: Sweeper,
}

impl RateLimiter {
    /// Build a limiter and start the sweep that drops idle windows.
    pub fn new(cfg: RateLimiterConfig) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            sweeper: Sweeper::spawn(cfg.sweep_interval, weak.clone()),
            cfg,
            windows: Mutex::new(HashMap::new()),
            admitted: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
        })
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, ThrottleWindow>> {
        self.windows.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn check_and_increment(&self, identity: &str) -> ThrottleDecision {
        let now = Instant::now();
        let mut windows = self.lock();

        let decision = match windows.get_mut(identity) {
            Some(w) if now < w.reset_at => {
                if w.count < self.cfg.max_requests {
                    w.count += 1;
                    ThrottleDecision::allow()
                } else {
                    w.count = w.count.saturating_add(1);
                    ThrottleDecision::reject(ceil_secs(w.reset_at - now))
                }
            }
            _ => {
                windows.insert(
                    identity.to_string(),
                    ThrottleWindow {
                        count: 1,
                        reset_at: now + self.cfg.window,
                    },
                );
                ThrottleDecision::allow()
            }
        };

        if decision.allowed {
            self.admitted.fetch_add(1, Ordering::Relaxed);
        } else {
            self.rejected.fetch_add(1, Ordering::Relaxed);
        }
        decision
    }

    pub fn snapshot(&self, identity: &str) -> RateLimiterSnapshot {
        let now = Instant::now();
        let windows = self.lock();
        let active = windows.get(identity).filter(|w| now < w.reset_at);
        RateLimiterSnapshot {
            max_requests: self.cfg.max_requests,
            window_ms: self.cfg.window.as_millis() as u64,
            count: active.map(|w| w.count).unwrap_or(0),
            reset_in_ms: active.map(|w| (w.reset_at - now).as_millis() as u64),
        }
    }

    pub fn stats(&self) -> RateLimiterStats {
        RateLimiterStats {
            admitted: self.admitted.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            tracked: self.lock().len(),
        }
    }

    pub fn config(&self) -> &RateLimiterConfig {
        &self.cfg
    }

    /// Stop the idle-window sweep.
    pub fn shutdown(&self) {
        self.sweeper.shutdown();
    }
}

impl Sweep for RateLimiter {
    fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut windows = self.lock();
        let before = windows.len();
        windows.retain(|_, w| now < w.reset_at);
        before - windows.len()
    }

    fn sweep_name(&self) -> &'static str {
        "rate_limiter"
    }
}

/// Round up to whole seconds, never below 1.
fn ceil_secs(d: Duration) -> u64 {
    let ms = d.as_millis() as u64;
    ms.div_ceil(1000).max(1)
}
