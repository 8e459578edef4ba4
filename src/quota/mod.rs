//! 配额管理模块：按周期累计上游配额消耗并在周期边界重置。
//!
//! # Quota Management
//!
//! Tracks units consumed against the provider's periodic budget, globally and
//! optionally per caller identity.
//!
//! | Item | Description |
//! |------|-------------|
//! | [`QuotaManager`] | Status queries and charging, with rollover on access |
//! | [`QuotaConfig`] | Budgets, period length, anchoring and per-operation costs |
//! | [`PeriodAnchor`] | Where period boundaries fall |
//! | [`QuotaStatus`] | `{units_used, units_remaining, reset_at}` snapshot |
//!
//! The gate is advisory: callers check [`QuotaManager::get_status`] before a
//! call and [`QuotaManager::charge`] after it. Concurrent callers can pass the
//! check together and push usage past the budget; `units_remaining` then reads 0.
//!
//! ```rust
//! use search_guard::quota::{QuotaConfig, QuotaManager};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let quota = QuotaManager::new(QuotaConfig::new().with_daily_budget(10_000));
//! for _ in 0..3 {
//!     quota.charge(100, None);
//! }
//! let status = quota.get_status(None);
//! assert_eq!(status.units_used, 300);
//! assert_eq!(status.units_remaining, 9_700);
//! quota.shutdown();
//! # }
//! ```

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::time::Instant;
use tracing::{debug, info};

use crate::config::duration_ms;
use crate::sweep::{Sweep, Sweeper};
use crate::{Error, ErrorContext, Result};

/// Where the first period boundary falls.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PeriodAnchor {
    /// One period after the manager is built.
    #[default]
    Startup,
    /// Aligned to wall-clock multiples of the period shifted by `offset_secs`
    /// from UTC. Midnight Pacific standard time is `-28800`.
    UtcOffset { offset_secs: i64 },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QuotaConfig {
    /// Units available per period across all identities.
    pub daily_budget: u64,
    /// Optional cap per identity within the global budget.
    pub per_identity_budget: Option<u64>,
    #[serde(with = "duration_ms", rename = "period_ms")]
    pub period: Duration,
    pub anchor: PeriodAnchor,
    /// Estimated cost per resource (case-insensitive), used when the provider
    /// does not report the units it charged.
    pub operation_costs: BTreeMap<String, u64>,
    pub default_cost: u64,
    #[serde(with = "duration_ms", rename = "sweep_interval_ms")]
    pub sweep_interval: Duration,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        let operation_costs = [("search", 100), ("videos", 1), ("channels", 1), ("playlistitems", 1)]
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect();
        Self {
            daily_budget: 10_000,
            per_identity_budget: None,
            period: Duration::from_secs(24 * 60 * 60),
            anchor: PeriodAnchor::Startup,
            operation_costs,
            default_cost: 100,
            sweep_interval: Duration::from_secs(300),
        }
    }
}

impl QuotaConfig {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn with_daily_budget(mut self, budget: u64) -> Self {
        self.daily_budget = budget;
        self
    }
    pub fn with_per_identity_budget(mut self, budget: u64) -> Self {
        self.per_identity_budget = Some(budget);
        self
    }
    pub fn with_period(mut self, period: Duration) -> Self {
        self.period = period;
        self
    }
    pub fn with_anchor(mut self, anchor: PeriodAnchor) -> Self {
        self.anchor = anchor;
        self
    }
    pub fn with_operation_cost(mut self, resource: impl Into<String>, cost: u64) -> Self {
        self.operation_costs
            .insert(resource.into().to_ascii_lowercase(), cost);
        self
    }
    pub fn with_default_cost(mut self, cost: u64) -> Self {
        self.default_cost = cost;
        self
    }
    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    /// Estimated units for one call against `resource`.
    pub fn cost_of(&self, resource: &str) -> u64 {
        let resource = resource.trim().trim_matches('/');
        self.operation_costs
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(resource))
            .map(|(_, v)| *v)
            .unwrap_or(self.default_cost)
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.daily_budget == 0 {
            return Err(Error::configuration_with_context(
                "quota budget must be positive",
                ErrorContext::new()
                    .with_field_path("quota.daily_budget")
                    .with_source("config_loader"),
            ));
        }
        if self.per_identity_budget == Some(0) {
            return Err(Error::configuration_with_context(
                "per-identity budget must be positive when set",
                ErrorContext::new()
                    .with_field_path("quota.per_identity_budget")
                    .with_source("config_loader"),
            ));
        }
        if self.period < Duration::from_millis(1) {
            return Err(Error::configuration_with_context(
                "quota period must be at least 1ms",
                ErrorContext::new()
                    .with_field_path("quota.period_ms")
                    .with_details(format!("got {:?}", self.period))
                    .with_source("config_loader"),
            ));
        }
        Ok(())
    }
}

/// Point-in-time view of the budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuotaStatus {
    pub units_used: u64,
    pub units_remaining: u64,
    pub reset_at: SystemTime,
}

impl QuotaStatus {
    pub fn is_exhausted(&self) -> bool {
        self.units_remaining == 0
    }

    /// `reset_at` as milliseconds since the Unix epoch.
    pub fn reset_at_unix_ms(&self) -> u64 {
        self.reset_at
            .duration_since(UNIX_EPOCH)
            .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
            .unwrap_or(0)
    }

    /// Time left until the period resets, measured against the wall clock.
    pub fn resets_in(&self) -> Duration {
        self.reset_at
            .duration_since(SystemTime::now())
            .unwrap_or(Duration::ZERO)
    }
}

struct QuotaState {
    used: u64,
    reset_at: Instant,
    by_identity: HashMap<String, u64>,
}

/// Periodic-budget accounting.
///
/// Every read and write first rolls the period forward if its boundary has
/// passed, so usage resets exactly at the boundary even when the sweep is late.
pub struct QuotaManager {
    config: QuotaConfig,
    state: Mutex<QuotaState>,
    sweeper: Sweeper,
}

impl QuotaManager {
    pub fn new(config: QuotaConfig) -> Arc<Self> {
        let first_reset = Instant::now() + until_first_boundary(&config, SystemTime::now());
        Arc::new_cyclic(|weak| Self {
            sweeper: Sweeper::spawn(config.sweep_interval, weak.clone()),
            state: Mutex::new(QuotaState {
                used: 0,
                reset_at: first_reset,
                by_identity: HashMap::new(),
            }),
            config,
        })
    }

    pub fn config(&self) -> &QuotaConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, QuotaState> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        self.roll_over(&mut state, Instant::now());
        state
    }

    fn roll_over(&self, state: &mut QuotaState, now: Instant) -> usize {
        if now < state.reset_at {
            return 0;
        }
        let period = self.config.period;
        let behind = now.duration_since(state.reset_at);
        let skipped = u32::try_from(behind.as_nanos() / period.as_nanos().max(1)).unwrap_or(u32::MAX);
        state.reset_at += period.saturating_mul(skipped) + period;

        let cleared = state.by_identity.len();
        info!(units_used = state.used, identities = cleared, "quota period rolled over");
        state.used = 0;
        state.by_identity.clear();
        cleared
    }

    /// Usage and remaining budget. With an identity, `units_used` is that
    /// identity's own usage and `units_remaining` is bounded by both budgets.
    pub fn get_status(&self, identity: Option<&str>) -> QuotaStatus {
        let state = self.lock();
        let global_remaining = self.config.daily_budget.saturating_sub(state.used);

        let (units_used, units_remaining) = match identity {
            Some(id) => {
                let used = state.by_identity.get(id).copied().unwrap_or(0);
                let remaining = match self.config.per_identity_budget {
                    Some(cap) => global_remaining.min(cap.saturating_sub(used)),
                    None => global_remaining,
                };
                (used, remaining)
            }
            None => (state.used, global_remaining),
        };

        QuotaStatus {
            units_used,
            units_remaining,
            reset_at: to_system_time(state.reset_at),
        }
    }

    /// Record `units` against the global budget and, if given, the identity.
    /// Both totals move under one lock.
    pub fn charge(&self, units: u64, identity: Option<&str>) {
        let mut state = self.lock();
        state.used = state.used.saturating_add(units);
        if let Some(id) = identity {
            let entry = state.by_identity.entry(id.to_string()).or_insert(0);
            *entry = entry.saturating_add(units);
        }
        debug!(units, identity = identity.unwrap_or("-"), total = state.used, "quota charged");
    }

    pub fn can_afford(&self, cost: u64, identity: Option<&str>) -> bool {
        self.get_status(identity).units_remaining >= cost
    }

    /// Per-identity usage in the current period.
    pub fn usage_by_identity(&self) -> BTreeMap<String, u64> {
        self.lock()
            .by_identity
            .iter()
            .map(|(k, v)| (k.clone(), *v))
            .collect()
    }

    /// Stop the rollover sweep.
    pub fn shutdown(&self) {
        self.sweeper.shutdown();
    }
}

impl Sweep for QuotaManager {
    fn sweep(&self) -> usize {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        self.roll_over(&mut state, Instant::now())
    }

    fn sweep_name(&self) -> &'static str {
        "quota_manager"
    }
}

fn to_system_time(at: Instant) -> SystemTime {
    SystemTime::now() + at.saturating_duration_since(Instant::now())
}

/// Time from `now` until the first boundary under the configured anchor.
fn until_first_boundary(config: &QuotaConfig, now: SystemTime) -> Duration {
    match config.anchor {
        PeriodAnchor::Startup => config.period,
        PeriodAnchor::UtcOffset { offset_secs } => {
            let period_ms = i128::try_from(config.period.as_millis()).unwrap_or(i128::MAX).max(1);
            let now_ms = now
                .duration_since(UNIX_EPOCH)
                .map(|d| i128::try_from(d.as_millis()).unwrap_or(0))
                .unwrap_or(0);
            let local_ms = now_ms + i128::from(offset_secs) * 1000;
            let into_period = local_ms.rem_euclid(period_ms);
            let remaining = period_ms - into_period;
            Duration::from_millis(u64::try_from(remaining).unwrap_or(u64::MAX))
        }
    }
}
