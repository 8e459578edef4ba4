//! # search-guard
//!
//! 面向配额受限视频搜索服务的客户端请求优化层：请求合并、限流、缓存、配额与重试。
//!
//! Client-side request optimization for a single quota-limited video-search
//! provider shared by many UI surfaces.
//!
//! ## Overview
//!
//! Feeds, search boxes and category browsers issue overlapping searches at the
//! same time. Left alone they burn a fixed daily budget in minutes. Every search
//! goes through one [`Orchestrator`] instead, which checks the quota, serves from
//! cache where it can, collapses identical concurrent calls into one, throttles
//! each caller identity, and retries transient upstream failures.
//!
//! ## Key Features
//!
//! - **Coalescing**: concurrent identical requests share one upstream call ([`coalesce`])
//! - **Throttling**: fixed-window admission per identity with `Retry-After` hints ([`resilience`])
//! - **Caching**: TTL cache with stale-while-revalidate and stale fallback on failure ([`cache`])
//! - **Quota**: periodic budget accounting, global and per identity ([`quota`])
//! - **Retry**: bounded exponential backoff driven by explicit failure classification
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use search_guard::{GuardConfig, Orchestrator, SearchRequest};
//! use search_guard::provider::HttpSearchProvider;
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> search_guard::Result<()> {
//!     let config = GuardConfig::from_path("search-guard.yaml")?.apply_env_overrides();
//!     let provider = Arc::new(HttpSearchProvider::new(&config.provider)?);
//!     let orchestrator = Orchestrator::new(config, provider)?;
//!
//!     let response = orchestrator
//!         .execute(SearchRequest::search("dinosaurs", "child-1", Duration::from_secs(900)))
//!         .await;
//!     if let Some(payload) = response.rate_limit_payload() {
//!         eprintln!("throttled: retry in {}s", payload.retry_after);
//!     }
//!
//!     orchestrator.shutdown();
//!     Ok(())
//! }
//! ```
//!
//! ## Module Organization
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`orchestrator`] | The request pipeline and its response types |
//! | [`cache`] | Request keys and the response cache |
//! | [`coalesce`] | In-flight request deduplication |
//! | [`resilience`] | Rate limiting and retry |
//! | [`quota`] | Quota accounting |
//! | [`provider`] | Upstream search provider trait and HTTP implementation |
//! | [`config`] | YAML configuration and environment overrides |
//! | [`sweep`] | Owned background sweep tasks |

pub mod cache;
pub mod coalesce;
pub mod config;
pub mod orchestrator;
pub mod provider;
pub mod quota;
pub mod resilience;
pub mod sweep;

// Re-export main types for convenience
pub use cache::{KeyGenerator, RequestKey};
pub use config::GuardConfig;
pub use orchestrator::{ApiResponse, Orchestrator, OrchestratorBuilder, RateLimitPayload, SearchRequest};
pub use provider::{SearchPage, SearchProvider, SearchQuery};

/// Result type alias for the library
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for the library
pub mod error;
pub use error::{Error, ErrorContext, FailureClass, UpstreamError, UpstreamErrorKind};
