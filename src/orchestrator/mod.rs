//! 请求编排模块：配额检查、缓存、请求合并、限流、重试组成的统一请求管道。
//!
//! # Request Orchestration
//!
//! [`Orchestrator::execute`] is the one path every feature-level search takes.
//!
//! ```text
//! QUOTA_CHECK ─┬─ exhausted ──────────────────────────────▶ 503 ApiResponse
//!              ▼
//! CACHE_CHECK ─┬─ fresh ─────────────────────────────────▶ cached data
//!              ├─ stale + SWR ─▶ spawn refresh ───────────▶ stale data
//!              ▼
//! DEDUP_GATE   (callers with the same key share everything below)
//!              ▼
//! THROTTLE ────┬─ rejected ──────────────────────────────▶ 429 ApiResponse
//!              ▼
//! FETCH (retry)┬─ ok ─▶ cache set + quota charge ────────▶ fresh data
//!              └─ failed ─▶ stale entry? ─ yes ─────────▶ stale data (unconfirmed)
//!                                        └ no ───────────▶ error ApiResponse
//! ```
//!
//! | Type | Role |
//! |------|------|
//! | [`Orchestrator`] | Owns the services and runs the pipeline |
//! | [`OrchestratorBuilder`] | Assembles services from a [`GuardConfig`](crate::GuardConfig) |
//! | [`SearchRequest`] | Method, resource, params, identity and the call site's cache TTL |
//! | [`ApiResponse`] | Structured result handed to the UI layer |
//! | [`RateLimitPayload`] | Body of a 429 rejection |
//!
//! ```rust,no_run
//! use search_guard::{GuardConfig, Orchestrator, SearchRequest};
//! use search_guard::provider::HttpSearchProvider;
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # #[tokio::main]
//! # async fn main() -> search_guard::Result<()> {
//! let config = GuardConfig::default().apply_env_overrides();
//! let provider = Arc::new(HttpSearchProvider::new(&config.provider)?);
//! let orchestrator = Orchestrator::new(config, provider)?;
//!
//! let request = SearchRequest::search("steam trains", "child-1", Duration::from_secs(600))
//!     .with_param("part", "snippet")
//!     .with_param("maxResults", 10);
//! let response = orchestrator.execute(request).await;
//! println!("{}", serde_json::to_string_pretty(&response)?);
//! orchestrator.shutdown();
//! # Ok(())
//! # }
//! ```

mod builder;
mod pipeline;
mod request;
mod response;

pub use builder::OrchestratorBuilder;
pub use pipeline::{Orchestrator, OrchestratorStats, RequestStats};
pub use request::SearchRequest;
pub use response::{ApiResponse, RateLimitPayload};
