//! 弹性模式模块：按调用方身份的固定窗口限流与指数退避重试。
//!
//! # Resilience Primitives Module
//!
//! Admission control and retry for calls against the quota-limited search
//! provider.
//!
//! ## Key Components
//!
//! | Component | Description |
//! |-----------|-------------|
//! | [`rate_limiter`] | Fixed-window admission control per caller identity |
//! | [`retry`] | Bounded exponential backoff with retryable/terminal classification |
//!
//! ## Rate Limiter
//!
//! Each identity gets `max_requests` per `window`. Rejections carry a
//! `retry_after_secs` hint rounded up to whole seconds.
//!
//! ```rust
//! use search_guard::resilience::rate_limiter::{RateLimiter, RateLimiterConfig};
//! use std::time::Duration;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let limiter = RateLimiter::new(
//!     RateLimiterConfig::new()
//!         .with_max_requests(5)
//!         .with_window(Duration::from_secs(60)),
//! );
//! for _ in 0..5 {
//!     assert!(limiter.check_and_increment("u1").allowed);
//! }
//! let rejected = limiter.check_and_increment("u1");
//! assert!(!rejected.allowed);
//! assert!(rejected.retry_after_secs.unwrap() <= 60);
//! limiter.shutdown();
//! # }
//! ```
//!
//! ## Retry
//!
//! ```rust
//! use search_guard::error::UpstreamError;
//! use search_guard::resilience::retry::retry;
//! use std::time::Duration;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let result = retry(
//!     || async { Err::<(), _>(UpstreamError::bad_request("missing q")) },
//!     3,
//!     Duration::from_millis(100),
//! )
//! .await;
//! // Terminal failures are returned after one attempt.
//! assert_eq!(result.unwrap_err().attempts, 1);
//! # }
//! ```

pub mod rate_limiter;
pub mod retry;
