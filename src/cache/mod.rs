//! 响应缓存模块：请求键生成、带过期时间的响应存储、过期后台刷新与错误降级。
//!
//! # Response Caching Module
//!
//! Request keys and a time-bounded response store that lets the orchestrator skip
//! upstream calls for repeated searches.
//!
//! ## Key Components
//!
//! | Component | Description |
//! |-----------|-------------|
//! | [`KeyGenerator`] | Derives a [`RequestKey`] from method, resource, params and identity |
//! | [`ResponseCache`] | TTL store with stale-while-revalidate and stale fallback |
//! | [`CacheConfig`] | Switches, size limits, eviction grace and sweep interval |
//! | [`CacheBackend`] | Trait for storage backends |
//! | [`MemoryCache`] | In-memory LRU-bounded backend |
//! | [`NullCache`] | No-op backend for disabling caching |
//!
//! ## Example
//!
//! ```rust
//! use search_guard::cache::{CacheConfig, KeyGenerator, ResponseCache};
//! use std::time::Duration;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> search_guard::Result<()> {
//! let cache = ResponseCache::in_memory(CacheConfig::default());
//! let key = KeyGenerator::new().generate("GET", "search", r#"{"q":"trains"}"#, "child-1");
//!
//! cache.set(&key, &vec!["video-1"], Duration::from_secs(300)).await?;
//! let hit = cache.get::<Vec<String>>(&key).await?.expect("fresh entry");
//! assert!(!hit.is_stale());
//! cache.shutdown();
//! # Ok(())
//! # }
//! ```
//!
//! ## TTLs
//!
//! There is no global default TTL. Every `set` takes the TTL chosen by the call
//! site, since different features tolerate different staleness.

mod backend;
mod key;
mod manager;

pub use backend::{CacheBackend, CacheEntry, MemoryCache, NullCache};
pub use key::{KeyGenerator, RequestKey};
pub use manager::{CacheConfig, CacheLookup, CacheStats, Freshness, ResponseCache};

pub(crate) use manager::validate;
