//! Shared fixtures for integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use search_guard::{SearchPage, SearchProvider, SearchQuery, UpstreamError};
use serde_json::json;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;

/// In-process provider that replays scripted results, then repeats a fallback.
pub struct ScriptedProvider {
    calls: AtomicU32,
    script: Mutex<VecDeque<Result<SearchPage, UpstreamError>>>,
    fallback: Mutex<Result<SearchPage, UpstreamError>>,
    delay: Duration,
    queries: Mutex<Vec<SearchQuery>>,
}

impl ScriptedProvider {
    pub fn new(fallback: Result<SearchPage, UpstreamError>) -> Self {
        Self {
            calls: AtomicU32::new(0),
            script: Mutex::new(VecDeque::new()),
            fallback: Mutex::new(fallback),
            delay: Duration::ZERO,
            queries: Mutex::new(Vec::new()),
        }
    }

    /// Always succeeds with `page("default")`.
    pub fn ok() -> Self {
        Self::new(Ok(page("default")))
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn then(self, result: Result<SearchPage, UpstreamError>) -> Self {
        self.script.lock().unwrap().push_back(result);
        self
    }

    pub fn set_fallback(&self, result: Result<SearchPage, UpstreamError>) {
        *self.fallback.lock().unwrap() = result;
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn queries(&self) -> Vec<SearchQuery> {
        self.queries.lock().unwrap().clone()
    }
}

#[async_trait]
impl SearchProvider for ScriptedProvider {
    async fn query(&self, query: &SearchQuery) -> Result<SearchPage, UpstreamError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.queries.lock().unwrap().push(query.clone());
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let next = self.script.lock().unwrap().pop_front();
        match next {
            Some(result) => result,
            None => self.fallback.lock().unwrap().clone(),
        }
    }

    fn name(&self) -> &str {
        "scripted"
    }
}

/// A one-item page whose item id is `tag`.
pub fn page(tag: &str) -> SearchPage {
    SearchPage::new(vec![json!({ "id": { "videoId": tag } })])
}

pub fn first_id(data: &Option<Vec<serde_json::Value>>) -> Option<String> {
    data.as_ref()?
        .first()?
        .pointer("/id/videoId")?
        .as_str()
        .map(str::to_string)
}
