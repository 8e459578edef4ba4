//! 上游搜索服务边界：查询/结果类型与提供者 trait。
//!
//! # Search Provider Boundary
//!
//! The orchestrator talks to the upstream video-search service only through
//! [`SearchProvider`]. [`HttpSearchProvider`] implements it over HTTP with
//! `reqwest`; tests substitute in-process fakes.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::UpstreamError;

mod http;

pub use http::{HttpSearchProvider, ProviderConfig};

/// One upstream call, already stripped of anything that is not a query parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchQuery {
    pub method: String,
    pub resource: String,
    #[serde(default)]
    pub params: Map<String, Value>,
}

impl SearchQuery {
    pub fn new(method: impl Into<String>, resource: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            resource: resource.into(),
            params: Map::new(),
        }
    }

    pub fn with_param(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.params.insert(name.into(), value.into());
        self
    }

    /// Canonical JSON text of `params`, the form fed to the key generator.
    pub fn params_json(&self) -> String {
        Value::Object(self.params.clone()).to_string()
    }
}

/// A page of results as returned by the provider.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchPage {
    #[serde(default)]
    pub items: Vec<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_page_token: Option<String>,
    /// Units the provider reports having charged, when it reports them.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost_units: Option<u64>,
}

impl SearchPage {
    pub fn new(items: Vec<Value>) -> Self {
        Self {
            items,
            ..Self::default()
        }
    }

    pub fn with_next_page_token(mut self, token: impl Into<String>) -> Self {
        self.next_page_token = Some(token.into());
        self
    }

    pub fn with_cost_units(mut self, units: u64) -> Self {
        self.cost_units = Some(units);
        self
    }
}

/// The upstream video-search service.
#[async_trait]
pub trait SearchProvider: Send + Sync {
    /// Perform one call. Implementations classify their own failures through
    /// [`UpstreamError::kind`]; they do not retry.
    async fn query(&self, query: &SearchQuery) -> Result<SearchPage, UpstreamError>;

    fn name(&self) -> &str;
}
