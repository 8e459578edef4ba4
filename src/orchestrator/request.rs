use serde_json::{Map, Value};
use std::time::Duration;

use crate::provider::SearchQuery;

/// One logical request issued by a feature.
///
/// `cache_ttl` has no default: each call site decides how much staleness it
/// tolerates.
#[derive(Debug, Clone)]
pub struct SearchRequest {
    pub method: String,
    pub resource: String,
    pub params: Map<String, Value>,
    pub identity: String,
    pub cache_ttl: Duration,
    /// Estimated units, overriding the per-resource table in the quota config.
    pub cost_units: Option<u64>,
    /// `Some(false)` disables stale-while-revalidate for this call. It cannot
    /// enable it when the cache config has it off.
    pub stale_while_revalidate: Option<bool>,
}

impl SearchRequest {
    pub fn new(
        method: impl Into<String>,
        resource: impl Into<String>,
        identity: impl Into<String>,
        cache_ttl: Duration,
    ) -> Self {
        Self {
            method: method.into(),
            resource: resource.into(),
            params: Map::new(),
            identity: identity.into(),
            cache_ttl,
            cost_units: None,
            stale_while_revalidate: None,
        }
    }

    /// `GET search` with `q` set.
    pub fn search(query: impl Into<String>, identity: impl Into<String>, cache_ttl: Duration) -> Self {
        Self::new("GET", "search", identity, cache_ttl).with_param("q", query.into())
    }

    pub fn with_param(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.params.insert(name.into(), value.into());
        self
    }

    pub fn with_params(mut self, params: Map<String, Value>) -> Self {
        self.params.extend(params);
        self
    }

    pub fn with_cost_units(mut self, units: u64) -> Self {
        self.cost_units = Some(units);
        self
    }

    pub fn with_stale_while_revalidate(mut self, enabled: bool) -> Self {
        self.stale_while_revalidate = Some(enabled);
        self
    }

    /// Identity used for keying, throttling and quota. Blank means anonymous.
    pub fn effective_identity(&self) -> &str {
        match self.identity.trim() {
            "" => "anonymous",
            id => id,
        }
    }

    /// Provider query with method and resource normalized the same way the
    /// request key normalizes them, so coalesced callers share one upstream path.
    /// Params are passed through as given.
    pub fn to_query(&self) -> SearchQuery {
        SearchQuery {
            method: self.method.trim().to_uppercase(),
            resource: self.resource.trim().trim_matches('/').to_lowercase(),
            params: self.params.clone(),
        }
    }
}
