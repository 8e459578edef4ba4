//! Request key generation.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};

const DEGENERATE_PREFIX: &str = "degenerate:";

/// Stable identifier for a logical request.
///
/// Two logically identical requests (same method, resource, parameters and
/// caller identity, modulo case and field order) produce the same key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RequestKey(String);

impl RequestKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Keys produced from invalid input. Unique per call, so they never
    /// coalesce or share cache entries.
    pub fn is_degenerate(&self) -> bool {
        self.0.starts_with(DEGENERATE_PREFIX)
    }

    fn degenerate() -> Self {
        Self(format!("{}{}", DEGENERATE_PREFIX, uuid::Uuid::new_v4()))
    }
}

impl std::fmt::Display for RequestKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for RequestKey {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for RequestKey {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

/// Derives [`RequestKey`]s from request parts.
pub struct KeyGenerator {
    salt: Option<String>,
    /// Lower-cased parameter names whose string values keep their case.
    case_sensitive: BTreeSet<String>,
}

impl KeyGenerator {
    pub fn new() -> Self {
        let case_sensitive = ["pagetoken", "key", "channelid", "videoid", "playlistid", "id"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        Self {
            salt: None,
            case_sensitive,
        }
    }

    pub fn with_salt(mut self, salt: impl Into<String>) -> Self {
        self.salt = Some(salt.into());
        self
    }

    /// Keep the value of `param` case-sensitive when canonicalizing.
    pub fn with_case_sensitive_param(mut self, param: impl AsRef<str>) -> Self {
        self.case_sensitive.insert(param.as_ref().to_lowercase());
        self
    }

    /// Generate a key. Never fails: empty `method` or `resource` yields a
    /// degenerate key instead.
    pub fn generate(&self, method: &str, resource: &str, params: &str, identity: &str) -> RequestKey {
        let method = method.trim();
        let resource = resource.trim().trim_matches('/');
        if method.is_empty() || resource.is_empty() {
            return RequestKey::degenerate();
        }

        let identity = match identity.trim() {
            "" => "anonymous",
            id => id,
        };

        let mut parts: BTreeMap<&str, Value> = BTreeMap::new();
        parts.insert("method", Value::String(method.to_uppercase()));
        parts.insert("resource", Value::String(resource.to_lowercase()));
        parts.insert("params", self.canonical_params(params));
        parts.insert("identity", Value::String(identity.to_string()));
        if let Some(ref s) = self.salt {
            parts.insert("salt", Value::String(s.clone()));
        }

        let canonical = serde_json::to_string(&parts).unwrap_or_default();
        let mut hasher = Sha256::new();
        hasher.update(canonical.as_bytes());
        let hash: String = hasher
            .finalize()
            .iter()
            .map(|b| format!("{:02x}", b))
            .collect();
        RequestKey(format!("rk:{}", hash))
    }

    /// Generate a key from an already-structured parameter object.
    pub fn generate_from_json(&self, method: &str, resource: &str, params: &Value, identity: &str) -> RequestKey {
        self.generate(method, resource, &params.to_string(), identity)
    }

    fn canonical_params(&self, params: &str) -> Value {
        let trimmed = params.trim();
        if trimmed.is_empty() {
            return Value::Object(Default::default());
        }
        if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
            return self.canonical_value(None, value);
        }
        if trimmed.contains('=') {
            let query = trimmed.trim_start_matches('?');
            let mut map = serde_json::Map::new();
            for (k, v) in url::form_urlencoded::parse(query.as_bytes()) {
                map.insert(k.into_owned(), Value::String(v.into_owned()));
            }
            return self.canonical_value(None, Value::Object(map));
        }
        Value::String(trimmed.to_string())
    }

    fn canonical_value(&self, field: Option<&str>, value: Value) -> Value {
        match value {
            Value::Object(map) => {
                // serde_json::Map is ordered by key unless `preserve_order` is on;
                // collect through a BTreeMap so ordering never depends on features.
                let sorted: BTreeMap<String, Value> = map
                    .into_iter()
                    .map(|(k, v)| {
                        let k = k.trim().to_lowercase();
                        let v = self.canonical_value(Some(&k), v);
                        (k, v)
                    })
                    .collect();
                Value::Object(sorted.into_iter().collect())
            }
            Value::Array(items) => Value::Array(
                items
                    .into_iter()
                    .map(|v| self.canonical_value(field, v))
                    .collect(),
            ),
            Value::String(s) => {
                let s = s.trim();
                let keep_case = field.map(|f| self.case_sensitive.contains(f)).unwrap_or(false);
                if keep_case {
                    Value::String(s.to_string())
                } else {
                    Value::String(s.to_lowercase())
                }
            }
            other => other,
        }
    }
}

impl Default for KeyGenerator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_field_order_and_case_are_normalized() {
        let gen = KeyGenerator::new();
        let a = gen.generate("get", "/search", r#"{"q":"Dinosaurs","maxResults":10}"#, "u1");
        let b = gen.generate("GET", "search/", r#"{"MaxResults":10, "q":" dinosaurs "}"#, "u1");
        assert_eq!(a, b);
        assert!(a.as_str().starts_with("rk:"));
    }

    #[test]
    fn test_query_string_matches_json_params() {
        let gen = KeyGenerator::new();
        let json = gen.generate("GET", "search", r#"{"q":"cats","type":"video"}"#, "u1");
        let query = gen.generate("GET", "search", "type=video&q=cats", "u1");
        assert_eq!(json, query);
    }

    #[test]
    fn test_identity_isolates_keys() {
        let gen = KeyGenerator::new();
        let a = gen.generate("GET", "search", r#"{"q":"cats"}"#, "u1");
        let b = gen.generate("GET", "search", r#"{"q":"cats"}"#, "u2");
        assert_ne!(a, b);
        let anon = gen.generate("GET", "search", r#"{"q":"cats"}"#, "  ");
        assert_eq!(anon, gen.generate("GET", "search", r#"{"q":"cats"}"#, "anonymous"));
    }

    #[test]
    fn test_page_token_keeps_case() {
        let gen = KeyGenerator::new();
        let a = gen.generate("GET", "search", r#"{"q":"cats","pageToken":"CAoQAA"}"#, "u1");
        let b = gen.generate("GET", "search", r#"{"q":"cats","pageToken":"caoqaa"}"#, "u1");
        assert_ne!(a, b);
    }

    #[test]
    fn test_custom_case_sensitive_param() {
        let gen = KeyGenerator::new().with_case_sensitive_param("regionCode");
        let a = gen.generate("GET", "search", r#"{"regionCode":"US"}"#, "u1");
        let b = gen.generate("GET", "search", r#"{"regionCode":"us"}"#, "u1");
        assert_ne!(a, b);
    }

    #[test]
    fn test_empty_method_or_resource_is_degenerate_and_unique() {
        let gen = KeyGenerator::new();
        let a = gen.generate("", "search", "{}", "u1");
        let b = gen.generate("", "search", "{}", "u1");
        assert!(a.is_degenerate());
        assert!(b.is_degenerate());
        assert_ne!(a, b);
        assert!(gen.generate("GET", " / ", "{}", "u1").is_degenerate());
        assert!(!gen.generate("GET", "search", "{}", "u1").is_degenerate());
    }

    #[test]
    fn test_salt_changes_key() {
        let plain = KeyGenerator::new().generate("GET", "search", "{}", "u1");
        let salted = KeyGenerator::new().with_salt("v2").generate("GET", "search", "{}", "u1");
        assert_ne!(plain, salted);
    }

    #[test]
    fn test_generate_from_json_matches_string_form() {
        let gen = KeyGenerator::new();
        let value = serde_json::json!({"q": "Trains", "safeSearch": "strict"});
        assert_eq!(
            gen.generate_from_json("GET", "search", &value, "u1"),
            gen.generate("GET", "search", r#"{"safeSearch":"strict","q":"trains"}"#, "u1")
        );
    }
}
