//! Request and result types shared across the engine.

use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;

/// An immutable description of one logical request.
///
/// Header names are stored lowercased so fingerprints do not depend on the
/// caller's casing. Built once through the `with_*` builders, then only read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestDescriptor {
    url: String,
    method: String,
    #[serde(default, deserialize_with = "lowercase_header_names")]
    headers: BTreeMap<String, String>,
    #[serde(default)]
    body: Vec<u8>,
}

fn lowercase_header_names<'de, D>(deserializer: D) -> Result<BTreeMap<String, String>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = BTreeMap::<String, String>::deserialize(deserializer)?;
    Ok(raw
        .into_iter()
        .map(|(name, value)| (name.to_ascii_lowercase(), value))
        .collect())
}

impl RequestDescriptor {
    pub fn new(method: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            method: method.into(),
            headers: BTreeMap::new(),
            body: Vec::new(),
        }
    }

    /// Shorthand for a `GET` request.
    pub fn get(url: impl Into<String>) -> Self {
        Self::new("GET", url)
    }

    pub fn with_header(mut self, name: impl AsRef<str>, value: impl Into<String>) -> Self {
        self.headers
            .insert(name.as_ref().to_ascii_lowercase(), value.into());
        self
    }

    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn headers(&self) -> &BTreeMap<String, String> {
        &self.headers
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }
}

/// Per-call options.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FetchOptions {
    /// Restrict the cascade to this provider. Overrides circuit state, not budget.
    pub force_provider: Option<String>,
    /// Skip the response cache lookup (the result is still stored).
    pub bypass_cache: bool,
    /// Exclude providers whose per-request cost exceeds this (USD).
    pub max_cost: Option<f64>,
    /// Provider to try first when it is eligible.
    pub priority_hint: Option<String>,
}

impl FetchOptions {
    pub fn force_provider(mut self, name: impl Into<String>) -> Self {
        self.force_provider = Some(name.into());
        self
    }

    pub fn bypass_cache(mut self) -> Self {
        self.bypass_cache = true;
        self
    }

    pub fn max_cost(mut self, usd: f64) -> Self {
        self.max_cost = Some(usd);
        self
    }

    pub fn priority_hint(mut self, name: impl Into<String>) -> Self {
        self.priority_hint = Some(name.into());
        self
    }
}

/// One provider attempt inside a cascade. Never modified once appended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub provider: String,
    pub success: bool,
    pub status_code: Option<u16>,
    /// USD charged for this attempt (zero for failures).
    pub cost: f64,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// A cookie returned by a provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cookie {
    pub name: String,
    pub value: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
}

/// Outcome of a cascade as seen by one caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CascadeResult {
    pub success: bool,
    pub provider: String,
    pub url: String,
    pub status_code: u16,
    pub content: String,
    pub headers: BTreeMap<String, String>,
    pub cookies: Vec<Cookie>,
    /// USD incurred by *this* call. Zero for cache hits and coalesced joins.
    pub cost: f64,
    pub response_time_ms: u64,
    pub cached: bool,
    /// True when this caller joined another caller's in-flight execution.
    #[serde(default)]
    pub deduped: bool,
    /// Attempts executed on behalf of this call.
    pub attempts: Vec<AttemptRecord>,
}

impl CascadeResult {
    /// The view handed to a caller that joined an in-flight execution:
    /// same payload, no spend, no attempts of its own.
    pub fn as_deduped(&self) -> Self {
        Self {
            cost: 0.0,
            deduped: true,
            attempts: Vec::new(),
            ..self.clone()
        }
    }

    /// The view handed to a caller served from cache.
    pub fn as_cached(&self, response_time_ms: u64) -> Self {
        Self {
            cost: 0.0,
            cached: true,
            deduped: false,
            response_time_ms,
            attempts: Vec::new(),
            ..self.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_names_lowercased() {
        let req = RequestDescriptor::get("https://example.com")
            .with_header("User-Agent", "x")
            .with_header("ACCEPT", "text/html");
        assert_eq!(req.headers().get("user-agent").map(String::as_str), Some("x"));
        assert!(req.headers().contains_key("accept"));
    }

    #[test]
    fn test_deduped_view_strips_spend() {
        let result = CascadeResult {
            success: true,
            provider: "premium".into(),
            url: "https://example.com".into(),
            status_code: 200,
            content: "<html/>".into(),
            headers: BTreeMap::new(),
            cookies: vec![],
            cost: 0.025,
            response_time_ms: 800,
            cached: false,
            deduped: false,
            attempts: vec![AttemptRecord {
                provider: "premium".into(),
                success: true,
                status_code: Some(200),
                cost: 0.025,
                duration_ms: 800,
                error: None,
            }],
        };
        let view = result.as_deduped();
        assert!(view.deduped);
        assert_eq!(view.cost, 0.0);
        assert!(view.attempts.is_empty());
        assert_eq!(view.content, result.content);

        let cached = result.as_cached(1);
        assert!(cached.cached);
        assert!(!cached.deduped);
        assert_eq!(cached.response_time_ms, 1);
    }
}
