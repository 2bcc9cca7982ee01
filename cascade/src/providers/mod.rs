//! Provider adapters.
//!
//! A [`Provider`] performs one fetch through one extraction service. It
//! reports what came back and nothing else: whether a status counts as
//! success, retries, scoring and spend are the scheduler's business.

pub mod proxy_api;
pub mod solver;

pub use proxy_api::ProxyApiProvider;
pub use solver::SolverProvider;

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::types::{Cookie, RequestDescriptor};

/// Raw response relayed by a provider.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProviderResponse {
    /// Status of the target page, not of the provider's own API.
    pub status_code: u16,
    pub content: String,
    pub headers: BTreeMap<String, String>,
    pub cookies: Vec<Cookie>,
    /// USD actually charged, when the service reports it.
    pub reported_cost: Option<f64>,
}

impl ProviderResponse {
    pub fn new(status_code: u16, content: impl Into<String>) -> Self {
        Self {
            status_code,
            content: content.into(),
            ..Self::default()
        }
    }

    pub fn with_header(mut self, name: impl AsRef<str>, value: impl Into<String>) -> Self {
        self.headers
            .insert(name.as_ref().to_ascii_lowercase(), value.into());
        self
    }

    pub fn with_reported_cost(mut self, usd: f64) -> Self {
        self.reported_cost = Some(usd);
        self
    }

    /// Any 2xx.
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status_code)
    }
}

/// Why a single provider attempt produced no response.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ProviderError {
    #[error("timed out after {after_ms}ms")]
    Timeout { after_ms: u64 },

    #[error("network error: {0}")]
    Network(String),

    /// The provider's own API answered with a non-success status.
    #[error("provider API returned HTTP {status}")]
    HttpStatus { status: u16 },

    #[error("invalid provider response: {0}")]
    InvalidResponse(String),

    #[error("unsupported request: {0}")]
    Unsupported(String),
}

impl ProviderError {
    pub fn status_code(&self) -> Option<u16> {
        match self {
            Self::HttpStatus { status } => Some(*status),
            _ => None,
        }
    }

    pub(crate) fn from_reqwest(err: reqwest::Error, timeout: Duration) -> Self {
        if err.is_timeout() {
            Self::Timeout {
                after_ms: timeout.as_millis() as u64,
            }
        } else if err.is_decode() {
            Self::InvalidResponse(err.to_string())
        } else {
            Self::Network(err.to_string())
        }
    }
}

/// One extraction service.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Must match the name in the provider's settings.
    fn name(&self) -> &str;

    async fn fetch(
        &self,
        request: &RequestDescriptor,
        timeout: Duration,
    ) -> Result<ProviderResponse, ProviderError>;
}

pub type SharedProvider = Arc<dyn Provider>;

pub(crate) fn http_client() -> Result<reqwest::Client, ProviderError> {
    reqwest::Client::builder()
        .build()
        .map_err(|e| ProviderError::Network(format!("failed to build HTTP client: {e}")))
}

/// `name=value` pairs out of `Set-Cookie` headers.
pub(crate) fn parse_set_cookie(raw: &str) -> Option<Cookie> {
    let mut parts = raw.split(';').map(str::trim);
    let (name, value) = parts.next()?.split_once('=')?;
    if name.is_empty() {
        return None;
    }
    let domain = parts.find_map(|attr| {
        let (k, v) = attr.split_once('=')?;
        k.eq_ignore_ascii_case("domain").then(|| v.to_string())
    });
    Some(Cookie {
        name: name.to_string(),
        value: value.to_string(),
        domain,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_success_is_2xx() {
        assert!(ProviderResponse::new(200, "").is_success());
        assert!(ProviderResponse::new(204, "").is_success());
        assert!(!ProviderResponse::new(302, "").is_success());
        assert!(!ProviderResponse::new(403, "").is_success());
    }

    #[test]
    fn test_parse_set_cookie() {
        let c = parse_set_cookie("cf_clearance=abc123; Path=/; Domain=.example.com; HttpOnly").unwrap();
        assert_eq!(c.name, "cf_clearance");
        assert_eq!(c.value, "abc123");
        assert_eq!(c.domain.as_deref(), Some(".example.com"));
        assert!(parse_set_cookie("garbage").is_none());
    }

    #[test]
    fn test_error_text() {
        assert_eq!(
            ProviderError::Timeout { after_ms: 500 }.to_string(),
            "timed out after 500ms"
        );
        assert_eq!(ProviderError::HttpStatus { status: 502 }.status_code(), Some(502));
    }
}
