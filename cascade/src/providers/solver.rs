//! Challenge-solver adapter (FlareSolverr-compatible JSON API).
//!
//! `POST {endpoint}/v1` with `{"cmd": "request.get", "url": .., "maxTimeout": ..}`.
//! The solver drives a real browser through the challenge and returns the
//! final page in `solution`.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::debug;

use super::{http_client, Provider, ProviderError, ProviderResponse};
use crate::types::{Cookie, RequestDescriptor};

/// Extra time the HTTP call gets on top of the solver's own `maxTimeout`.
const TRANSPORT_SLACK: Duration = Duration::from_secs(5);

#[derive(Debug, Deserialize)]
struct SolverReply {
    status: String,
    #[serde(default)]
    message: String,
    solution: Option<Solution>,
}

#[derive(Debug, Deserialize)]
struct Solution {
    status: u16,
    #[serde(default)]
    response: String,
    #[serde(default)]
    headers: BTreeMap<String, String>,
    #[serde(default)]
    cookies: Vec<SolverCookie>,
}

#[derive(Debug, Deserialize)]
struct SolverCookie {
    name: String,
    value: String,
    #[serde(default)]
    domain: Option<String>,
}

pub struct SolverProvider {
    name: String,
    endpoint: String,
    client: reqwest::Client,
}

impl SolverProvider {
    pub fn new(name: impl Into<String>, endpoint: impl Into<String>) -> Result<Self, ProviderError> {
        Ok(Self {
            name: name.into(),
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            client: http_client()?,
        })
    }

    fn command(request: &RequestDescriptor) -> Result<&'static str, ProviderError> {
        match request.method().to_ascii_uppercase().as_str() {
            "GET" => Ok("request.get"),
            "POST" => Ok("request.post"),
            other => Err(ProviderError::Unsupported(format!(
                "solver cannot issue {other} requests"
            ))),
        }
    }
}

#[async_trait]
impl Provider for SolverProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn fetch(
        &self,
        request: &RequestDescriptor,
        timeout: Duration,
    ) -> Result<ProviderResponse, ProviderError> {
        let cmd = Self::command(request)?;
        let mut body = json!({
            "cmd": cmd,
            "url": request.url(),
            "maxTimeout": timeout.as_millis() as u64,
        });
        if cmd == "request.post" {
            body["postData"] = json!(String::from_utf8_lossy(request.body()));
        }

        let response = self
            .client
            .post(format!("{}/v1", self.endpoint))
            .timeout(timeout + TRANSPORT_SLACK)
            .json(&body)
            .send()
            .await
            .map_err(|e| ProviderError::from_reqwest(e, timeout))?;

        if !response.status().is_success() {
            return Err(ProviderError::HttpStatus {
                status: response.status().as_u16(),
            });
        }

        let reply: SolverReply = response
            .json()
            .await
            .map_err(|e| ProviderError::InvalidResponse(e.to_string()))?;
        if reply.status != "ok" {
            return Err(ProviderError::InvalidResponse(format!(
                "solver status '{}': {}",
                reply.status, reply.message
            )));
        }
        let solution = reply
            .solution
            .ok_or_else(|| ProviderError::InvalidResponse("missing solution".into()))?;

        debug!(provider = %self.name, status = solution.status, "solver returned");
        Ok(ProviderResponse {
            status_code: solution.status,
            content: solution.response,
            headers: solution
                .headers
                .into_iter()
                .map(|(k, v)| (k.to_ascii_lowercase(), v))
                .collect(),
            cookies: solution
                .cookies
                .into_iter()
                .map(|c| Cookie {
                    name: c.name,
                    value: c.value,
                    domain: c.domain,
                })
                .collect(),
            reported_cost: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_maps_solution() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1"))
            .and(body_partial_json(json!({
                "cmd": "request.get",
                "url": "https://example.com/",
                "maxTimeout": 1000
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "status": "ok",
                "message": "Challenge solved!",
                "solution": {
                    "url": "https://example.com/",
                    "status": 200,
                    "headers": {"Content-Type": "text/html"},
                    "response": "<html>ok</html>",
                    "cookies": [{"name": "cf_clearance", "value": "x", "domain": ".example.com"}],
                    "userAgent": "Mozilla/5.0"
                }
            })))
            .expect(1)
            .mount(&server)
            .await;

        let provider = SolverProvider::new("solver", server.uri()).unwrap();
        let resp = provider
            .fetch(
                &RequestDescriptor::get("https://example.com/"),
                Duration::from_millis(1000),
            )
            .await
            .unwrap();
        assert_eq!(resp.status_code, 200);
        assert_eq!(resp.content, "<html>ok</html>");
        assert_eq!(resp.headers.get("content-type").map(String::as_str), Some("text/html"));
        assert_eq!(resp.cookies[0].name, "cf_clearance");
        assert!(resp.reported_cost.is_none());
    }

    #[tokio::test]
    async fn test_solver_error_status() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "status": "error",
                "message": "Challenge not solved"
            })))
            .mount(&server)
            .await;

        let provider = SolverProvider::new("solver", server.uri()).unwrap();
        let err = provider
            .fetch(&RequestDescriptor::get("https://x.test"), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::InvalidResponse(ref m) if m.contains("not solved")));
    }

    #[tokio::test]
    async fn test_api_failure_is_http_status() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;
        let provider = SolverProvider::new("solver", server.uri()).unwrap();
        let err = provider
            .fetch(&RequestDescriptor::get("https://x.test"), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert_eq!(err, ProviderError::HttpStatus { status: 500 });
    }

    #[tokio::test]
    async fn test_rejects_unsupported_method() {
        let provider = SolverProvider::new("solver", "http://127.0.0.1:9").unwrap();
        let err = provider
            .fetch(
                &RequestDescriptor::new("DELETE", "https://x.test"),
                Duration::from_secs(1),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::Unsupported(_)));
    }
}
