//! Premium proxy / JS-rendering API adapter.
//!
//! `GET {endpoint}?api_key=..&url=..&render_js=..`. The service relays the
//! target's status, headers and body as its own response. When it reports
//! usage in a header, that number is credits and is converted to USD.

use async_trait::async_trait;
use reqwest::header::SET_COOKIE;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::debug;

use super::{http_client, parse_set_cookie, Provider, ProviderError, ProviderResponse};
use crate::types::RequestDescriptor;

pub struct ProxyApiProvider {
    name: String,
    endpoint: String,
    api_key: String,
    render_js: bool,
    /// Header carrying credits consumed, and USD per credit.
    cost_header: Option<(String, f64)>,
    client: reqwest::Client,
}

impl ProxyApiProvider {
    pub fn new(
        name: impl Into<String>,
        endpoint: impl Into<String>,
        api_key: impl Into<String>,
    ) -> Result<Self, ProviderError> {
        Ok(Self {
            name: name.into(),
            endpoint: endpoint.into(),
            api_key: api_key.into(),
            render_js: false,
            cost_header: None,
            client: http_client()?,
        })
    }

    pub fn with_render_js(mut self, render_js: bool) -> Self {
        self.render_js = render_js;
        self
    }

    pub fn with_cost_header(mut self, header: impl AsRef<str>, usd_per_credit: f64) -> Self {
        self.cost_header = Some((header.as_ref().to_ascii_lowercase(), usd_per_credit));
        self
    }

    fn reported_cost(&self, headers: &BTreeMap<String, String>) -> Option<f64> {
        let (header, usd_per_credit) = self.cost_header.as_ref()?;
        let credits: f64 = headers.get(header)?.trim().parse().ok()?;
        Some(credits * usd_per_credit)
    }
}

#[async_trait]
impl Provider for ProxyApiProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn fetch(
        &self,
        request: &RequestDescriptor,
        timeout: Duration,
    ) -> Result<ProviderResponse, ProviderError> {
        let method = reqwest::Method::from_bytes(request.method().to_ascii_uppercase().as_bytes())
            .map_err(|e| ProviderError::Unsupported(e.to_string()))?;
        let render_js = if self.render_js { "true" } else { "false" };

        let mut builder = self
            .client
            .request(method, &self.endpoint)
            .timeout(timeout)
            .query(&[
                ("api_key", self.api_key.as_str()),
                ("url", request.url()),
                ("render_js", render_js),
            ]);
        if !request.body().is_empty() {
            builder = builder.body(request.body().to_vec());
        }

        let response = builder
            .send()
            .await
            .map_err(|e| ProviderError::from_reqwest(e, timeout))?;

        let status_code = response.status().as_u16();
        let cookies = response
            .headers()
            .get_all(SET_COOKIE)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .filter_map(parse_set_cookie)
            .collect();
        let headers: BTreeMap<String, String> = response
            .headers()
            .iter()
            .filter(|(k, _)| **k != SET_COOKIE)
            .filter_map(|(k, v)| Some((k.as_str().to_string(), v.to_str().ok()?.to_string())))
            .collect();
        let content = response
            .text()
            .await
            .map_err(|e| ProviderError::from_reqwest(e, timeout))?;

        let reported_cost = self.reported_cost(&headers);
        debug!(provider = %self.name, status_code, ?reported_cost, "proxy api returned");
        Ok(ProviderResponse {
            status_code,
            content,
            headers,
            cookies,
            reported_cost,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_relays_target_response_and_cost() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v1"))
            .and(query_param("api_key", "secret"))
            .and(query_param("url", "https://example.com/page"))
            .and(query_param("render_js", "true"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("spb-cost", "25")
                    .insert_header("set-cookie", "session=abc; Path=/")
                    .set_body_string("<html>rendered</html>"),
            )
            .expect(1)
            .mount(&server)
            .await;

        let provider = ProxyApiProvider::new("premium", format!("{}/api/v1", server.uri()), "secret")
            .unwrap()
            .with_render_js(true)
            .with_cost_header("Spb-Cost", 0.001);
        let resp = provider
            .fetch(
                &RequestDescriptor::get("https://example.com/page"),
                Duration::from_secs(2),
            )
            .await
            .unwrap();
        assert_eq!(resp.status_code, 200);
        assert_eq!(resp.content, "<html>rendered</html>");
        assert!((resp.reported_cost.unwrap() - 0.025).abs() < 1e-12);
        assert_eq!(resp.cookies[0].name, "session");
        assert!(!resp.headers.contains_key("set-cookie"));
    }

    #[tokio::test]
    async fn test_non_success_is_relayed_not_raised() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(403).set_body_string("blocked"))
            .mount(&server)
            .await;
        let provider = ProxyApiProvider::new("premium", server.uri(), "k").unwrap();
        let resp = provider
            .fetch(&RequestDescriptor::get("https://x.test"), Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(resp.status_code, 403);
        assert!(!resp.is_success());
        assert!(resp.reported_cost.is_none());
    }

    #[tokio::test]
    async fn test_timeout_classified() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(500)))
            .mount(&server)
            .await;
        let provider = ProxyApiProvider::new("premium", server.uri(), "k").unwrap();
        let err = provider
            .fetch(&RequestDescriptor::get("https://x.test"), Duration::from_millis(50))
            .await
            .unwrap_err();
        assert_eq!(err, ProviderError::Timeout { after_ms: 50 });
    }
}
