//! Host configuration: engine settings plus how to reach each provider.
//!
//! One TOML file carries both. Engine sections (`[[providers]]`, `[cache]`,
//! `[budget]`, ...) go to [`CascadeConfig`]; `[[endpoints]]` tells the host
//! which adapter to build for each provider. Secrets never live in the file:
//! an endpoint names the environment variable holding its API key.
//!
//! ```toml
//! [[endpoints]]
//! provider = "solver"
//! kind = "solver"
//! url = "http://localhost:8191"
//!
//! [[endpoints]]
//! provider = "premium"
//! kind = "proxy_api"
//! url = "https://app.scrapingbee.com/api/v1/"
//! api_key_env = "SCRAPINGBEE_API_KEY"
//! render_js = true
//! cost_header = "spb-cost"
//! ```

use anyhow::{bail, Context, Result};
use cascade_engine::{CascadeConfig, ProxyApiProvider, SharedProvider, SolverProvider};
use serde::Deserialize;
use std::path::Path;
use std::sync::Arc;

/// Environment variable consulted when `--config` is absent.
pub const CONFIG_ENV: &str = "CASCADE_CONFIG";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndpointKind {
    Solver,
    ProxyApi,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EndpointConfig {
    pub provider: String,
    pub kind: EndpointKind,
    pub url: String,
    #[serde(default)]
    pub api_key_env: Option<String>,
    #[serde(default)]
    pub render_js: bool,
    /// Response header reporting credits consumed.
    #[serde(default)]
    pub cost_header: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct EndpointsSection {
    #[serde(default)]
    endpoints: Vec<EndpointConfig>,
}

#[derive(Debug, Clone)]
pub struct HostConfig {
    pub engine: CascadeConfig,
    pub endpoints: Vec<EndpointConfig>,
}

impl HostConfig {
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let engine = CascadeConfig::from_toml_str(raw)?;
        let section: EndpointsSection =
            toml::from_str(raw).context("failed to parse [[endpoints]]")?;
        let config = Self {
            engine,
            endpoints: section.endpoints,
        };
        config.check_endpoints()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        Self::from_toml_str(&raw).with_context(|| format!("invalid config file {}", path.display()))
    }

    /// Every enabled provider has exactly one endpoint.
    fn check_endpoints(&self) -> Result<()> {
        for provider in self.engine.enabled_providers() {
            let count = self
                .endpoints
                .iter()
                .filter(|e| e.provider == provider.name)
                .count();
            match count {
                0 => bail!("provider '{}' has no [[endpoints]] entry", provider.name),
                1 => {}
                _ => bail!("provider '{}' has more than one endpoint", provider.name),
            }
        }
        Ok(())
    }

    /// Build adapters for the enabled providers, reading API keys from the environment.
    pub fn build_adapters(&self) -> Result<Vec<SharedProvider>> {
        let mut adapters: Vec<SharedProvider> = Vec::new();
        for settings in self.engine.enabled_providers() {
            let Some(endpoint) = self.endpoints.iter().find(|e| e.provider == settings.name) else {
                bail!("provider '{}' has no endpoint", settings.name);
            };
            let adapter: SharedProvider = match endpoint.kind {
                EndpointKind::Solver => Arc::new(SolverProvider::new(&settings.name, &endpoint.url)?),
                EndpointKind::ProxyApi => {
                    let var = endpoint.api_key_env.as_deref().with_context(|| {
                        format!("proxy_api endpoint '{}' needs api_key_env", settings.name)
                    })?;
                    let key = std::env::var(var)
                        .with_context(|| format!("environment variable {var} is not set"))?;
                    let mut provider = ProxyApiProvider::new(&settings.name, &endpoint.url, key)?
                        .with_render_js(endpoint.render_js);
                    if let Some(header) = &endpoint.cost_header {
                        provider = provider.with_cost_header(header, settings.cost.conversion_factor());
                    }
                    Arc::new(provider)
                }
            };
            adapters.push(adapter);
        }
        Ok(adapters)
    }
}
