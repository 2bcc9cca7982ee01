//! Engine configuration.
//!
//! One immutable [`CascadeConfig`] is validated once when the engine is
//! built. Every field has a documented default so a TOML file only needs
//! to list providers.
//!
//! ```toml
//! [[providers]]
//! name = "solver"
//! priority = 1
//! cost = 0.0
//!
//! [[providers]]
//! name = "premium"
//! priority = 2
//! cost = { credits = 25, usd_per_credit = 0.001 }
//! timeout_ms = 60000
//!
//! [budget]
//! monthly_limit = 100.0
//! ```

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use crate::error::ConfigError;

/// Advertised price of one request.
///
/// Everything is converted to USD at load time. Credit-priced services state
/// their own conversion factor, e.g. 1 credit = $0.001.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CostSpec {
    /// Plain USD amount.
    Flat(f64),
    /// `{ credits = 25, usd_per_credit = 0.001 }`
    Credits { credits: f64, usd_per_credit: f64 },
    /// `{ usd = 0.025 }`
    Usd { usd: f64 },
}

impl CostSpec {
    pub fn usd(&self) -> f64 {
        match *self {
            Self::Flat(usd) | Self::Usd { usd } => usd,
            Self::Credits {
                credits,
                usd_per_credit,
            } => credits * usd_per_credit,
        }
    }

    /// USD per advertised unit (1.0 for USD-priced providers).
    pub fn conversion_factor(&self) -> f64 {
        match *self {
            Self::Credits { usd_per_credit, .. } => usd_per_credit,
            _ => 1.0,
        }
    }
}

impl Default for CostSpec {
    fn default() -> Self {
        Self::Flat(0.0)
    }
}

fn default_true() -> bool {
    true
}

fn default_timeout_ms() -> u64 {
    30_000
}

/// Static settings for one provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderSettings {
    pub name: String,
    /// Lower runs earlier.
    pub priority: i32,
    #[serde(default)]
    pub cost: CostSpec,
    /// Ceiling on what a single request may be charged. Defaults to `cost`.
    #[serde(default)]
    pub max_cost: Option<f64>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Extra attempts on this provider before the cascade moves on.
    #[serde(default)]
    pub max_retries: u32,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

impl ProviderSettings {
    pub fn new(name: impl Into<String>, priority: i32, cost_usd: f64) -> Self {
        Self {
            name: name.into(),
            priority,
            cost: CostSpec::Flat(cost_usd),
            max_cost: None,
            enabled: true,
            max_retries: 0,
            timeout_ms: default_timeout_ms(),
        }
    }

    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    pub fn with_timeout_ms(mut self, ms: u64) -> Self {
        self.timeout_ms = ms;
        self
    }

    pub fn with_max_cost(mut self, usd: f64) -> Self {
        self.max_cost = Some(usd);
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    pub fn cost_usd(&self) -> f64 {
        self.cost.usd()
    }

    pub fn max_cost_usd(&self) -> f64 {
        self.max_cost.unwrap_or_else(|| self.cost_usd())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// What to do with an entry older than `max_age_ms` but younger than `ttl_ms`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StalePolicy {
    ServeStale,
    ServeStaleAndRevalidate,
    Refetch,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub max_entries: usize,
    pub ttl_ms: u64,
    /// Age after which an entry is stale (must be <= `ttl_ms`).
    pub max_age_ms: u64,
    pub stale_policy: StalePolicy,
    /// Headers that participate in the cache key.
    pub allowed_headers: Vec<String>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: 1_000,
            ttl_ms: 3_600_000,
            max_age_ms: 1_800_000,
            stale_policy: StalePolicy::ServeStaleAndRevalidate,
            allowed_headers: [
                "authorization",
                "content-type",
                "accept",
                "user-agent",
                "referer",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DedupConfig {
    /// Nominal coalescing span. Running executions accept joiners until they
    /// settle; joins past this span are logged.
    pub window_ms: u64,
    /// How long a settled outcome keeps serving late arrivals.
    pub grace_ms: u64,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            window_ms: 5_000,
            grace_ms: 100,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub tokens_per_interval: u32,
    pub interval_ms: u64,
    pub max_burst: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            tokens_per_interval: 10,
            interval_ms: 1_000,
            max_burst: 20,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BudgetConfig {
    pub hourly_limit: f64,
    pub daily_limit: f64,
    pub monthly_limit: f64,
    /// Percent-of-limit alert points, each fired once per window.
    pub alert_thresholds: Vec<u32>,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            hourly_limit: 5.0,
            daily_limit: 50.0,
            monthly_limit: 500.0,
            alert_thresholds: vec![50, 75, 90, 100],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitConfig {
    /// EMA smoothing factor for success rate and latency.
    pub ema_alpha: f64,
    /// A provider cools down while its success EMA is below `1 - threshold`.
    pub circuit_breaker_threshold: f64,
    /// Consecutive failures before a provider is blacklisted.
    pub blacklist_after_failures: u32,
    pub cooling_ms: u64,
    pub blacklist_cooldown_ms: u64,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            ema_alpha: 0.1,
            circuit_breaker_threshold: 0.5,
            blacklist_after_failures: 5,
            cooling_ms: 60_000,
            blacklist_cooldown_ms: 300_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Pause before moving to the next provider.
    pub inter_provider_delay_ms: u64,
    pub retry_backoff_ms: u64,
    pub retry_backoff_multiplier: f64,
    pub max_retry_backoff_ms: u64,
}

impl SchedulerConfig {
    /// Pause before retry number `retry` (1-based) on the same provider,
    /// growing by `retry_backoff_multiplier` and capped at `max_retry_backoff_ms`.
    pub fn retry_backoff(&self, retry: u32) -> Duration {
        let exponent = i32::try_from(retry.saturating_sub(1)).unwrap_or(i32::MAX);
        let ms = self.retry_backoff_ms as f64 * self.retry_backoff_multiplier.powi(exponent);
        Duration::from_millis((ms as u64).min(self.max_retry_backoff_ms))
    }

    pub fn inter_provider_delay(&self) -> Duration {
        Duration::from_millis(self.inter_provider_delay_ms)
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            inter_provider_delay_ms: 100,
            retry_backoff_ms: 250,
            retry_backoff_multiplier: 2.0,
            max_retry_backoff_ms: 2_000,
        }
    }
}

/// Top-level engine configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CascadeConfig {
    pub providers: Vec<ProviderSettings>,
    pub cache: CacheConfig,
    pub dedup: DedupConfig,
    pub rate_limit: RateLimitConfig,
    pub budget: BudgetConfig,
    pub circuit: CircuitConfig,
    pub cascade: SchedulerConfig,
}

fn invalid(msg: impl Into<String>) -> ConfigError {
    ConfigError::Invalid(msg.into())
}

fn positive_limit(name: &str, value: f64) -> Result<(), ConfigError> {
    if value.is_finite() && value > 0.0 {
        Ok(())
    } else {
        Err(invalid(format!("{name} must be a positive amount, got {value}")))
    }
}

impl CascadeConfig {
    /// Parse and validate a TOML document.
    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a TOML file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_toml_str(&raw)
    }

    pub fn with_provider(mut self, provider: ProviderSettings) -> Self {
        self.providers.push(provider);
        self
    }

    /// Enabled providers in declaration order.
    pub fn enabled_providers(&self) -> impl Iterator<Item = &ProviderSettings> {
        self.providers.iter().filter(|p| p.enabled)
    }

    /// Reject invalid combinations before anything is built.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let cache = &self.cache;
        if cache.max_entries == 0 {
            return Err(invalid("cache.max_entries must be at least 1"));
        }
        if cache.ttl_ms == 0 {
            return Err(invalid("cache.ttl_ms must be greater than zero"));
        }
        if cache.max_age_ms > cache.ttl_ms {
            return Err(invalid(format!(
                "cache.max_age_ms ({}) must not exceed cache.ttl_ms ({})",
                cache.max_age_ms, cache.ttl_ms
            )));
        }

        if self.dedup.grace_ms > self.dedup.window_ms {
            return Err(invalid(format!(
                "dedup.grace_ms ({}) must not exceed dedup.window_ms ({})",
                self.dedup.grace_ms, self.dedup.window_ms
            )));
        }

        let rl = &self.rate_limit;
        if rl.tokens_per_interval == 0 || rl.interval_ms == 0 || rl.max_burst == 0 {
            return Err(invalid(
                "rate_limit.tokens_per_interval, interval_ms and max_burst must be non-zero",
            ));
        }

        let budget = &self.budget;
        positive_limit("budget.hourly_limit", budget.hourly_limit)?;
        positive_limit("budget.daily_limit", budget.daily_limit)?;
        positive_limit("budget.monthly_limit", budget.monthly_limit)?;
        if let Some(bad) = budget
            .alert_thresholds
            .iter()
            .find(|&&pct| pct == 0 || pct > 100)
        {
            return Err(invalid(format!(
                "budget.alert_thresholds entries must be in 1..=100, got {bad}"
            )));
        }

        let circuit = &self.circuit;
        if !(circuit.ema_alpha > 0.0 && circuit.ema_alpha <= 1.0) {
            return Err(invalid(format!(
                "circuit.ema_alpha must be in (0, 1], got {}",
                circuit.ema_alpha
            )));
        }
        if !(0.0..=1.0).contains(&circuit.circuit_breaker_threshold) {
            return Err(invalid(format!(
                "circuit.circuit_breaker_threshold must be in [0, 1], got {}",
                circuit.circuit_breaker_threshold
            )));
        }
        if circuit.blacklist_after_failures == 0 {
            return Err(invalid("circuit.blacklist_after_failures must be at least 1"));
        }

        let sched = &self.cascade;
        if !(sched.retry_backoff_multiplier.is_finite() && sched.retry_backoff_multiplier >= 1.0) {
            return Err(invalid("cascade.retry_backoff_multiplier must be >= 1.0"));
        }

        let mut seen = HashSet::new();
        for p in &self.providers {
            if p.name.trim().is_empty() {
                return Err(invalid("provider name must not be empty"));
            }
            if !seen.insert(p.name.as_str()) {
                return Err(invalid(format!("duplicate provider name '{}'", p.name)));
            }
            let cost = p.cost_usd();
            if !cost.is_finite() || cost < 0.0 || p.cost.conversion_factor() < 0.0 {
                return Err(invalid(format!(
                    "provider '{}' has an invalid cost ({cost})",
                    p.name
                )));
            }
            if p.max_cost_usd() < cost {
                return Err(invalid(format!(
                    "provider '{}' max_cost ({}) is below its cost ({cost})",
                    p.name,
                    p.max_cost_usd()
                )));
            }
            if p.timeout_ms == 0 {
                return Err(invalid(format!("provider '{}' timeout_ms must be > 0", p.name)));
            }
        }
        if self.enabled_providers().next().is_none() {
            return Err(invalid("at least one enabled provider is required"));
        }
        Ok(())
    }
}
