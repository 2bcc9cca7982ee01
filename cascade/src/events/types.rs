//! Events published by the engine.
//!
//! Dashboards and log shippers subscribe to these; nothing in the engine
//! reads them back.

use serde::{Deserialize, Serialize};

use crate::budget::WindowKind;
use crate::registry::ProviderState;

/// Why a cache entry left the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvictReason {
    /// Dropped as least recently used to stay under `max_entries`.
    Capacity,
    /// Past its TTL.
    Expired,
}

/// All engine events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CascadeEvent {
    /// A cached result was served.
    CacheHit {
        cache_key: String,
        stale: bool,
        /// Cost the original fetch paid, avoided this time.
        saved_cost: f64,
        timestamp_ms: u64,
    },

    CacheMiss {
        cache_key: String,
        timestamp_ms: u64,
    },

    /// An entry was removed. Independent of hit/miss accounting.
    CacheEvict {
        cache_key: String,
        reason: EvictReason,
        timestamp_ms: u64,
    },

    /// A caller joined an in-flight execution instead of starting one.
    RequestDeduped {
        dedup_key: String,
        joiners: u32,
        timestamp_ms: u64,
    },

    ProviderAttempt {
        provider: String,
        url: String,
        /// Zero-based attempt index within the cascade.
        attempt: u32,
        timestamp_ms: u64,
    },

    ProviderSuccess {
        provider: String,
        status_code: u16,
        cost: f64,
        latency_ms: u64,
        timestamp_ms: u64,
    },

    ProviderFailure {
        provider: String,
        status_code: Option<u16>,
        error: String,
        latency_ms: u64,
        timestamp_ms: u64,
    },

    /// Spend crossed an alert threshold for the first time in this window.
    BudgetAlert {
        window: WindowKind,
        threshold_pct: u32,
        spent: f64,
        limit: f64,
        timestamp_ms: u64,
    },

    BudgetExceeded {
        window: WindowKind,
        spent: f64,
        limit: f64,
        requested: f64,
        timestamp_ms: u64,
    },

    RateLimited {
        retry_after_ms: u64,
        timestamp_ms: u64,
    },

    /// A provider left the Active state.
    CircuitOpened {
        provider: String,
        state: ProviderState,
        consecutive_failures: u32,
        success_rate: f64,
        until_ms: u64,
        timestamp_ms: u64,
    },

    /// A provider returned to Active after its cooldown.
    CircuitClosed {
        provider: String,
        timestamp_ms: u64,
    },
}

impl CascadeEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::CacheHit { .. } => "cache_hit",
            Self::CacheMiss { .. } => "cache_miss",
            Self::CacheEvict { .. } => "cache_evict",
            Self::RequestDeduped { .. } => "request_deduped",
            Self::ProviderAttempt { .. } => "provider_attempt",
            Self::ProviderSuccess { .. } => "provider_success",
            Self::ProviderFailure { .. } => "provider_failure",
            Self::BudgetAlert { .. } => "budget_alert",
            Self::BudgetExceeded { .. } => "budget_exceeded",
            Self::RateLimited { .. } => "rate_limited",
            Self::CircuitOpened { .. } => "circuit_opened",
            Self::CircuitClosed { .. } => "circuit_closed",
        }
    }

    pub fn timestamp_ms(&self) -> u64 {
        match self {
            Self::CacheHit { timestamp_ms, .. }
            | Self::CacheMiss { timestamp_ms, .. }
            | Self::CacheEvict { timestamp_ms, .. }
            | Self::RequestDeduped { timestamp_ms, .. }
            | Self::ProviderAttempt { timestamp_ms, .. }
            | Self::ProviderSuccess { timestamp_ms, .. }
            | Self::ProviderFailure { timestamp_ms, .. }
            | Self::BudgetAlert { timestamp_ms, .. }
            | Self::BudgetExceeded { timestamp_ms, .. }
            | Self::RateLimited { timestamp_ms, .. }
            | Self::CircuitOpened { timestamp_ms, .. }
            | Self::CircuitClosed { timestamp_ms, .. } => *timestamp_ms,
        }
    }

    /// Provider this event concerns, if any.
    pub fn provider(&self) -> Option<&str> {
        match self {
            Self::ProviderAttempt { provider, .. }
            | Self::ProviderSuccess { provider, .. }
            | Self::ProviderFailure { provider, .. }
            | Self::CircuitOpened { provider, .. }
            | Self::CircuitClosed { provider, .. } => Some(provider),
            _ => None,
        }
    }
}
