//! Per-provider circuit state machine.
//!
//! ```text
//!            success EMA < 1 - threshold
//!   Active ─────────────────────────────▶ Cooling ──┐
//!     ▲ ▲   consecutive failures >= N                │ cooling_ms elapsed
//!     │ └───────────────────────────────▶ Blacklisted│ (or a success)
//!     │                                      │       │
//!     └──────── cooldown elapsed ────────────┴───────┘
//! ```
//!
//! Returning to `Active` is optimistic: consecutive failures reset and the
//! success EMA is lifted to the admission floor, so the provider gets a real
//! retry instead of being re-opened by its own history.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::config::CircuitConfig;

use super::ProviderStats;

/// Circuit state for a single provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderState {
    /// Eligible for ordering.
    #[default]
    Active,
    /// Reliability EMA fell below the admission floor. Skipped until cooldown.
    Cooling,
    /// Too many consecutive failures. Skipped for the longer cooldown.
    Blacklisted,
}

impl ProviderState {
    pub fn is_open(self) -> bool {
        !matches!(self, Self::Active)
    }
}

impl fmt::Display for ProviderState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Active => write!(f, "active"),
            Self::Cooling => write!(f, "cooling"),
            Self::Blacklisted => write!(f, "blacklisted"),
        }
    }
}

/// State change produced by one update.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Transition {
    Opened {
        state: ProviderState,
        until_ms: u64,
    },
    Closed,
}

#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    alpha: f64,
    /// Success EMA below which a provider cools down.
    floor: f64,
    blacklist_after: u32,
    cooling_ms: u64,
    blacklist_cooldown_ms: u64,
}

impl CircuitBreaker {
    pub fn new(config: &CircuitConfig) -> Self {
        Self {
            alpha: config.ema_alpha,
            floor: 1.0 - config.circuit_breaker_threshold,
            blacklist_after: config.blacklist_after_failures,
            cooling_ms: config.cooling_ms,
            blacklist_cooldown_ms: config.blacklist_cooldown_ms,
        }
    }

    /// Minimum success EMA for an `Active` provider to stay admitted.
    pub fn floor(&self) -> f64 {
        self.floor
    }

    /// Fold one attempt outcome into `stats`.
    pub fn record(
        &self,
        stats: &mut ProviderStats,
        success: bool,
        latency_ms: u64,
        now_ms: u64,
    ) -> Option<Transition> {
        let outcome = if success { 1.0 } else { 0.0 };
        stats.success_rate_ema = self.alpha * outcome + (1.0 - self.alpha) * stats.success_rate_ema;
        stats.avg_latency_ms = if stats.attempts == 0 {
            latency_ms as f64
        } else {
            self.alpha * latency_ms as f64 + (1.0 - self.alpha) * stats.avg_latency_ms
        };
        stats.attempts += 1;

        if success {
            stats.successes += 1;
            stats.consecutive_failures = 0;
            if stats.state.is_open() {
                // Only reachable through a forced attempt; the provider works.
                self.close(stats);
                return Some(Transition::Closed);
            }
            return None;
        }

        stats.failures += 1;
        stats.consecutive_failures += 1;

        if stats.consecutive_failures >= self.blacklist_after {
            if stats.state == ProviderState::Blacklisted {
                return None;
            }
            return Some(self.open(stats, ProviderState::Blacklisted, now_ms));
        }
        if stats.success_rate_ema < self.floor && stats.state == ProviderState::Active {
            return Some(self.open(stats, ProviderState::Cooling, now_ms));
        }
        None
    }

    /// Return an open provider to `Active` once its cooldown has passed.
    pub fn tick(&self, stats: &mut ProviderStats, now_ms: u64) -> Option<Transition> {
        match stats.cooldown_until_ms {
            Some(until) if stats.state.is_open() && now_ms >= until => {
                self.close(stats);
                Some(Transition::Closed)
            }
            _ => None,
        }
    }

    fn open(&self, stats: &mut ProviderStats, state: ProviderState, now_ms: u64) -> Transition {
        let cooldown = match state {
            ProviderState::Blacklisted => self.blacklist_cooldown_ms,
            _ => self.cooling_ms,
        };
        let until_ms = now_ms.saturating_add(cooldown);
        stats.state = state;
        stats.cooldown_until_ms = Some(until_ms);
        Transition::Opened { state, until_ms }
    }

    fn close(&self, stats: &mut ProviderStats) {
        stats.state = ProviderState::Active;
        stats.cooldown_until_ms = None;
        stats.consecutive_failures = 0;
        stats.success_rate_ema = stats.success_rate_ema.max(self.floor);
    }
}
