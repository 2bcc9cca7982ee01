//! Cost and effectiveness reporting.
//!
//! Counters are fed from two places: the event stream (cache activity,
//! joins, provider spend) and the per-caller outcome the engine hands back.
//! A [`MetricsSnapshot`] joins those with live budget and provider state.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Mutex;

use crate::budget::{BudgetGovernor, WindowKind};
use crate::clock::SharedClock;
use crate::error::{CascadeError, CascadeOutcome};
use crate::events::{CascadeEvent, EventSink};
use crate::registry::{ProviderRegistry, ProviderState};
use crate::sync::lock;

/// Trailing span used for spend projection.
pub const PROJECTION_WINDOW_MS: u64 = 5 * 60 * 1_000;

const HOUR_MS: u64 = 3_600_000;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Totals {
    pub requests: u64,
    pub successes: u64,
    pub cache_hits: u64,
    pub stale_hits: u64,
    pub cache_misses: u64,
    pub evictions: u64,
    pub deduped: u64,
    pub rate_limited: u64,
    pub budget_blocked: u64,
    pub unavailable: u64,
    pub exhausted: u64,
    pub interrupted: u64,
}

impl Totals {
    pub fn cache_hit_rate(&self) -> f64 {
        let lookups = self.cache_hits + self.cache_misses;
        if lookups == 0 {
            0.0
        } else {
            self.cache_hits as f64 / lookups as f64
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WindowSpend {
    pub window: WindowKind,
    pub spent: f64,
    pub limit: f64,
    pub utilization_pct: f64,
    pub reset_at_ms: u64,
}

/// Cost avoided by not calling a provider.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Savings {
    pub cache: f64,
    pub dedup: f64,
}

impl Savings {
    pub fn total(&self) -> f64 {
        self.cache + self.dedup
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderMetrics {
    pub name: String,
    pub attempts: u64,
    pub successes: u64,
    pub failures: u64,
    pub spend: f64,
    pub success_rate_ema: f64,
    pub avg_latency_ms: f64,
    pub state: ProviderState,
}

/// Spend rate over the trailing window, extrapolated linearly.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Projection {
    pub trailing_window_ms: u64,
    pub trailing_spend: f64,
    pub next_hour: f64,
    pub rest_of_day: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub generated_at_ms: u64,
    pub totals: Totals,
    pub spend: Vec<WindowSpend>,
    pub savings: Savings,
    pub providers: Vec<ProviderMetrics>,
    pub projection: Projection,
}

#[derive(Default)]
struct State {
    totals: Totals,
    savings: Savings,
    /// `(timestamp_ms, usd)` for recent provider charges.
    recent_spend: VecDeque<(u64, f64)>,
}

impl State {
    fn prune(&mut self, now_ms: u64) {
        let horizon = now_ms.saturating_sub(PROJECTION_WINDOW_MS);
        while self.recent_spend.front().is_some_and(|&(ts, _)| ts < horizon) {
            self.recent_spend.pop_front();
        }
    }
}

pub struct MetricsReporter {
    state: Mutex<State>,
    clock: SharedClock,
}

impl MetricsReporter {
    pub fn new(clock: SharedClock) -> Self {
        Self {
            state: Mutex::new(State::default()),
            clock,
        }
    }

    pub fn record_request(&self) {
        lock(&self.state).totals.requests += 1;
    }

    /// Count the outcome one caller received.
    pub fn record_outcome(&self, outcome: &CascadeOutcome) {
        let mut state = lock(&self.state);
        let totals = &mut state.totals;
        match outcome {
            Ok(_) => totals.successes += 1,
            Err(CascadeError::RateLimited { .. }) => totals.rate_limited += 1,
            Err(CascadeError::BudgetExceeded { .. }) => totals.budget_blocked += 1,
            Err(CascadeError::ProviderUnavailable { .. }) => totals.unavailable += 1,
            Err(CascadeError::CascadeExhausted { .. }) => totals.exhausted += 1,
            Err(CascadeError::Interrupted { .. }) => totals.interrupted += 1,
        }
    }

    /// A joiner received a result someone else paid `cost` for.
    pub fn record_dedup_saving(&self, cost: f64) {
        lock(&self.state).savings.dedup += cost;
    }

    pub fn totals(&self) -> Totals {
        lock(&self.state).totals.clone()
    }

    pub fn projection(&self) -> Projection {
        let now = self.clock.now_ms();
        let mut state = lock(&self.state);
        state.prune(now);
        let trailing_spend: f64 = state.recent_spend.iter().map(|&(_, usd)| usd).sum();
        let per_ms = trailing_spend / PROJECTION_WINDOW_MS as f64;
        let day_end = WindowKind::Daily.bounds(now).1;
        Projection {
            trailing_window_ms: PROJECTION_WINDOW_MS,
            trailing_spend,
            next_hour: per_ms * HOUR_MS as f64,
            rest_of_day: per_ms * day_end.saturating_sub(now) as f64,
        }
    }

    pub fn snapshot(&self, registry: &ProviderRegistry, budget: &BudgetGovernor) -> MetricsSnapshot {
        let projection = self.projection();
        let (totals, savings) = {
            let state = lock(&self.state);
            (state.totals.clone(), state.savings.clone())
        };
        let spend = budget
            .snapshot()
            .into_iter()
            .map(|w| WindowSpend {
                window: w.kind,
                spent: w.spent,
                limit: w.limit,
                utilization_pct: w.utilization_pct(),
                reset_at_ms: w.reset_at_ms,
            })
            .collect();
        let providers = registry
            .all_stats()
            .into_iter()
            .map(|s| ProviderMetrics {
                name: s.name,
                attempts: s.attempts,
                successes: s.successes,
                failures: s.failures,
                spend: s.spend,
                success_rate_ema: s.success_rate_ema,
                avg_latency_ms: s.avg_latency_ms,
                state: s.state,
            })
            .collect();
        MetricsSnapshot {
            generated_at_ms: self.clock.now_ms(),
            totals,
            spend,
            savings,
            providers,
            projection,
        }
    }
}

impl EventSink for MetricsReporter {
    fn emit(&self, event: CascadeEvent) {
        let mut state = lock(&self.state);
        match event {
            CascadeEvent::CacheHit {
                stale, saved_cost, ..
            } => {
                state.totals.cache_hits += 1;
                if stale {
                    state.totals.stale_hits += 1;
                }
                state.savings.cache += saved_cost;
            }
            CascadeEvent::CacheMiss { .. } => state.totals.cache_misses += 1,
            CascadeEvent::CacheEvict { .. } => state.totals.evictions += 1,
            CascadeEvent::RequestDeduped { .. } => state.totals.deduped += 1,
            CascadeEvent::ProviderSuccess {
                cost, timestamp_ms, ..
            } if cost > 0.0 => {
                state.recent_spend.push_back((timestamp_ms, cost));
                state.prune(timestamp_ms);
            }
            _ => {}
        }
    }
}
