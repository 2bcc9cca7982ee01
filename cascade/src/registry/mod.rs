//! Provider registry: static settings plus live reliability statistics.
//!
//! Each provider's statistics sit behind their own lock so concurrent
//! outcomes for the same provider never lose an update, while outcomes for
//! different providers do not contend.

pub mod circuit_breaker;

pub use circuit_breaker::{CircuitBreaker, ProviderState, Transition};

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::{debug, info, warn};

use crate::budget::{BudgetExceeded, BudgetGovernor};
use crate::clock::SharedClock;
use crate::config::{CascadeConfig, ProviderSettings};
use crate::error::CascadeError;
use crate::events::{CascadeEvent, SharedEventSink};
use crate::sync::lock;
use crate::types::FetchOptions;

/// Live reliability statistics for one provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderStats {
    pub name: String,
    pub success_rate_ema: f64,
    pub avg_latency_ms: f64,
    pub consecutive_failures: u32,
    pub state: ProviderState,
    pub cooldown_until_ms: Option<u64>,
    pub attempts: u64,
    pub successes: u64,
    pub failures: u64,
    /// Realized USD charged by this provider.
    pub spend: f64,
}

impl ProviderStats {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            success_rate_ema: 1.0,
            avg_latency_ms: 0.0,
            consecutive_failures: 0,
            state: ProviderState::Active,
            cooldown_until_ms: None,
            attempts: 0,
            successes: 0,
            failures: 0,
            spend: 0.0,
        }
    }
}

/// Settings and statistics for one registered provider.
#[derive(Debug)]
pub struct ProviderProfile {
    pub settings: ProviderSettings,
    stats: Mutex<ProviderStats>,
}

impl ProviderProfile {
    fn new(settings: ProviderSettings) -> Self {
        let stats = ProviderStats::new(settings.name.clone());
        Self {
            settings,
            stats: Mutex::new(stats),
        }
    }

    pub fn stats(&self) -> ProviderStats {
        lock(&self.stats).clone()
    }
}

/// Why a provider was left out of an attempt order.
#[derive(Debug, Default)]
struct Exclusions {
    circuit_open: usize,
    over_max_cost: usize,
    budget: Option<BudgetExceeded>,
}

pub struct ProviderRegistry {
    /// Declaration order; ties in ordering keep it.
    profiles: Vec<ProviderProfile>,
    index: HashMap<String, usize>,
    breaker: CircuitBreaker,
    clock: SharedClock,
    events: SharedEventSink,
}

impl ProviderRegistry {
    /// Register every enabled provider from `config`.
    pub fn new(config: &CascadeConfig, clock: SharedClock, events: SharedEventSink) -> Self {
        let profiles: Vec<ProviderProfile> = config
            .enabled_providers()
            .cloned()
            .map(ProviderProfile::new)
            .collect();
        let index = profiles
            .iter()
            .enumerate()
            .map(|(i, p)| (p.settings.name.clone(), i))
            .collect();
        Self {
            profiles,
            index,
            breaker: CircuitBreaker::new(&config.circuit),
            clock,
            events,
        }
    }

    pub fn get(&self, name: &str) -> Option<&ProviderProfile> {
        self.index.get(name).map(|&i| &self.profiles[i])
    }

    pub fn profiles(&self) -> &[ProviderProfile] {
        &self.profiles
    }

    pub fn len(&self) -> usize {
        self.profiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.profiles.is_empty()
    }

    /// Current state, after applying any elapsed cooldown.
    pub fn state(&self, name: &str) -> Option<ProviderState> {
        let profile = self.get(name)?;
        let now = self.clock.now_ms();
        let (state, transition) = {
            let mut stats = lock(&profile.stats);
            let t = self.breaker.tick(&mut stats, now);
            (stats.state, t.map(|t| (t, stats.clone())))
        };
        if let Some((t, stats)) = transition {
            self.announce(&stats, t, now);
        }
        Some(state)
    }

    pub fn stats(&self, name: &str) -> Option<ProviderStats> {
        self.get(name).map(ProviderProfile::stats)
    }

    pub fn all_stats(&self) -> Vec<ProviderStats> {
        self.profiles.iter().map(ProviderProfile::stats).collect()
    }

    /// Fold one attempt outcome into the provider's statistics.
    ///
    /// Returns the state after the update, or `None` for an unknown provider.
    pub fn record_outcome(
        &self,
        name: &str,
        success: bool,
        latency_ms: u64,
        cost: f64,
    ) -> Option<ProviderState> {
        let profile = self.get(name)?;
        let now = self.clock.now_ms();
        let (state, transition) = {
            let mut stats = lock(&profile.stats);
            if success {
                stats.spend += cost;
            }
            let t = self.breaker.record(&mut stats, success, latency_ms, now);
            (stats.state, t.map(|t| (t, stats.clone())))
        };
        if let Some((t, stats)) = transition {
            self.announce(&stats, t, now);
        }
        Some(state)
    }

    /// Apply elapsed cooldowns to every provider. Returns how many closed.
    pub fn refresh(&self, now_ms: u64) -> usize {
        let mut closed = 0;
        for profile in &self.profiles {
            let transition = {
                let mut stats = lock(&profile.stats);
                self.breaker
                    .tick(&mut stats, now_ms)
                    .map(|t| (t, stats.clone()))
            };
            if let Some((t, stats)) = transition {
                closed += 1;
                self.announce(&stats, t, now_ms);
            }
        }
        closed
    }

    /// Ordered providers to attempt for one request.
    ///
    /// Open circuits, providers above the caller's `max_cost` and providers
    /// the budget cannot cover are dropped; the rest are sorted by
    /// `(priority, cost)` with declaration order breaking ties. When nothing
    /// remains and the budget was the reason for at least one exclusion, the
    /// result is `BudgetExceeded`; otherwise `ProviderUnavailable`.
    pub fn compute_order(
        &self,
        options: &FetchOptions,
        budget: &BudgetGovernor,
    ) -> Result<Vec<ProviderSettings>, CascadeError> {
        self.refresh(self.clock.now_ms());

        if let Some(name) = options.force_provider.as_deref() {
            return self.forced(name, options, budget);
        }

        let mut excluded = Exclusions::default();
        let mut order: Vec<&ProviderSettings> = Vec::with_capacity(self.profiles.len());
        for profile in &self.profiles {
            let settings = &profile.settings;
            if lock(&profile.stats).state.is_open() {
                excluded.circuit_open += 1;
                continue;
            }
            if exceeds_max_cost(settings, options) {
                excluded.over_max_cost += 1;
                continue;
            }
            if let Err(breach) = budget.can_afford(settings.max_cost_usd()) {
                excluded.budget.get_or_insert(breach);
                continue;
            }
            order.push(settings);
        }

        // Stable: equal keys keep declaration order.
        order.sort_by(|a, b| {
            a.priority
                .cmp(&b.priority)
                .then_with(|| a.cost_usd().total_cmp(&b.cost_usd()))
        });

        if let Some(hint) = options.priority_hint.as_deref() {
            if let Some(pos) = order.iter().position(|s| s.name == hint) {
                let hinted = order.remove(pos);
                order.insert(0, hinted);
            }
        }

        if order.is_empty() {
            if let Some(breach) = excluded.budget {
                return Err(self.budget_blocked(breach));
            }
            let reason = format!(
                "{} circuit-open, {} over max_cost",
                excluded.circuit_open, excluded.over_max_cost
            );
            warn!(%reason, "no eligible provider");
            return Err(CascadeError::ProviderUnavailable { reason });
        }

        debug!(
            order = ?order.iter().map(|s| s.name.as_str()).collect::<Vec<_>>(),
            "computed provider order"
        );
        Ok(order.into_iter().cloned().collect())
    }

    /// Operator override: a single provider regardless of its circuit state.
    fn forced(
        &self,
        name: &str,
        options: &FetchOptions,
        budget: &BudgetGovernor,
    ) -> Result<Vec<ProviderSettings>, CascadeError> {
        let profile = self
            .get(name)
            .ok_or_else(|| CascadeError::ProviderUnavailable {
                reason: format!("unknown or disabled provider '{name}'"),
            })?;
        let settings = &profile.settings;
        if exceeds_max_cost(settings, options) {
            return Err(CascadeError::ProviderUnavailable {
                reason: format!("provider '{name}' costs more than max_cost"),
            });
        }
        budget
            .can_afford(settings.max_cost_usd())
            .map_err(|breach| self.budget_blocked(breach))?;
        Ok(vec![settings.clone()])
    }

    fn budget_blocked(&self, breach: BudgetExceeded) -> CascadeError {
        warn!(
            window = %breach.window,
            spent = breach.spent,
            limit = breach.limit,
            requested = breach.requested,
            "every eligible provider blocked by budget"
        );
        self.events.emit(CascadeEvent::BudgetExceeded {
            window: breach.window,
            spent: breach.spent,
            limit: breach.limit,
            requested: breach.requested,
            timestamp_ms: self.clock.now_ms(),
        });
        CascadeError::BudgetExceeded {
            window: breach.window,
        }
    }

    /// Re-apply persisted statistics for providers that still exist.
    pub fn restore(&self, saved: &[ProviderStats]) -> usize {
        let mut restored = 0;
        for s in saved {
            if let Some(profile) = self.get(&s.name) {
                *lock(&profile.stats) = s.clone();
                restored += 1;
            }
        }
        // Cooldowns that expired while the process was down close now.
        self.refresh(self.clock.now_ms());
        restored
    }

    fn announce(&self, stats: &ProviderStats, transition: Transition, now_ms: u64) {
        let event = match transition {
            Transition::Opened { state, until_ms } => {
                warn!(
                    provider = %stats.name,
                    %state,
                    consecutive_failures = stats.consecutive_failures,
                    success_rate = stats.success_rate_ema,
                    until_ms,
                    "circuit opened"
                );
                CascadeEvent::CircuitOpened {
                    provider: stats.name.clone(),
                    state,
                    consecutive_failures: stats.consecutive_failures,
                    success_rate: stats.success_rate_ema,
                    until_ms,
                    timestamp_ms: now_ms,
                }
            }
            Transition::Closed => {
                info!(provider = %stats.name, "circuit closed");
                CascadeEvent::CircuitClosed {
                    provider: stats.name.clone(),
                    timestamp_ms: now_ms,
                }
            }
        };
        self.events.emit(event);
    }
}

fn exceeds_max_cost(settings: &ProviderSettings, options: &FetchOptions) -> bool {
    options
        .max_cost
        .is_some_and(|limit| settings.cost_usd() > limit)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};
    use crate::budget::WindowKind;
    use crate::config::BudgetConfig;
    use crate::events::{EventBus, NullSink};
    use std::sync::Arc;

    const T0: u64 = 1_773_570_600_000;

    struct Fixture {
        registry: ProviderRegistry,
        budget: BudgetGovernor,
        clock: Arc<ManualClock>,
    }

    fn fixture(providers: Vec<ProviderSettings>, budget: BudgetConfig) -> Fixture {
        let clock = Arc::new(ManualClock::new(T0));
        let mut config = CascadeConfig {
            budget,
            ..CascadeConfig::default()
        };
        config.providers = providers;
        Fixture {
            registry: ProviderRegistry::new(&config, clock.clone(), Arc::new(NullSink)),
            budget: BudgetGovernor::new(&config.budget, clock.clone(), Arc::new(NullSink)),
            clock,
        }
    }

    fn names(order: &[ProviderSettings]) -> Vec<&str> {
        order.iter().map(|s| s.name.as_str()).collect()
    }

    fn three() -> Vec<ProviderSettings> {
        vec![
            ProviderSettings::new("premium", 2, 0.05),
            ProviderSettings::new("solver", 1, 0.0),
            ProviderSettings::new("render", 2, 0.02),
        ]
    }

    #[test]
    fn test_orders_by_priority_then_cost() {
        let f = fixture(three(), BudgetConfig::default());
        let order = f
            .registry
            .compute_order(&FetchOptions::default(), &f.budget)
            .unwrap();
        assert_eq!(names(&order), vec!["solver", "render", "premium"]);
    }

    #[test]
    fn test_equal_keys_keep_declaration_order() {
        let f = fixture(
            vec![
                ProviderSettings::new("b", 1, 0.01),
                ProviderSettings::new("a", 1, 0.01),
                ProviderSettings::new("c", 1, 0.01),
            ],
            BudgetConfig::default(),
        );
        for _ in 0..5 {
            let order = f
                .registry
                .compute_order(&FetchOptions::default(), &f.budget)
                .unwrap();
            assert_eq!(names(&order), vec!["b", "a", "c"]);
        }
    }

    #[test]
    fn test_disabled_provider_not_registered() {
        let f = fixture(
            vec![
                ProviderSettings::new("on", 1, 0.0),
                ProviderSettings::new("off", 0, 0.0).disabled(),
            ],
            BudgetConfig::default(),
        );
        assert_eq!(f.registry.len(), 1);
        assert!(f.registry.get("off").is_none());
    }

    #[test]
    fn test_max_cost_filters() {
        let f = fixture(three(), BudgetConfig::default());
        let opts = FetchOptions::default().max_cost(0.03);
        let order = f.registry.compute_order(&opts, &f.budget).unwrap();
        assert_eq!(names(&order), vec!["solver", "render"]);
    }

    #[test]
    fn test_priority_hint_moves_to_front() {
        let f = fixture(three(), BudgetConfig::default());
        let opts = FetchOptions::default().priority_hint("premium");
        let order = f.registry.compute_order(&opts, &f.budget).unwrap();
        assert_eq!(names(&order), vec!["premium", "solver", "render"]);
    }

    #[test]
    fn test_blacklisted_excluded_then_recovers() {
        let f = fixture(three(), BudgetConfig::default());
        for _ in 0..5 {
            f.registry.record_outcome("solver", false, 10, 0.0);
        }
        assert_eq!(f.registry.state("solver"), Some(ProviderState::Blacklisted));
        let order = f
            .registry
            .compute_order(&FetchOptions::default(), &f.budget)
            .unwrap();
        assert_eq!(names(&order), vec!["render", "premium"]);

        f.clock.advance(300_000);
        let order = f
            .registry
            .compute_order(&FetchOptions::default(), &f.budget)
            .unwrap();
        assert_eq!(names(&order), vec!["solver", "render", "premium"]);
        assert_eq!(f.registry.stats("solver").unwrap().consecutive_failures, 0);
    }

    #[test]
    fn test_all_open_is_unavailable() {
        let f = fixture(vec![ProviderSettings::new("only", 1, 0.0)], BudgetConfig::default());
        for _ in 0..5 {
            f.registry.record_outcome("only", false, 10, 0.0);
        }
        let err = f
            .registry
            .compute_order(&FetchOptions::default(), &f.budget)
            .unwrap_err();
        assert!(matches!(err, CascadeError::ProviderUnavailable { .. }));
    }

    #[test]
    fn test_budget_exclusion_reports_window() {
        let budget = BudgetConfig {
            hourly_limit: 100.0,
            daily_limit: 100.0,
            monthly_limit: 10.0,
            ..BudgetConfig::default()
        };
        let f = fixture(vec![ProviderSettings::new("premium", 1, 0.05)], budget);
        f.budget.record_actual_cost(9.98);
        let err = f
            .registry
            .compute_order(&FetchOptions::default(), &f.budget)
            .unwrap_err();
        assert_eq!(
            err,
            CascadeError::BudgetExceeded {
                window: WindowKind::Monthly
            }
        );
    }

    #[test]
    fn test_free_provider_survives_exhausted_budget() {
        let budget = BudgetConfig {
            monthly_limit: 10.0,
            hourly_limit: 100.0,
            daily_limit: 100.0,
            ..BudgetConfig::default()
        };
        let f = fixture(three(), budget);
        f.budget.record_actual_cost(10.0);
        let order = f
            .registry
            .compute_order(&FetchOptions::default(), &f.budget)
            .unwrap();
        assert_eq!(names(&order), vec!["solver"]);
    }

    #[test]
    fn test_force_bypasses_circuit_not_budget() {
        let f = fixture(three(), BudgetConfig::default());
        for _ in 0..5 {
            f.registry.record_outcome("premium", false, 10, 0.0);
        }
        let opts = FetchOptions::default().force_provider("premium");
        let order = f.registry.compute_order(&opts, &f.budget).unwrap();
        assert_eq!(names(&order), vec!["premium"]);

        let unknown = FetchOptions::default().force_provider("nope");
        assert!(matches!(
            f.registry.compute_order(&unknown, &f.budget),
            Err(CascadeError::ProviderUnavailable { .. })
        ));

        let capped = FetchOptions::default()
            .force_provider("premium")
            .max_cost(0.01);
        assert!(f.registry.compute_order(&capped, &f.budget).is_err());
    }

    #[test]
    fn test_concurrent_outcomes_are_not_lost() {
        let f = fixture(three(), BudgetConfig::default());
        let registry = Arc::new(f.registry);
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let registry = registry.clone();
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        registry.record_outcome("render", i % 2 == 0, 5, 0.02);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        let stats = registry.stats("render").unwrap();
        assert_eq!(stats.attempts, 800);
        assert_eq!(stats.successes + stats.failures, 800);
    }

    #[test]
    fn test_circuit_events_emitted() {
        let clock = Arc::new(ManualClock::new(T0));
        let bus = EventBus::new().shared();
        let mut rx = bus.subscribe();
        let config = CascadeConfig::default().with_provider(ProviderSettings::new("s", 1, 0.0));
        let registry = ProviderRegistry::new(&config, clock.clone(), bus.clone());
        for _ in 0..5 {
            registry.record_outcome("s", false, 1, 0.0);
        }
        clock.advance(300_000);
        assert_eq!(registry.refresh(clock.now_ms()), 1);

        let kinds: Vec<&str> = std::iter::from_fn(|| rx.try_recv().ok())
            .map(|e| e.event_type())
            .collect();
        assert_eq!(kinds, vec!["circuit_opened", "circuit_closed"]);
    }

    #[test]
    fn test_restore_skips_unknown_providers() {
        let f = fixture(three(), BudgetConfig::default());
        let mut solver = ProviderStats::new("solver");
        solver.attempts = 7;
        let ghost = ProviderStats::new("ghost");
        assert_eq!(f.registry.restore(&[solver, ghost]), 1);
        assert_eq!(f.registry.stats("solver").unwrap().attempts, 7);
    }

}
