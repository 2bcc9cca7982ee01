//! Periodic cleanup.
//!
//! Every request already checks TTLs, windows and cooldowns lazily for the
//! keys it touches, so nothing here is needed for correctness. The sweep
//! bounds memory for keys nobody asks about again and fires window resets
//! and circuit recoveries on time.

use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::budget::{BudgetGovernor, WindowKind};
use crate::cache::ResponseCache;
use crate::clock::SharedClock;
use crate::coalesce::InFlightCoalescer;
use crate::registry::ProviderRegistry;

/// What one sweep changed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub expired_cache_entries: usize,
    pub dedup_entries_removed: usize,
    pub windows_reset: Vec<WindowKind>,
    pub circuits_closed: usize,
}

impl SweepReport {
    pub fn is_empty(&self) -> bool {
        self.expired_cache_entries == 0
            && self.dedup_entries_removed == 0
            && self.windows_reset.is_empty()
            && self.circuits_closed == 0
    }
}

#[derive(Clone)]
pub struct Housekeeper {
    cache: Arc<ResponseCache>,
    coalescer: Arc<InFlightCoalescer>,
    budget: Arc<BudgetGovernor>,
    registry: Arc<ProviderRegistry>,
    clock: SharedClock,
}

impl Housekeeper {
    pub fn new(
        cache: Arc<ResponseCache>,
        coalescer: Arc<InFlightCoalescer>,
        budget: Arc<BudgetGovernor>,
        registry: Arc<ProviderRegistry>,
        clock: SharedClock,
    ) -> Self {
        Self {
            cache,
            coalescer,
            budget,
            registry,
            clock,
        }
    }

    /// One sweep as of `now_ms`. Running it twice for the same instant
    /// changes nothing the second time.
    pub fn run_once(&self, now_ms: u64) -> SweepReport {
        let report = SweepReport {
            expired_cache_entries: self.cache.sweep_expired(now_ms),
            dedup_entries_removed: self.coalescer.sweep(now_ms),
            windows_reset: self.budget.roll_windows(now_ms),
            circuits_closed: self.registry.refresh(now_ms),
        };
        if report.is_empty() {
            debug!("housekeeping sweep: nothing to do");
        } else {
            info!(
                expired_cache_entries = report.expired_cache_entries,
                dedup_entries_removed = report.dedup_entries_removed,
                windows_reset = ?report.windows_reset,
                circuits_closed = report.circuits_closed,
                "housekeeping sweep"
            );
        }
        report
    }

    /// Sweep every `period` until `cancel` fires.
    pub fn spawn(self, period: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!("housekeeper stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        self.run_once(self.clock.now_ms());
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::{CascadeConfig, ProviderSettings};
    use crate::events::NullSink;
    use crate::fingerprint::{CacheKey, Fingerprinter};
    use crate::types::{CascadeResult, RequestDescriptor};
    use std::collections::BTreeMap;

    const T0: u64 = 1_773_570_600_000;

    fn housekeeper(clock: Arc<ManualClock>) -> Housekeeper {
        let mut config = CascadeConfig::default().with_provider(ProviderSettings::new("s", 1, 0.0));
        config.cache.ttl_ms = 60_000;
        config.cache.max_age_ms = 30_000;
        Housekeeper::new(
            Arc::new(ResponseCache::new(&config.cache, clock.clone(), Arc::new(NullSink))),
            Arc::new(InFlightCoalescer::new(&config.dedup, clock.clone())),
            Arc::new(BudgetGovernor::new(&config.budget, clock.clone(), Arc::new(NullSink))),
            Arc::new(ProviderRegistry::new(&config, clock.clone(), Arc::new(NullSink))),
            clock,
        )
    }

    fn key(url: &str) -> CacheKey {
        Fingerprinter::default().cache_key(&RequestDescriptor::get(url))
    }

    fn payload() -> CascadeResult {
        CascadeResult {
            success: true,
            provider: "s".into(),
            url: "https://example.com".into(),
            status_code: 200,
            content: String::new(),
            headers: BTreeMap::new(),
            cookies: vec![],
            cost: 0.0,
            response_time_ms: 1,
            cached: false,
            deduped: false,
            attempts: vec![],
        }
    }

    #[test]
    fn test_sweep_is_idempotent() {
        let clock = Arc::new(ManualClock::new(T0));
        let hk = housekeeper(clock.clone());
        hk.cache.put(key("https://example.com/a"), payload(), 0.0);
        for _ in 0..5 {
            hk.registry.record_outcome("s", false, 1, 0.0);
        }

        let later = WindowKind::Hourly.bounds(T0).1 + 300_000;
        clock.set(later);
        let first = hk.run_once(later);
        assert_eq!(first.expired_cache_entries, 1);
        assert_eq!(first.windows_reset, vec![WindowKind::Hourly]);
        assert_eq!(first.circuits_closed, 1);

        let second = hk.run_once(later);
        assert!(second.is_empty());
        assert_eq!(hk.cache.len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_spawned_loop_stops_on_cancel() {
        let clock = Arc::new(ManualClock::new(T0));
        let hk = housekeeper(clock.clone());
        let cache = hk.cache.clone();
        cache.put(key("https://example.com/b"), payload(), 0.0);

        let cancel = CancellationToken::new();
        let handle = hk.spawn(Duration::from_secs(30), cancel.clone());
        clock.advance(61_000);
        tokio::time::sleep(Duration::from_secs(31)).await;
        assert_eq!(cache.len(), 0);

        cancel.cancel();
        handle.await.unwrap();
    }
}
