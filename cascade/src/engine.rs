//! The fetch entry point.
//!
//! ```text
//! fetch ─▶ cache ─┬─ fresh/stale hit ─────────────────────────────▶ result
//!                 └─ miss ─▶ coalescer ─┬─ joined ─▶ wait ────────▶ result
//!                                       └─ leader ─▶ spawn ─┐
//!   rate limiter ─▶ registry order (budget, circuits) ─▶ scheduler ─▶ settle
//! ```
//!
//! The leader's cascade runs on its own task. Every caller, the leader's
//! included, waits on the same outcome, so dropping a caller's future never
//! cancels work other callers depend on.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::budget::BudgetGovernor;
use crate::cache::{CacheLookup, ResponseCache};
use crate::clock::{SharedClock, SystemClock};
use crate::coalesce::{Acquired, InFlightCoalescer, LeaderGuard};
use crate::config::{CascadeConfig, StalePolicy};
use crate::error::{CascadeError, CascadeOutcome, ConfigError};
use crate::events::{CascadeEvent, Fanout, NullSink, SharedEventSink};
use crate::fingerprint::{CacheKey, Fingerprinter};
use crate::housekeeping::Housekeeper;
use crate::metrics::{MetricsReporter, MetricsSnapshot};
use crate::persistence::{EngineSnapshot, RestoreReport};
use crate::providers::SharedProvider;
use crate::rate_limit::RateLimiter;
use crate::registry::ProviderRegistry;
use crate::scheduler::CascadeScheduler;
use crate::types::{FetchOptions, RequestDescriptor};

struct EngineInner {
    config: CascadeConfig,
    fingerprinter: Fingerprinter,
    cache: Arc<ResponseCache>,
    coalescer: Arc<InFlightCoalescer>,
    rate_limiter: RateLimiter,
    budget: Arc<BudgetGovernor>,
    registry: Arc<ProviderRegistry>,
    scheduler: CascadeScheduler,
    metrics: Arc<MetricsReporter>,
    clock: SharedClock,
    events: SharedEventSink,
}

/// Cascading fetch engine. Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct CascadeEngine {
    inner: Arc<EngineInner>,
}

/// Assembles a [`CascadeEngine`].
pub struct EngineBuilder {
    config: CascadeConfig,
    providers: Vec<SharedProvider>,
    clock: SharedClock,
    events: SharedEventSink,
}

impl EngineBuilder {
    pub fn provider(mut self, provider: SharedProvider) -> Self {
        self.providers.push(provider);
        self
    }

    pub fn providers(mut self, providers: impl IntoIterator<Item = SharedProvider>) -> Self {
        self.providers.extend(providers);
        self
    }

    pub fn clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    pub fn events(mut self, sink: SharedEventSink) -> Self {
        self.events = sink;
        self
    }

    pub fn build(self) -> Result<CascadeEngine, ConfigError> {
        CascadeEngine::new(self.config, self.providers, self.clock, self.events)
    }
}

impl CascadeEngine {
    pub fn builder(config: CascadeConfig) -> EngineBuilder {
        EngineBuilder {
            config,
            providers: Vec::new(),
            clock: Arc::new(SystemClock),
            events: Arc::new(NullSink),
        }
    }

    /// Validate `config` and wire every component.
    ///
    /// Each enabled provider needs an adapter whose `name()` matches.
    pub fn new(
        config: CascadeConfig,
        providers: Vec<SharedProvider>,
        clock: SharedClock,
        sink: SharedEventSink,
    ) -> Result<Self, ConfigError> {
        config.validate()?;

        let mut adapters: HashMap<String, SharedProvider> = HashMap::new();
        for provider in providers {
            let name = provider.name().to_string();
            if config.enabled_providers().all(|p| p.name != name) {
                warn!(provider = %name, "adapter has no enabled provider settings, ignoring");
                continue;
            }
            adapters.insert(name, provider);
        }
        if let Some(missing) = config
            .enabled_providers()
            .find(|p| !adapters.contains_key(&p.name))
        {
            return Err(ConfigError::Invalid(format!(
                "no adapter registered for provider '{}'",
                missing.name
            )));
        }

        let metrics = Arc::new(MetricsReporter::new(clock.clone()));
        let events: SharedEventSink = Arc::new(Fanout::new().with(metrics.clone()).with(sink));

        let cache = Arc::new(ResponseCache::new(&config.cache, clock.clone(), events.clone()));
        let coalescer = Arc::new(InFlightCoalescer::new(&config.dedup, clock.clone()));
        let rate_limiter = RateLimiter::new(&config.rate_limit, clock.clone());
        let budget = Arc::new(BudgetGovernor::new(
            &config.budget,
            clock.clone(),
            events.clone(),
        ));
        let registry = Arc::new(ProviderRegistry::new(&config, clock.clone(), events.clone()));
        let scheduler = CascadeScheduler::new(
            adapters,
            registry.clone(),
            budget.clone(),
            config.cascade.clone(),
            clock.clone(),
            events.clone(),
        );

        info!(
            providers = registry.len(),
            stale_policy = ?config.cache.stale_policy,
            "cascade engine ready"
        );

        Ok(Self {
            inner: Arc::new(EngineInner {
                fingerprinter: Fingerprinter::new(&config.cache.allowed_headers),
                config,
                cache,
                coalescer,
                rate_limiter,
                budget,
                registry,
                scheduler,
                metrics,
                clock,
                events,
            }),
        })
    }

    /// Fetch `request` through cache, coalescing and the provider cascade.
    pub async fn fetch(&self, request: RequestDescriptor, options: FetchOptions) -> CascadeOutcome {
        let inner = &self.inner;
        inner.metrics.record_request();
        let outcome = self.fetch_inner(request, options).await;
        inner.metrics.record_outcome(&outcome);
        outcome
    }

    async fn fetch_inner(&self, request: RequestDescriptor, options: FetchOptions) -> CascadeOutcome {
        let inner = &self.inner;
        let started = Instant::now();
        let cache_key = inner.fingerprinter.cache_key(&request);

        if !options.bypass_cache {
            let hit = match inner.cache.lookup(&cache_key) {
                CacheLookup::Fresh(entry) => Some((entry, false)),
                CacheLookup::Stale(entry) => match inner.config.cache.stale_policy {
                    StalePolicy::ServeStale => Some((entry, true)),
                    StalePolicy::ServeStaleAndRevalidate => {
                        self.revalidate(request.clone(), cache_key.clone());
                        Some((entry, true))
                    }
                    StalePolicy::Refetch => None,
                },
                CacheLookup::Miss => None,
            };
            match hit {
                Some((entry, stale)) => {
                    debug!(cache_key = %cache_key, stale, "cache hit");
                    inner.events.emit(CascadeEvent::CacheHit {
                        cache_key: cache_key.to_string(),
                        stale,
                        saved_cost: entry.cost,
                        timestamp_ms: inner.clock.now_ms(),
                    });
                    return Ok(entry
                        .payload
                        .as_cached(started.elapsed().as_millis() as u64));
                }
                None => {
                    debug!(cache_key = %cache_key, "cache miss");
                    inner.events.emit(CascadeEvent::CacheMiss {
                        cache_key: cache_key.to_string(),
                        timestamp_ms: inner.clock.now_ms(),
                    });
                }
            }
        }

        let dedup_key = inner.fingerprinter.dedup_key(&request);
        match inner.coalescer.acquire(dedup_key) {
            Acquired::Joined(joiner) => {
                debug!(dedup_key = %dedup_key, joiners = joiner.joiner_count, "request deduped");
                inner.events.emit(CascadeEvent::RequestDeduped {
                    dedup_key: dedup_key.to_string(),
                    joiners: joiner.joiner_count,
                    timestamp_ms: inner.clock.now_ms(),
                });
                let result = joiner.waiter.wait().await?;
                inner.metrics.record_dedup_saving(result.cost);
                Ok(result.as_deduped())
            }
            Acquired::Leader(guard) => {
                let waiter = guard.waiter();
                self.spawn_leader(guard, request, options, cache_key);
                waiter.wait().await
            }
        }
    }

    /// Refresh a stale entry in the background unless a refresh is already live.
    fn revalidate(&self, request: RequestDescriptor, cache_key: CacheKey) {
        let dedup_key = self.inner.fingerprinter.dedup_key(&request);
        match self.inner.coalescer.acquire(dedup_key) {
            Acquired::Leader(guard) => {
                debug!(cache_key = %cache_key, "revalidating stale entry");
                self.spawn_leader(guard, request, FetchOptions::default(), cache_key);
            }
            // Someone is already fetching this key; its result refreshes the cache.
            Acquired::Joined(_) => {}
        }
    }

    fn spawn_leader(
        &self,
        guard: LeaderGuard,
        request: RequestDescriptor,
        options: FetchOptions,
        cache_key: CacheKey,
    ) {
        let inner = self.inner.clone();
        tokio::spawn(async move {
            let outcome = inner.lead(&request, &options, cache_key).await;
            guard.settle(outcome);
        });
    }

    /// Engine-wide counters joined with live budget and provider state.
    pub fn metrics(&self) -> MetricsSnapshot {
        self.inner
            .metrics
            .snapshot(&self.inner.registry, &self.inner.budget)
    }

    pub fn config(&self) -> &CascadeConfig {
        &self.inner.config
    }

    pub fn registry(&self) -> &ProviderRegistry {
        &self.inner.registry
    }

    pub fn budget(&self) -> &BudgetGovernor {
        &self.inner.budget
    }

    pub fn cache(&self) -> &ResponseCache {
        &self.inner.cache
    }

    pub fn coalescer(&self) -> &InFlightCoalescer {
        &self.inner.coalescer
    }

    /// Periodic cleanup over this engine's state.
    pub fn housekeeper(&self) -> Housekeeper {
        Housekeeper::new(
            self.inner.cache.clone(),
            self.inner.coalescer.clone(),
            self.inner.budget.clone(),
            self.inner.registry.clone(),
            self.inner.clock.clone(),
        )
    }

    pub fn snapshot(&self) -> EngineSnapshot {
        EngineSnapshot::new(
            self.inner.clock.now_ms(),
            self.inner.registry.all_stats(),
            self.inner.budget.snapshot(),
        )
    }

    /// Apply a saved snapshot. Unknown providers and ended windows are skipped.
    pub fn restore(&self, snapshot: &EngineSnapshot) -> RestoreReport {
        let report = RestoreReport {
            providers: self.inner.registry.restore(&snapshot.providers),
            windows: self.inner.budget.restore(&snapshot.budget),
        };
        info!(
            providers = report.providers,
            windows = report.windows,
            saved_at_ms = snapshot.saved_at_ms,
            "restored engine snapshot"
        );
        report
    }
}

impl EngineInner {
    /// One execution on behalf of every coalesced caller.
    async fn lead(
        &self,
        request: &RequestDescriptor,
        options: &FetchOptions,
        cache_key: CacheKey,
    ) -> CascadeOutcome {
        if let Err(limited) = self.rate_limiter.try_acquire() {
            warn!(retry_after_ms = limited.retry_after_ms, url = %request.url(), "rate limited");
            self.events.emit(CascadeEvent::RateLimited {
                retry_after_ms: limited.retry_after_ms,
                timestamp_ms: self.clock.now_ms(),
            });
            return Err(CascadeError::RateLimited {
                retry_after_ms: limited.retry_after_ms,
            });
        }

        let order = self.registry.compute_order(options, &self.budget)?;
        let outcome = self.scheduler.execute(request, &order).await;
        if let Ok(result) = &outcome {
            self.cache.put(cache_key, result.clone(), result.cost);
        }
        outcome
    }
}
