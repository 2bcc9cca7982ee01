//! Cascading fetch engine
//!
//! Fetches pages behind anti-bot defenses by routing each request through a
//! prioritized, cost-aware cascade of extraction providers: a free challenge
//! solver first, paid proxy/rendering services after it, while holding spend
//! under hard hourly, daily and monthly ceilings.
//!
//! # Components
//!
//! - [`fingerprint`]: cache keys (allow-listed headers) and dedup keys
//! - [`cache`]: TTL + LRU response cache with stale detection
//! - [`coalesce`]: at most one live execution per dedup key
//! - [`rate_limit`]: token bucket in front of every execution
//! - [`budget`]: three-window spend governor with reservations and alerts
//! - [`registry`]: provider settings, EMA scoring and circuit breaking
//! - [`scheduler`]: first-success-wins attempt loop with an audit trail
//! - [`metrics`]: cost/effectiveness counters and spend projection
//! - [`engine`]: wires the above behind [`CascadeEngine::fetch`]
//!
//! # Usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use cascade_engine::{
//!     CascadeConfig, CascadeEngine, FetchOptions, ProviderSettings, RequestDescriptor,
//!     SolverProvider,
//! };
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let config = CascadeConfig::default().with_provider(ProviderSettings::new("solver", 1, 0.0));
//! let engine = CascadeEngine::builder(config)
//!     .provider(Arc::new(SolverProvider::new("solver", "http://localhost:8191")?))
//!     .build()?;
//! let result = engine
//!     .fetch(RequestDescriptor::get("https://example.com"), FetchOptions::default())
//!     .await?;
//! println!("{} via {}", result.status_code, result.provider);
//! # Ok(())
//! # }
//! ```

pub mod budget;
pub mod cache;
pub mod clock;
pub mod coalesce;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod fingerprint;
pub mod housekeeping;
pub mod metrics;
pub mod persistence;
pub mod providers;
pub mod rate_limit;
pub mod registry;
pub mod scheduler;
pub mod types;

mod sync;

pub use budget::{BudgetGovernor, BudgetWindow, Reservation, WindowKind};
pub use cache::{CacheEntry, CacheLookup, ResponseCache};
pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use config::{
    BudgetConfig, CacheConfig, CascadeConfig, CircuitConfig, CostSpec, DedupConfig,
    ProviderSettings, RateLimitConfig, SchedulerConfig, StalePolicy,
};
pub use engine::{CascadeEngine, EngineBuilder};
pub use error::{CascadeError, CascadeOutcome, ConfigError};
pub use events::{
    CascadeEvent, EventBus, EventFilter, EventSink, Fanout, NullSink, SharedEventSink,
};
pub use fingerprint::{CacheKey, DedupKey, Fingerprinter};
pub use housekeeping::{Housekeeper, SweepReport};
pub use metrics::{MetricsReporter, MetricsSnapshot};
pub use persistence::{EngineSnapshot, RestoreReport, SnapshotError};
pub use providers::{
    Provider, ProviderError, ProviderResponse, ProxyApiProvider, SharedProvider, SolverProvider,
};
pub use registry::{ProviderRegistry, ProviderState, ProviderStats};
pub use types::{AttemptRecord, CascadeResult, Cookie, FetchOptions, RequestDescriptor};
