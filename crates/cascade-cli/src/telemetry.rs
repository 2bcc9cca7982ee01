//! Log output for the CLI: subscriber setup and an event sink that
//! forwards engine events into `tracing`.

use cascade_engine::{CascadeEvent, EventFilter, EventSink};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

pub fn init(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into());
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Routine traffic goes to debug, anything an operator should act on to warn.
#[derive(Debug, Default, Clone)]
pub struct LogSink {
    filter: EventFilter,
}

impl LogSink {
    pub fn new(filter: EventFilter) -> Self {
        Self { filter }
    }

    pub fn accepts(&self, event: &CascadeEvent) -> bool {
        self.filter.matches(event)
    }
}

impl EventSink for LogSink {
    fn emit(&self, event: CascadeEvent) {
        if !self.accepts(&event) {
            return;
        }
        match &event {
            CascadeEvent::ProviderFailure {
                provider,
                status_code,
                error,
                latency_ms,
                ..
            } => warn!(%provider, ?status_code, %error, latency_ms, "provider attempt failed"),
            CascadeEvent::BudgetAlert {
                window,
                threshold_pct,
                spent,
                limit,
                ..
            } => warn!(%window, threshold_pct, spent, limit, "budget threshold crossed"),
            CascadeEvent::BudgetExceeded {
                window,
                spent,
                limit,
                requested,
                ..
            } => warn!(%window, spent, limit, requested, "budget ceiling reached"),
            CascadeEvent::CircuitOpened {
                provider,
                state,
                consecutive_failures,
                until_ms,
                ..
            } => warn!(%provider, %state, consecutive_failures, until_ms, "circuit opened"),
            CascadeEvent::CircuitClosed { provider, .. } => info!(%provider, "circuit closed"),
            CascadeEvent::ProviderSuccess {
                provider,
                status_code,
                cost,
                latency_ms,
                ..
            } => info!(%provider, status_code, cost, latency_ms, "provider succeeded"),
            other => debug!(event = other.event_type(), ?other, "engine event"),
        }
    }
}
