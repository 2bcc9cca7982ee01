//! Event sinks.
//!
//! The engine publishes into an [`EventSink`]; which sink is used is the
//! host's decision. [`EventBus`] fans events out over a Tokio broadcast
//! channel, closures can be registered directly, and [`NullSink`] drops
//! everything.

use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::trace;

use super::types::CascadeEvent;

/// Channel capacity for broadcast
const CHANNEL_CAPACITY: usize = 1024;

/// Injection seam for observers. Must never block.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: CascadeEvent);
}

/// Shared reference to a sink.
pub type SharedEventSink = Arc<dyn EventSink>;

impl<F> EventSink for F
where
    F: Fn(&CascadeEvent) + Send + Sync,
{
    fn emit(&self, event: CascadeEvent) {
        self(&event)
    }
}

/// Discards every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl EventSink for NullSink {
    fn emit(&self, _event: CascadeEvent) {}
}

/// Broadcast-based pub/sub. Slow subscribers lag rather than block the engine.
pub struct EventBus {
    sender: broadcast::Sender<CascadeEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(CHANNEL_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn shared(self) -> Arc<Self> {
        Arc::new(self)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CascadeEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventSink for EventBus {
    fn emit(&self, event: CascadeEvent) {
        let event_type = event.event_type();
        // No receivers is fine.
        match self.sender.send(event) {
            Ok(receivers) => trace!(event_type, receivers, "event published"),
            Err(_) => trace!(event_type, "event published (no receivers)"),
        }
    }
}

/// Delivers every event to several sinks in order.
#[derive(Clone, Default)]
pub struct Fanout {
    sinks: Vec<SharedEventSink>,
}

impl Fanout {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: SharedEventSink) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }
}

impl EventSink for Fanout {
    fn emit(&self, event: CascadeEvent) {
        if let Some((last, rest)) = self.sinks.split_last() {
            for sink in rest {
                sink.emit(event.clone());
            }
            last.emit(event);
        }
    }
}

/// Selects a subset of events, e.g. for a log shipper.
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    /// Only events about this provider.
    pub provider: Option<String>,
    /// Only these event types (see [`CascadeEvent::event_type`]).
    pub event_types: Option<Vec<String>>,
}

impl EventFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn provider(mut self, name: &str) -> Self {
        self.provider = Some(name.to_string());
        self
    }

    pub fn types(mut self, event_types: Vec<&str>) -> Self {
        self.event_types = Some(event_types.into_iter().map(String::from).collect());
        self
    }

    pub fn matches(&self, event: &CascadeEvent) -> bool {
        if let Some(ref wanted) = self.provider {
            if event.provider() != Some(wanted.as_str()) {
                return false;
            }
        }
        if let Some(ref types) = self.event_types {
            if !types.iter().any(|t| t == event.event_type()) {
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn miss(ts: u64) -> CascadeEvent {
        CascadeEvent::CacheMiss {
            cache_key: "k".into(),
            timestamp_ms: ts,
        }
    }

    #[tokio::test]
    async fn test_bus_delivers_to_subscribers() {
        let bus = EventBus::new();
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 2);

        bus.emit(miss(7));
        assert_eq!(rx1.recv().await.unwrap().timestamp_ms(), 7);
        assert_eq!(rx2.recv().await.unwrap().timestamp_ms(), 7);
    }

    #[test]
    fn test_bus_without_subscribers_is_silent() {
        let bus = EventBus::new();
        bus.emit(miss(1));
    }

    #[test]
    fn test_closure_sink() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let captured = seen.clone();
        let sink: SharedEventSink = Arc::new(move |e: &CascadeEvent| {
            captured.lock().unwrap().push(e.event_type());
        });
        sink.emit(miss(1));
        sink.emit(CascadeEvent::RateLimited {
            retry_after_ms: 5,
            timestamp_ms: 2,
        });
        assert_eq!(*seen.lock().unwrap(), vec!["cache_miss", "rate_limited"]);
    }

    #[test]
    fn test_fanout_reaches_every_sink() {
        let bus = EventBus::new().shared();
        let mut rx = bus.subscribe();
        let count = Arc::new(Mutex::new(0));
        let counter = count.clone();
        let fanout = Fanout::new()
            .with(Arc::new(move |_: &CascadeEvent| *counter.lock().unwrap() += 1))
            .with(bus.clone());
        fanout.emit(miss(3));
        assert_eq!(*count.lock().unwrap(), 1);
        assert_eq!(rx.try_recv().unwrap().timestamp_ms(), 3);
    }

    #[test]
    fn test_filter() {
        let filter = EventFilter::new()
            .provider("premium")
            .types(vec!["provider_failure"]);
        let failure = CascadeEvent::ProviderFailure {
            provider: "premium".into(),
            status_code: Some(403),
            error: "HTTP 403".into(),
            latency_ms: 5,
            timestamp_ms: 1,
        };
        let other = CascadeEvent::ProviderFailure {
            provider: "solver".into(),
            status_code: None,
            error: "timeout".into(),
            latency_ms: 5,
            timestamp_ms: 1,
        };
        assert!(filter.matches(&failure));
        assert!(!filter.matches(&other));
        assert!(!filter.matches(&miss(1)));
        assert!(EventFilter::new().matches(&miss(1)));
    }
}
