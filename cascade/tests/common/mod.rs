//! In-process provider doubles shared by the integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use cascade_engine::{
    CascadeConfig, CascadeEngine, EventBus, ManualClock, Provider, ProviderError,
    ProviderResponse, RequestDescriptor, SharedProvider,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// 2026-03-15T10:30:00Z
pub const T0: u64 = 1_773_570_600_000;

/// Provider that answers with a fixed status after a fixed delay and counts calls.
pub struct MockProvider {
    name: String,
    status: Mutex<u16>,
    delay: Duration,
    calls: AtomicUsize,
}

impl MockProvider {
    pub fn new(name: &str, status: u16) -> Arc<Self> {
        Self::with_delay(name, status, Duration::from_millis(20))
    }

    pub fn with_delay(name: &str, status: u16, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            status: Mutex::new(status),
            delay,
            calls: AtomicUsize::new(0),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn set_status(&self, status: u16) {
        *self.status.lock().unwrap() = status;
    }
}

#[async_trait]
impl Provider for MockProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn fetch(
        &self,
        request: &RequestDescriptor,
        _timeout: Duration,
    ) -> Result<ProviderResponse, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        let status = *self.status.lock().unwrap();
        Ok(ProviderResponse::new(
            status,
            format!("<html>{} via {}</html>", request.url(), self.name),
        ))
    }
}

pub struct Harness {
    pub engine: CascadeEngine,
    pub clock: Arc<ManualClock>,
    pub bus: Arc<EventBus>,
}

pub fn harness(config: CascadeConfig, providers: Vec<Arc<MockProvider>>) -> Harness {
    let clock = Arc::new(ManualClock::new(T0));
    let bus = EventBus::new().shared();
    let engine = CascadeEngine::builder(config)
        .providers(providers.into_iter().map(|p| p as SharedProvider))
        .clock(clock.clone())
        .events(bus.clone())
        .build()
        .expect("valid test configuration");
    Harness { engine, clock, bus }
}
