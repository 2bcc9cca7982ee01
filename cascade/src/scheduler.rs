//! Attempt loop: walk the computed order until one provider succeeds.
//!
//! First success wins. Every attempt, failed or not, is appended to the
//! audit trail. Spend is reserved before each attempt at the provider's
//! ceiling, committed at the actual charge on success and released on
//! failure, so no failure ever costs anything.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::budget::{BudgetExceeded, BudgetGovernor};
use crate::clock::SharedClock;
use crate::config::{ProviderSettings, SchedulerConfig};
use crate::error::{CascadeError, CascadeOutcome};
use crate::events::{CascadeEvent, SharedEventSink};
use crate::providers::{ProviderError, ProviderResponse, SharedProvider};
use crate::registry::ProviderRegistry;
use crate::types::{AttemptRecord, CascadeResult, RequestDescriptor};

pub struct CascadeScheduler {
    adapters: HashMap<String, SharedProvider>,
    registry: Arc<ProviderRegistry>,
    budget: Arc<BudgetGovernor>,
    config: SchedulerConfig,
    clock: SharedClock,
    events: SharedEventSink,
}

/// One attempt's raw outcome before accounting.
enum Attempt {
    Success(ProviderResponse),
    Failure {
        status_code: Option<u16>,
        error: String,
    },
}

impl CascadeScheduler {
    pub fn new(
        adapters: HashMap<String, SharedProvider>,
        registry: Arc<ProviderRegistry>,
        budget: Arc<BudgetGovernor>,
        config: SchedulerConfig,
        clock: SharedClock,
        events: SharedEventSink,
    ) -> Self {
        Self {
            adapters,
            registry,
            budget,
            config,
            clock,
            events,
        }
    }

    /// Run the cascade over `order`, strictly in that order.
    pub async fn execute(
        &self,
        request: &RequestDescriptor,
        order: &[ProviderSettings],
    ) -> CascadeOutcome {
        let started = Instant::now();
        let mut attempts: Vec<AttemptRecord> = Vec::new();
        let mut budget_block: Option<BudgetExceeded> = None;

        for settings in order {
            let Some(adapter) = self.adapters.get(&settings.name) else {
                warn!(provider = %settings.name, "no adapter registered, skipping");
                continue;
            };

            // Pause only between providers that were actually called.
            if !attempts.is_empty() && self.config.inter_provider_delay_ms > 0 {
                tokio::time::sleep(self.config.inter_provider_delay()).await;
            }

            let mut retries = 0;
            loop {
                // Re-checked per attempt: concurrent cascades may have spent
                // the headroom since the order was computed.
                let reservation = match self.budget.check_and_reserve(settings.max_cost_usd()) {
                    Ok(r) => r,
                    Err(breach) => {
                        self.emit_budget_exceeded(&breach);
                        budget_block.get_or_insert(breach);
                        break;
                    }
                };

                self.events.emit(CascadeEvent::ProviderAttempt {
                    provider: settings.name.clone(),
                    url: request.url().to_string(),
                    attempt: attempts.len() as u32,
                    timestamp_ms: self.clock.now_ms(),
                });

                let attempt_start = Instant::now();
                let attempt = run_attempt(adapter, request, settings).await;
                let latency_ms = attempt_start.elapsed().as_millis() as u64;

                match attempt {
                    Attempt::Success(response) => {
                        let cost = response
                            .reported_cost
                            .unwrap_or_else(|| settings.cost_usd())
                            .clamp(0.0, settings.max_cost_usd());
                        self.budget.commit(reservation, cost);
                        self.registry
                            .record_outcome(&settings.name, true, latency_ms, cost);
                        info!(
                            provider = %settings.name,
                            status_code = response.status_code,
                            cost,
                            latency_ms,
                            "provider succeeded"
                        );
                        self.events.emit(CascadeEvent::ProviderSuccess {
                            provider: settings.name.clone(),
                            status_code: response.status_code,
                            cost,
                            latency_ms,
                            timestamp_ms: self.clock.now_ms(),
                        });
                        attempts.push(AttemptRecord {
                            provider: settings.name.clone(),
                            success: true,
                            status_code: Some(response.status_code),
                            cost,
                            duration_ms: latency_ms,
                            error: None,
                        });
                        return Ok(CascadeResult {
                            success: true,
                            provider: settings.name.clone(),
                            url: request.url().to_string(),
                            status_code: response.status_code,
                            content: response.content,
                            headers: response.headers,
                            cookies: response.cookies,
                            cost,
                            response_time_ms: started.elapsed().as_millis() as u64,
                            cached: false,
                            deduped: false,
                            attempts,
                        });
                    }
                    Attempt::Failure { status_code, error } => {
                        self.budget.release(reservation);
                        let state =
                            self.registry
                                .record_outcome(&settings.name, false, latency_ms, 0.0);
                        warn!(
                            provider = %settings.name,
                            ?status_code,
                            %error,
                            latency_ms,
                            "provider attempt failed"
                        );
                        self.events.emit(CascadeEvent::ProviderFailure {
                            provider: settings.name.clone(),
                            status_code,
                            error: error.clone(),
                            latency_ms,
                            timestamp_ms: self.clock.now_ms(),
                        });
                        attempts.push(AttemptRecord {
                            provider: settings.name.clone(),
                            success: false,
                            status_code,
                            cost: 0.0,
                            duration_ms: latency_ms,
                            error: Some(error),
                        });

                        if state.is_some_and(|s| s.is_open()) || retries >= settings.max_retries {
                            break;
                        }
                        retries += 1;
                        let backoff = self.config.retry_backoff(retries);
                        debug!(provider = %settings.name, retry = retries, ?backoff, "retrying provider");
                        tokio::time::sleep(backoff).await;
                    }
                }
            }
        }

        match (attempts.is_empty(), budget_block) {
            (true, Some(breach)) => Err(CascadeError::BudgetExceeded {
                window: breach.window,
            }),
            (true, None) => Err(CascadeError::ProviderUnavailable {
                reason: "no provider in the order could be attempted".to_string(),
            }),
            (false, _) => {
                warn!(attempts = attempts.len(), url = %request.url(), "cascade exhausted");
                Err(CascadeError::CascadeExhausted { attempts })
            }
        }
    }

    fn emit_budget_exceeded(&self, breach: &BudgetExceeded) {
        warn!(
            window = %breach.window,
            spent = breach.spent,
            limit = breach.limit,
            requested = breach.requested,
            "budget exceeded"
        );
        self.events.emit(CascadeEvent::BudgetExceeded {
            window: breach.window,
            spent: breach.spent,
            limit: breach.limit,
            requested: breach.requested,
            timestamp_ms: self.clock.now_ms(),
        });
    }
}

async fn run_attempt(
    adapter: &SharedProvider,
    request: &RequestDescriptor,
    settings: &ProviderSettings,
) -> Attempt {
    let timeout = settings.timeout();
    let result = match tokio::time::timeout(timeout, adapter.fetch(request, timeout)).await {
        Ok(result) => result,
        Err(_) => Err(ProviderError::Timeout {
            after_ms: settings.timeout_ms,
        }),
    };
    match result {
        Ok(response) if response.is_success() => Attempt::Success(response),
        Ok(response) => Attempt::Failure {
            status_code: Some(response.status_code),
            error: format!("HTTP {}", response.status_code),
        },
        Err(err) => Attempt::Failure {
            status_code: err.status_code(),
            error: err.to_string(),
        },
    }
}
