//! In-flight request coalescing.
//!
//! At most one execution runs per [`DedupKey`] at any instant.
//! The first caller becomes the leader and receives a [`LeaderGuard`];
//! callers arriving while the execution is live become joiners and wait on
//! the same one-shot broadcast. The leader settles exactly once, and every
//! waiter (the leader's own caller included) observes that single outcome.
//!
//! ```text
//! acquire ──▶ no live entry ──▶ Leader ──▶ execute ──▶ settle ──┐
//!    │                                                          ▼
//!    └──────▶ live entry ─────▶ Joined ──▶ wait ◀──── broadcast outcome
//! ```
//!
//! An unsettled entry accepts joiners for as long as it runs. Settled
//! entries linger for `grace_ms` so arrivals a few milliseconds behind the
//! leader still share its outcome, then `acquire` prunes them on its next
//! pass. A leader dropped without settling removes its entry and its
//! waiters receive [`CascadeError::Interrupted`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::clock::SharedClock;
use crate::config::DedupConfig;
use crate::error::{CascadeError, CascadeOutcome};
use crate::fingerprint::DedupKey;
use crate::sync::lock;

type Slot = Option<Arc<CascadeOutcome>>;

struct Entry {
    generation: u64,
    started_at_ms: u64,
    settled_at_ms: Option<u64>,
    joiner_count: u32,
    sender: Arc<watch::Sender<Slot>>,
}

impl Entry {
    fn is_live(&self, now_ms: u64, grace_ms: u64) -> bool {
        match self.settled_at_ms {
            Some(settled) => now_ms < settled.saturating_add(grace_ms),
            None => true,
        }
    }
}

/// What [`InFlightCoalescer::acquire`] handed out.
pub enum Acquired {
    /// Caller must execute and then [`LeaderGuard::settle`].
    Leader(LeaderGuard),
    /// Another execution is live; wait for its outcome.
    Joined(Joiner),
}

pub struct InFlightCoalescer {
    entries: Mutex<HashMap<DedupKey, Entry>>,
    next_generation: AtomicU64,
    /// Last time `acquire` pruned settled entries.
    last_prune_ms: AtomicU64,
    window_ms: u64,
    grace_ms: u64,
    clock: SharedClock,
}

impl InFlightCoalescer {
    pub fn new(config: &DedupConfig, clock: SharedClock) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            next_generation: AtomicU64::new(1),
            last_prune_ms: AtomicU64::new(clock.now_ms()),
            window_ms: config.window_ms,
            grace_ms: config.grace_ms,
            clock,
        }
    }

    /// Become the leader for `key`, or join its live execution.
    ///
    /// The check and the registration happen under one lock, so two callers
    /// can never both become leader of the same live window.
    pub fn acquire(self: &Arc<Self>, key: DedupKey) -> Acquired {
        let now = self.clock.now_ms();
        let mut entries = lock(&self.entries);

        let last = self.last_prune_ms.load(Ordering::Relaxed);
        if now >= last.saturating_add(self.grace_ms.max(1)) {
            self.last_prune_ms.store(now, Ordering::Relaxed);
            let removed = self.prune(&mut entries, now);
            if removed > 0 {
                debug!(removed, "pruned settled in-flight entries");
            }
        }

        if let Some(entry) = entries.get_mut(&key) {
            if entry.is_live(now, self.grace_ms) {
                entry.joiner_count += 1;
                let running_ms = now.saturating_sub(entry.started_at_ms);
                if entry.settled_at_ms.is_none() && running_ms > self.window_ms {
                    debug!(dedup_key = %key, running_ms, "joining execution running past dedup window");
                }
                debug!(dedup_key = %key, joiners = entry.joiner_count, "joined in-flight request");
                return Acquired::Joined(Joiner {
                    waiter: OutcomeWaiter {
                        receiver: entry.sender.subscribe(),
                    },
                    joiner_count: entry.joiner_count,
                });
            }
        }

        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let (sender, _) = watch::channel(None);
        let sender = Arc::new(sender);
        entries.insert(
            key,
            Entry {
                generation,
                started_at_ms: now,
                settled_at_ms: None,
                joiner_count: 0,
                sender: sender.clone(),
            },
        );
        Acquired::Leader(LeaderGuard {
            coalescer: self.clone(),
            key,
            generation,
            sender,
            settled: false,
        })
    }

    /// Drop settled entries whose grace period has passed. Idempotent.
    pub fn sweep(&self, now_ms: u64) -> usize {
        let mut entries = lock(&self.entries);
        self.prune(&mut entries, now_ms)
    }

    fn prune(&self, entries: &mut HashMap<DedupKey, Entry>, now_ms: u64) -> usize {
        let before = entries.len();
        entries.retain(|_, e| e.is_live(now_ms, self.grace_ms));
        before - entries.len()
    }

    /// Entries currently tracked (live or within grace).
    pub fn len(&self) -> usize {
        lock(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Joiners recorded against `key`'s current entry.
    pub fn joiner_count(&self, key: DedupKey) -> Option<u32> {
        lock(&self.entries).get(&key).map(|e| e.joiner_count)
    }

    fn mark_settled(&self, key: DedupKey, generation: u64) {
        let now = self.clock.now_ms();
        let mut entries = lock(&self.entries);
        if let Some(entry) = entries.get_mut(&key) {
            if entry.generation == generation {
                entry.settled_at_ms = Some(now);
            }
        }
    }

    fn abandon(&self, key: DedupKey, generation: u64) {
        let mut entries = lock(&self.entries);
        if entries.get(&key).is_some_and(|e| e.generation == generation) {
            entries.remove(&key);
        }
    }
}

/// Exclusive right to execute for one dedup key.
pub struct LeaderGuard {
    coalescer: Arc<InFlightCoalescer>,
    key: DedupKey,
    generation: u64,
    sender: Arc<watch::Sender<Slot>>,
    settled: bool,
}

impl LeaderGuard {
    pub fn key(&self) -> DedupKey {
        self.key
    }

    /// A waiter for the leader's own caller.
    pub fn waiter(&self) -> OutcomeWaiter {
        OutcomeWaiter {
            receiver: self.sender.subscribe(),
        }
    }

    /// Publish the single outcome to every waiter.
    pub fn settle(mut self, outcome: CascadeOutcome) {
        self.coalescer.mark_settled(self.key, self.generation);
        self.sender.send_replace(Some(Arc::new(outcome)));
        self.settled = true;
    }
}

impl Drop for LeaderGuard {
    fn drop(&mut self) {
        if !self.settled {
            warn!(dedup_key = %self.key, "leader dropped without settling");
            self.coalescer.abandon(self.key, self.generation);
        }
    }
}

/// Handle for a caller that joined someone else's execution.
pub struct Joiner {
    pub waiter: OutcomeWaiter,
    /// This joiner's position (1 = first joiner).
    pub joiner_count: u32,
}

/// Resolves once the leader settles. Dropping it affects nobody else.
pub struct OutcomeWaiter {
    receiver: watch::Receiver<Slot>,
}

impl OutcomeWaiter {
    pub async fn wait(mut self) -> CascadeOutcome {
        match self.receiver.wait_for(Option::is_some).await {
            Ok(slot) => match &*slot {
                Some(outcome) => (**outcome).clone(),
                None => Err(interrupted()),
            },
            Err(_) => Err(interrupted()),
        }
    }
}

fn interrupted() -> CascadeError {
    CascadeError::Interrupted {
        reason: "leader ended without publishing an outcome".to_string(),
    }
}
