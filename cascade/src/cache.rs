//! Bounded TTL cache of successful cascade results.
//!
//! Entries live for `ttl_ms`; once older than `max_age_ms` they are *stale*
//! and the engine's stale policy decides whether to serve them. When the
//! entry count exceeds `max_entries` the least recently used entries are
//! evicted. Every eviction is published as `CacheEvict`, separately from
//! hit/miss accounting, so memory pressure can be told apart from poor hit
//! rates.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use tracing::debug;

use crate::clock::SharedClock;
use crate::config::CacheConfig;
use crate::events::{CascadeEvent, EvictReason, SharedEventSink};
use crate::fingerprint::CacheKey;
use crate::sync::lock;
use crate::types::CascadeResult;

#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub key: CacheKey,
    pub payload: CascadeResult,
    /// USD the original fetch cost; what a hit saves.
    pub cost: f64,
    pub stored_at_ms: u64,
    pub hit_count: u64,
}

impl CacheEntry {
    pub fn age_ms(&self, now_ms: u64) -> u64 {
        now_ms.saturating_sub(self.stored_at_ms)
    }
}

/// Result of a lookup that distinguishes fresh from stale entries.
#[derive(Debug, Clone, PartialEq)]
pub enum CacheLookup {
    Fresh(CacheEntry),
    Stale(CacheEntry),
    Miss,
}

struct Slot {
    entry: CacheEntry,
    /// Recency tick; key into `Inner::recency`.
    touched: u64,
}

#[derive(Default)]
struct Inner {
    slots: HashMap<CacheKey, Slot>,
    /// Oldest tick first.
    recency: BTreeMap<u64, CacheKey>,
    tick: u64,
}

impl Inner {
    fn next_tick(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }

    fn touch(&mut self, key: &CacheKey) {
        let tick = self.next_tick();
        if let Some(slot) = self.slots.get_mut(key) {
            self.recency.remove(&slot.touched);
            slot.touched = tick;
            self.recency.insert(tick, key.clone());
        }
    }

    fn remove(&mut self, key: &CacheKey) -> Option<CacheEntry> {
        let slot = self.slots.remove(key)?;
        self.recency.remove(&slot.touched);
        Some(slot.entry)
    }

    fn pop_lru(&mut self) -> Option<CacheKey> {
        let (_, key) = self.recency.pop_first()?;
        self.slots.remove(&key);
        Some(key)
    }
}

pub struct ResponseCache {
    inner: Mutex<Inner>,
    max_entries: usize,
    ttl_ms: u64,
    max_age_ms: u64,
    clock: SharedClock,
    events: SharedEventSink,
}

impl ResponseCache {
    pub fn new(config: &CacheConfig, clock: SharedClock, events: SharedEventSink) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            max_entries: config.max_entries.max(1),
            ttl_ms: config.ttl_ms,
            max_age_ms: config.max_age_ms.min(config.ttl_ms),
            clock,
            events,
        }
    }

    /// Entry for `key` unless absent or past its TTL. Stale entries are returned.
    pub fn get(&self, key: &CacheKey) -> Option<CacheEntry> {
        match self.lookup(key) {
            CacheLookup::Fresh(entry) | CacheLookup::Stale(entry) => Some(entry),
            CacheLookup::Miss => None,
        }
    }

    /// Like [`get`](Self::get) but reports staleness.
    pub fn lookup(&self, key: &CacheKey) -> CacheLookup {
        let now = self.clock.now_ms();
        let mut inner = lock(&self.inner);

        let expired = match inner.slots.get(key) {
            None => return CacheLookup::Miss,
            Some(slot) => slot.entry.age_ms(now) >= self.ttl_ms,
        };
        if expired {
            inner.remove(key);
            drop(inner);
            self.emit_evict(key.clone(), EvictReason::Expired, now);
            return CacheLookup::Miss;
        }

        inner.touch(key);
        let Some(slot) = inner.slots.get_mut(key) else {
            return CacheLookup::Miss;
        };
        slot.entry.hit_count += 1;
        let entry = slot.entry.clone();
        drop(inner);

        if entry.age_ms(now) >= self.max_age_ms && self.max_age_ms < self.ttl_ms {
            CacheLookup::Stale(entry)
        } else {
            CacheLookup::Fresh(entry)
        }
    }

    /// Store a result, replacing any previous entry and resetting its hit count.
    pub fn put(&self, key: CacheKey, payload: CascadeResult, cost: f64) {
        let now = self.clock.now_ms();
        let mut evicted = Vec::new();
        {
            let mut inner = lock(&self.inner);
            inner.remove(&key);
            let tick = inner.next_tick();
            inner.recency.insert(tick, key.clone());
            inner.slots.insert(
                key.clone(),
                Slot {
                    entry: CacheEntry {
                        key,
                        payload,
                        cost,
                        stored_at_ms: now,
                        hit_count: 0,
                    },
                    touched: tick,
                },
            );
            while inner.slots.len() > self.max_entries {
                match inner.pop_lru() {
                    Some(k) => evicted.push(k),
                    None => break,
                }
            }
        }
        for key in evicted {
            self.emit_evict(key, EvictReason::Capacity, now);
        }
    }

    /// Drop the entry for `key`, if any.
    pub fn invalidate(&self, key: &CacheKey) -> bool {
        lock(&self.inner).remove(key).is_some()
    }

    /// Remove every entry past its TTL as of `now_ms`. Idempotent.
    pub fn sweep_expired(&self, now_ms: u64) -> usize {
        let expired: Vec<CacheKey> = {
            let mut inner = lock(&self.inner);
            let keys: Vec<CacheKey> = inner
                .slots
                .iter()
                .filter(|(_, slot)| slot.entry.age_ms(now_ms) >= self.ttl_ms)
                .map(|(k, _)| k.clone())
                .collect();
            for key in &keys {
                inner.remove(key);
            }
            keys
        };
        if !expired.is_empty() {
            debug!(count = expired.len(), "swept expired cache entries");
        }
        let count = expired.len();
        for key in expired {
            self.emit_evict(key, EvictReason::Expired, now_ms);
        }
        count
    }

    pub fn len(&self) -> usize {
        lock(&self.inner).slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn emit_evict(&self, key: CacheKey, reason: EvictReason, now: u64) {
        debug!(cache_key = %key, ?reason, "cache eviction");
        self.events.emit(CascadeEvent::CacheEvict {
            cache_key: key.to_string(),
            reason,
            timestamp_ms: now,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::events::EventBus;
    use crate::fingerprint::Fingerprinter;
    use crate::types::RequestDescriptor;
    use std::collections::BTreeMap;
    use std::sync::Arc;

    fn result(content: &str) -> CascadeResult {
        CascadeResult {
            success: true,
            provider: "solver".into(),
            url: "https://example.com".into(),
            status_code: 200,
            content: content.into(),
            headers: BTreeMap::new(),
            cookies: vec![],
            cost: 0.0,
            response_time_ms: 10,
            cached: false,
            deduped: false,
            attempts: vec![],
        }
    }

    fn key(url: &str) -> CacheKey {
        Fingerprinter::default().cache_key(&RequestDescriptor::get(url))
    }

    fn cache(
        max_entries: usize,
        ttl_ms: u64,
        max_age_ms: u64,
    ) -> (ResponseCache, Arc<ManualClock>, Arc<EventBus>) {
        let clock = Arc::new(ManualClock::new(0));
        let bus = EventBus::new().shared();
        let config = CacheConfig {
            max_entries,
            ttl_ms,
            max_age_ms,
            ..CacheConfig::default()
        };
        (ResponseCache::new(&config, clock.clone(), bus.clone()), clock, bus)
    }

    #[test]
    fn test_ttl_boundary() {
        let (cache, clock, _) = cache(10, 60_000, 60_000);
        let k = key("https://example.com/a");
        cache.put(k.clone(), result("a"), 0.025);

        clock.set(59_999);
        let entry = cache.get(&k).expect("entry before ttl");
        assert_eq!(entry.payload.content, "a");
        assert_eq!(entry.cost, 0.025);

        clock.set(60_001);
        assert!(cache.get(&k).is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_stale_between_max_age_and_ttl() {
        let (cache, clock, _) = cache(10, 10_000, 4_000);
        let k = key("https://example.com/s");
        cache.put(k.clone(), result("s"), 0.0);

        clock.set(3_999);
        assert!(matches!(cache.lookup(&k), CacheLookup::Fresh(_)));
        clock.set(4_000);
        assert!(matches!(cache.lookup(&k), CacheLookup::Stale(_)));
        clock.set(10_000);
        assert_eq!(cache.lookup(&k), CacheLookup::Miss);
    }

    #[test]
    fn test_hit_count_and_reset_on_put() {
        let (cache, _, _) = cache(10, 10_000, 10_000);
        let k = key("https://example.com/h");
        cache.put(k.clone(), result("v1"), 0.0);
        cache.get(&k);
        let entry = cache.get(&k).unwrap();
        assert_eq!(entry.hit_count, 2);

        cache.put(k.clone(), result("v2"), 0.0);
        let entry = cache.get(&k).unwrap();
        assert_eq!(entry.hit_count, 1);
        assert_eq!(entry.payload.content, "v2");
    }

    #[test]
    fn test_lru_eviction_emits_events() {
        let (cache, _, bus) = cache(2, 10_000, 10_000);
        let mut rx = bus.subscribe();
        let (a, b, c) = (
            key("https://example.com/1"),
            key("https://example.com/2"),
            key("https://example.com/3"),
        );
        cache.put(a.clone(), result("1"), 0.0);
        cache.put(b.clone(), result("2"), 0.0);
        // Touch `a` so `b` becomes least recently used.
        assert!(cache.get(&a).is_some());
        cache.put(c.clone(), result("3"), 0.0);

        assert_eq!(cache.len(), 2);
        assert!(cache.get(&a).is_some());
        assert!(cache.get(&b).is_none());
        assert!(cache.get(&c).is_some());

        match rx.try_recv().unwrap() {
            CascadeEvent::CacheEvict {
                cache_key, reason, ..
            } => {
                assert_eq!(cache_key, b.to_string());
                assert_eq!(reason, EvictReason::Capacity);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn test_sweep_is_idempotent() {
        let (cache, clock, _) = cache(10, 1_000, 1_000);
        cache.put(key("https://example.com/x"), result("x"), 0.0);
        clock.set(500);
        cache.put(key("https://example.com/y"), result("y"), 0.0);

        assert_eq!(cache.sweep_expired(1_200), 1);
        assert_eq!(cache.sweep_expired(1_200), 0);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_invalidate() {
        let (cache, _, _) = cache(10, 1_000, 1_000);
        let k = key("https://example.com/i");
        cache.put(k.clone(), result("i"), 0.0);
        assert!(cache.invalidate(&k));
        assert!(!cache.invalidate(&k));
    }
}
