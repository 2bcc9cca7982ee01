//! Token-bucket admission gate.
//!
//! Tokens refill continuously at `tokens_per_interval / interval_ms`, capped
//! at `max_burst`. Refill is computed lazily from elapsed time on each check,
//! so no timer is needed and long idle periods simply top the bucket up. A
//! request that finds no token is rejected at once; backing off is the
//! caller's business.

use std::sync::Mutex;

use crate::clock::SharedClock;
use crate::config::RateLimitConfig;
use crate::sync::lock;

/// Rejection from [`RateLimiter::try_acquire`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimited {
    /// Time until one full token is available.
    pub retry_after_ms: u64,
}

struct Bucket {
    tokens: f64,
    last_refill_ms: u64,
}

pub struct RateLimiter {
    bucket: Mutex<Bucket>,
    tokens_per_ms: f64,
    max_burst: f64,
    clock: SharedClock,
}

impl RateLimiter {
    /// Starts full.
    pub fn new(config: &RateLimitConfig, clock: SharedClock) -> Self {
        let max_burst = f64::from(config.max_burst.max(1));
        let now = clock.now_ms();
        Self {
            bucket: Mutex::new(Bucket {
                tokens: max_burst,
                last_refill_ms: now,
            }),
            tokens_per_ms: f64::from(config.tokens_per_interval) / config.interval_ms.max(1) as f64,
            max_burst,
            clock,
        }
    }

    /// Take one token or fail immediately.
    pub fn try_acquire(&self) -> Result<(), RateLimited> {
        let now = self.clock.now_ms();
        let mut bucket = lock(&self.bucket);
        self.refill(&mut bucket, now);

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            return Ok(());
        }
        let missing = 1.0 - bucket.tokens;
        let retry_after_ms = if self.tokens_per_ms > 0.0 {
            (missing / self.tokens_per_ms).ceil() as u64
        } else {
            u64::MAX
        };
        Err(RateLimited { retry_after_ms })
    }

    /// Tokens available right now (after refill).
    pub fn available(&self) -> f64 {
        let now = self.clock.now_ms();
        let mut bucket = lock(&self.bucket);
        self.refill(&mut bucket, now);
        bucket.tokens
    }

    fn refill(&self, bucket: &mut Bucket, now: u64) {
        // A clock that stepped backwards refills nothing.
        let elapsed = now.saturating_sub(bucket.last_refill_ms);
        if elapsed > 0 {
            bucket.tokens = (bucket.tokens + elapsed as f64 * self.tokens_per_ms).min(self.max_burst);
        }
        bucket.last_refill_ms = bucket.last_refill_ms.max(now);
    }
}
