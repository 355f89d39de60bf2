//! Per-tenant token-bucket rate limiting.
//!
//! The registry is plain state owned by whoever builds the gateway. It is
//! injected into request handling, never reached through a global. Buckets
//! are created lazily on first use and live for the process lifetime, which
//! is an acceptable leak at tenant-count scale.

use std::time::Instant;

use dashmap::DashMap;

/// Refill configuration for one bucket. The first `take` for a key fixes
/// its config; later calls with a different config are ignored.
#[derive(Debug, Clone, Copy)]
pub struct RateLimitConfig {
    pub capacity: f64,
    pub refill_per_ms: f64,
}

#[derive(Debug)]
struct TokenBucket {
    capacity: f64,
    refill_per_ms: f64,
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(config: RateLimitConfig, now: Instant) -> Self {
        Self {
            capacity: config.capacity,
            refill_per_ms: config.refill_per_ms,
            tokens: config.capacity,
            last_refill: now,
        }
    }

    /// Refill proportionally to elapsed time, then either debit `cost` and
    /// return 0 or return the milliseconds until the bucket would hold
    /// enough tokens. Nothing is reserved while waiting; callers must
    /// re-derive readiness with another `take`.
    fn take_at(&mut self, cost: f64, now: Instant) -> u64 {
        let elapsed_ms = now.duration_since(self.last_refill).as_millis() as f64;
        if elapsed_ms > 0.0 {
            self.tokens = (self.tokens + elapsed_ms * self.refill_per_ms).min(self.capacity);
            self.last_refill = now;
        }
        if self.tokens >= cost {
            self.tokens -= cost;
            return 0;
        }
        if self.refill_per_ms <= 0.0 {
            // A non-refilling bucket can never satisfy the request.
            return u64::MAX;
        }
        ((cost - self.tokens) / self.refill_per_ms).ceil() as u64
    }
}

/// Keyed registry of token buckets. The `DashMap` entry guard serializes
/// the refill-debit-read sequence per key, which keeps concurrent takers
/// from double-spending.
#[derive(Debug, Default)]
pub struct RateLimiterRegistry {
    buckets: DashMap<String, TokenBucket>,
}

impl RateLimiterRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Debit `cost` tokens from the bucket for `key`, creating it with
    /// `config` if absent. Returns 0 to proceed immediately, otherwise the
    /// wait in milliseconds before a retry could succeed.
    pub fn take(&self, key: &str, config: RateLimitConfig, cost: f64) -> u64 {
        self.take_at(key, config, cost, Instant::now())
    }

    fn take_at(&self, key: &str, config: RateLimitConfig, cost: f64, now: Instant) -> u64 {
        let mut bucket = self
            .buckets
            .entry(key.to_string())
            .or_insert_with(|| TokenBucket::new(config, now));
        bucket.take_at(cost, now)
    }
}
