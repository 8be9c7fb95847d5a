//! Token-bucket rate limiting.
//!
//! One bucket per key, created lazily from the operator-supplied config
//! (unknown keys use the default). `tokens` is a continuous function of
//! wall-clock time given `last_refill`; it never exceeds capacity and never
//! goes negative.

use dashmap::DashMap;
use std::collections::HashMap;
use tokio::time::Instant;
use tracing::trace;

/// Capacity and refill rate of one bucket.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BucketConfig {
    /// Maximum tokens.
    pub capacity: f64,
    /// Tokens regained per second.
    pub refill_rate: f64,
}

impl BucketConfig {
    /// A bucket allowing `n` calls per minute with matching burst.
    #[must_use]
    pub fn per_minute(n: f64) -> Self {
        Self {
            capacity: n,
            refill_rate: n / 60.0,
        }
    }
}

/// Outcome of a `check` or `consume`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateDecision {
    /// Whether the tokens were available (and, for `consume`, taken).
    pub allowed: bool,
    /// Whole tokens left after the operation.
    pub remaining: u64,
    /// For denials: milliseconds until the requested tokens exist.
    pub retry_after_ms: u64,
}

#[derive(Debug)]
struct Bucket {
    config: BucketConfig,
    tokens: f64,
    last_refill: Instant,
}

impl Bucket {
    fn new(config: BucketConfig) -> Self {
        Self {
            config,
            tokens: config.capacity,
            last_refill: Instant::now(),
        }
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.config.refill_rate).min(self.config.capacity);
        self.last_refill = now;
    }

    fn take(&mut self, n: f64, commit: bool) -> RateDecision {
        self.refill();
        if self.tokens >= n {
            if commit {
                self.tokens -= n;
            }
            RateDecision {
                allowed: true,
                remaining: self.tokens.floor() as u64,
                retry_after_ms: 0,
            }
        } else {
            let deficit = n - self.tokens;
            let retry_after_ms = if self.config.refill_rate > 0.0 {
                (deficit / self.config.refill_rate * 1000.0).ceil() as u64
            } else {
                // Nothing ever refills; the caller can only back off.
                u64::MAX
            };
            RateDecision {
                allowed: false,
                remaining: 0,
                retry_after_ms,
            }
        }
    }
}

/// Keyed token buckets with per-key mutual exclusion.
#[derive(Debug)]
pub struct RateLimiter {
    buckets: DashMap<String, Bucket>,
    default: BucketConfig,
    overrides: HashMap<String, BucketConfig>,
}

impl RateLimiter {
    /// Create a limiter with a default bucket config.
    #[must_use]
    pub fn new(default: BucketConfig) -> Self {
        Self {
            buckets: DashMap::new(),
            default,
            overrides: HashMap::new(),
        }
    }

    /// Add a per-key override.
    #[must_use]
    pub fn with_override(mut self, key: impl Into<String>, config: BucketConfig) -> Self {
        self.overrides.insert(key.into(), config);
        self
    }

    fn config_for(&self, key: &str) -> BucketConfig {
        self.overrides.get(key).copied().unwrap_or(self.default)
    }

    /// Take `n` tokens from `key`'s bucket, creating it on first use.
    pub fn consume(&self, key: &str, n: f64) -> RateDecision {
        let config = self.config_for(key);
        let mut bucket = self
            .buckets
            .entry(key.to_string())
            .or_insert_with(|| Bucket::new(config));
        let decision = bucket.take(n, true);
        trace!(key, allowed = decision.allowed, remaining = decision.remaining, "rate limit");
        decision
    }

    /// Would `n` tokens be available? Nothing is taken.
    pub fn check(&self, key: &str, n: f64) -> RateDecision {
        let config = self.config_for(key);
        let mut bucket = self
            .buckets
            .entry(key.to_string())
            .or_insert_with(|| Bucket::new(config));
        bucket.take(n, false)
    }

    /// Drop a key's bucket; the next use starts full.
    pub fn reset(&self, key: &str) {
        self.buckets.remove(key);
    }
}
