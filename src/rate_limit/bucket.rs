//! Token bucket primitive shared by the request and token buckets of a
//! single logical service.

use std::time::{Duration, Instant};

/// A classic token bucket: capacity caps the burst, refill_per_sec replenishes
/// continuously. `tokens` is tracked as a float so fractional refill between
/// calls is not lost to rounding.
#[derive(Debug)]
pub struct TokenBucket {
    capacity: f64,
    tokens: f64,
    refill_per_sec: f64,
    last_refill: Instant,
}

impl TokenBucket {
    pub fn new(capacity: f64, refill_per_sec: f64) -> Self {
        Self {
            capacity,
            tokens: capacity,
            refill_per_sec,
            last_refill: Instant::now(),
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        if elapsed > 0.0 {
            self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.capacity);
            self.last_refill = now;
        }
    }

    /// Attempt to debit `amount`. Returns true and deducts on success.
    pub fn try_take(&mut self, amount: f64, now: Instant) -> bool {
        self.refill(now);
        if self.tokens >= amount {
            self.tokens -= amount;
            true
        } else {
            false
        }
    }

    /// Credit back `amount` (used by `reconcile` when an estimate overshot).
    pub fn refund(&mut self, amount: f64) {
        self.tokens = (self.tokens + amount).min(self.capacity);
    }

    /// Additional debit beyond what was already taken (used by `reconcile`
    /// when an estimate undershot the actual usage). Allowed to go negative
    /// so the next caller pays down the deficit rather than the provider
    /// being under-debited.
    pub fn debit_extra(&mut self, amount: f64) {
        self.tokens -= amount;
    }

    /// Seconds until `amount` tokens will be available, given the current
    /// level and refill rate. Zero if already available.
    pub fn wait_time(&self, amount: f64, now: Instant) -> Duration {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        let projected = (self.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        if projected >= amount || self.refill_per_sec <= 0.0 {
            return Duration::ZERO;
        }
        let deficit = amount - projected;
        Duration::from_secs_f64((deficit / self.refill_per_sec).max(0.0))
    }

    pub fn available(&self, now: Instant) -> f64 {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        (self.tokens + elapsed * self.refill_per_sec).min(self.capacity)
    }

    pub fn refill_per_sec(&self) -> f64 {
        self.refill_per_sec
    }
}
