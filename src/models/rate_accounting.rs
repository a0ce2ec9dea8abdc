//! Rate-limit accounting record: per-window request/token counts, persisted
//! for observability and quota continuity across restarts.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateAccountingRecord {
    pub service: String,
    pub window_start: DateTime<Utc>,
    pub requests: u64,
    pub tokens: u64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RateLimiterSnapshot {
    pub tokens_available: f64,
    pub requests_available: f64,
    pub refill_tokens_per_sec: f64,
    pub refill_requests_per_sec: f64,
}
