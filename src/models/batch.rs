//! Batch: a collection of tasks submitted together.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    Pending,
    InProgress,
    Completed,
    /// Completed with one or more quarantined items.
    Partial,
    /// Aborted for a Fatal reason.
    Failed,
}

impl BatchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BatchStatus::Pending => "pending",
            BatchStatus::InProgress => "in_progress",
            BatchStatus::Completed => "completed",
            BatchStatus::Partial => "partial",
            BatchStatus::Failed => "failed",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        Some(match s {
            "pending" => BatchStatus::Pending,
            "in_progress" => BatchStatus::InProgress,
            "completed" => BatchStatus::Completed,
            "partial" => BatchStatus::Partial,
            "failed" => BatchStatus::Failed,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Batch {
    pub batch_id: String,
    pub total_items: u64,
    pub completed: u64,
    pub failed: u64,
    pub quarantined: u64,
    pub status: BatchStatus,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

/// One quarantined item surfaced in a `BatchReport`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuarantinedItem {
    pub position: u64,
    pub term: String,
    pub error_kind: String,
    pub attempt_count: u32,
}

/// Per-stage cache hit counters.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct CacheHitCounts {
    pub stage1: u64,
    pub stage2: u64,
}

/// Report returned by `run_batch` / `resume_batch`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchReport {
    pub batch_id: String,
    pub status: BatchStatus,
    pub total_items: u64,
    pub completed: u64,
    pub quarantined_count: u64,
    pub tokens_used: u64,
    pub cache_hits: CacheHitCounts,
    pub elapsed: std::time::Duration,
    pub quarantined: Vec<QuarantinedItem>,
    /// Set when the batch aborted for a Fatal reason.
    pub fatal_cause: Option<String>,
}

impl BatchReport {
    pub fn empty(batch_id: impl Into<String>) -> Self {
        Self {
            batch_id: batch_id.into(),
            status: BatchStatus::Completed,
            total_items: 0,
            completed: 0,
            quarantined_count: 0,
            tokens_used: 0,
            cache_hits: CacheHitCounts::default(),
            elapsed: std::time::Duration::ZERO,
            quarantined: Vec::new(),
            fatal_cause: None,
        }
    }
}
