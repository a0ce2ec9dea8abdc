//! Checkpoint: serialized pointer allowing resume.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub batch_id: String,
    /// Longest contiguous prefix (from position 1) that has been emitted to
    /// the sink or explicitly marked skipped.
    pub last_contiguous_position: u64,
    pub last_processed_task_id: Option<String>,
    pub completed: u64,
    pub failed: u64,
    pub quarantined: u64,
    pub created_at: DateTime<Utc>,
}
