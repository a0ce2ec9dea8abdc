//! Task state machine: one item's journey through the pipeline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ErrorKind;

/// Which LLM stage a task is currently suspended in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Stage {
    Stage1,
    Stage2,
}

/// Task state machine:
/// Pending -> Processing(stage) -> CompletedStage1 -> Processing(2) -> Completed,
/// or any non-terminal state -> Failed -> (retry) Processing,
/// or Failed with retry_count >= max -> Quarantined.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskState {
    Pending,
    Processing(Stage),
    CompletedStage1,
    Completed,
    Failed,
    Quarantined,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskState::Completed | TaskState::Quarantined)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskState::Pending => "pending",
            TaskState::Processing(Stage::Stage1) => "processing_stage1",
            TaskState::Processing(Stage::Stage2) => "processing_stage2",
            TaskState::CompletedStage1 => "completed_stage1",
            TaskState::Completed => "completed",
            TaskState::Failed => "failed",
            TaskState::Quarantined => "quarantined",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        Some(match s {
            "pending" => TaskState::Pending,
            "processing_stage1" => TaskState::Processing(Stage::Stage1),
            "processing_stage2" => TaskState::Processing(Stage::Stage2),
            "completed_stage1" => TaskState::CompletedStage1,
            "completed" => TaskState::Completed,
            "failed" => TaskState::Failed,
            "quarantined" => TaskState::Quarantined,
            _ => return None,
        })
    }
}

/// One item's journey through the pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub task_id: String,
    pub batch_id: String,
    pub position: u64,
    pub term: String,
    pub type_hint: Option<String>,
    pub state: TaskState,
    pub retry_count: u32,
    pub last_error: Option<String>,
    pub last_error_kind: Option<ErrorKind>,
    pub stage1_fingerprint: Option<String>,
    pub stage2_fingerprint: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Claim token set when a task moves into Processing, used to detect a
    /// crashed worker (a task Processing longer than T with a stale claim is
    /// reclaimable).
    pub claim_token: Option<String>,
    pub claimed_at: Option<DateTime<Utc>>,
}

impl Task {
    pub fn new(task_id: String, batch_id: String, position: u64, term: String, type_hint: Option<String>) -> Self {
        let now = Utc::now();
        Self {
            task_id,
            batch_id,
            position,
            term,
            type_hint,
            state: TaskState::Pending,
            retry_count: 0,
            last_error: None,
            last_error_kind: None,
            stage1_fingerprint: None,
            stage2_fingerprint: None,
            created_at: now,
            updated_at: now,
            claim_token: None,
            claimed_at: None,
        }
    }
}
