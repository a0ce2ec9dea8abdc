//! Data models for the flashcard pipeline core.

mod batch;
mod breaker_state;
mod cache_entry;
mod checkpoint;
mod rate_accounting;
mod stage1;
mod stage2;
mod task;
mod vocabulary;

pub use batch::{Batch, BatchReport, BatchStatus, CacheHitCounts, QuarantinedItem};
pub use breaker_state::{BreakerState, BreakerStateRecord};
pub use cache_entry::{CacheCodec, CacheEntryMeta, CacheStage, CacheStats};
pub use checkpoint::Checkpoint;
pub use rate_accounting::{RateAccountingRecord, RateLimiterSnapshot};
pub use stage1::{RelatedTermComparison, Stage1Artifact};
pub use stage2::{HonorificLevel, Stage2Artifact, Stage2Row};
pub use task::{Stage, Task, TaskState};
pub use vocabulary::VocabularyItem;
