//! Orchestrator: wires the repositories, cache, reliability envelope, and
//! concurrency engine into the three operations callers actually invoke —
//! `run_batch`, `resume_batch`, `cancel_batch` — and owns the durable state
//! each one reads or writes.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::breaker::CircuitBreakerRegistry;
use crate::cache::CacheStore;
use crate::collector::OrderedCollector;
use crate::config::PipelineConfig;
use crate::engine::{ConcurrencyEngine, EngineConfig, EngineSummary, ResultSink};
use crate::error::{ErrorKind, PipelineError};
use crate::llm::LlmClient;
use crate::models::{
    Batch, BatchReport, BatchStatus, BreakerStateRecord, CacheHitCounts, QuarantinedItem, Stage2Artifact,
    VocabularyItem,
};
use crate::rate_limit::RateLimiter;
use crate::repository::{
    BatchRepository, BreakerStateRepository, CacheMetaRepository, RateAccountingRepository, TaskQueueRepository,
};
use crate::retry::RetryExecutor;

/// Filenames for the embedded SQLite databases, one per repository, plus the
/// cache blob directory. All live directly under the orchestrator's data
/// directory.
mod layout {
    pub const TASKS_DB: &str = "tasks.db";
    pub const BATCHES_DB: &str = "batches.db";
    pub const CACHE_DB: &str = "cache.db";
    pub const CACHE_BLOBS: &str = "cache_blobs";
    pub const RATE_ACCOUNTING_DB: &str = "rate_accounting.db";
    pub const BREAKER_STATE_DB: &str = "breaker_state.db";
}

/// In-memory LRU capacity for the cache's hot layer; independent of the
/// durable `cache.max_bytes` budget enforced by eviction.
const CACHE_MEMORY_CAPACITY: usize = 4096;

pub struct Orchestrator {
    config: PipelineConfig,
    task_queue: Arc<TaskQueueRepository>,
    batches: Arc<BatchRepository>,
    cache: Arc<CacheStore>,
    rate_limiter: Arc<RateLimiter>,
    breakers: Arc<CircuitBreakerRegistry>,
    rate_accounting: Arc<RateAccountingRepository>,
    breaker_state: Arc<BreakerStateRepository>,
    llm: Arc<dyn LlmClient>,
    retry: Arc<RetryExecutor>,
    active: StdMutex<HashMap<String, CancellationToken>>,
}

impl Orchestrator {
    pub fn new(config: PipelineConfig, llm: Arc<dyn LlmClient>, data_dir: &Path) -> Result<Self, PipelineError> {
        config.validate()?;
        std::fs::create_dir_all(data_dir)
            .map_err(|e| PipelineError::persistence(format!("creating data directory {}: {e}", data_dir.display())))?;

        let db_path = |name: &str| -> PathBuf { data_dir.join(name) };

        let task_queue = Arc::new(TaskQueueRepository::new(&db_path(layout::TASKS_DB))?);
        let batches = Arc::new(BatchRepository::new(&db_path(layout::BATCHES_DB))?);
        let cache_meta = Arc::new(CacheMetaRepository::new(&db_path(layout::CACHE_DB), &data_dir.join(layout::CACHE_BLOBS))?);
        let cache = Arc::new(CacheStore::new(cache_meta, config.cache.codec, config.cache.hot_threshold, CACHE_MEMORY_CAPACITY));
        let rate_limiter = Arc::new(RateLimiter::new(config.rate_limit_configs()));
        let breakers = Arc::new(CircuitBreakerRegistry::new(config.breaker_config()));
        let rate_accounting = Arc::new(RateAccountingRepository::new(&db_path(layout::RATE_ACCOUNTING_DB))?);
        let breaker_state = Arc::new(BreakerStateRepository::new(&db_path(layout::BREAKER_STATE_DB))?);
        let retry = Arc::new(RetryExecutor::new(config.retry_policy()));

        Ok(Self {
            config,
            task_queue,
            batches,
            cache,
            rate_limiter,
            breakers,
            rate_accounting,
            breaker_state,
            llm,
            retry,
            active: StdMutex::new(HashMap::new()),
        })
    }

    /// Logs whatever reliability state survived a previous process, for
    /// operator visibility at startup. The rate limiter and circuit breakers
    /// always start Closed / at full burst regardless of what is logged
    /// here — replaying a possibly-stale persisted phase into a fresh
    /// process is a worse failure mode than a breaker that re-trips quickly
    /// against a still-unhealthy provider.
    pub fn bootstrap(&self) -> Result<(), PipelineError> {
        for service in ["stage1", "stage2"] {
            if let Some(record) = self.breaker_state.load(service)? {
                tracing::info!(service, state = record.state.as_str(), failures = record.failures, "loaded prior breaker state (observational only)");
            }
            if let Some(record) = self.rate_accounting.load(service)? {
                tracing::info!(service, requests = record.requests, tokens = record.tokens, "loaded prior rate accounting window (observational only)");
            }
        }
        Ok(())
    }

    fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            workers: self.config.workers,
            timeout_item: Duration::from_secs(self.config.timeout_item_s),
            stage1_tokens_estimate: self.config.stage1_tpm / self.config.stage1_rpm.max(1.0),
            stage2_tokens_estimate: self.config.stage2_tpm / self.config.stage2_rpm.max(1.0),
            rate_limit_acquire_timeout: Duration::from_secs(self.config.timeout_stage1_s.max(self.config.timeout_stage2_s)),
            max_attempts: self.config.retry.max_attempts,
            checkpoint_every_n: self.config.checkpoint.every_n,
            breaker_open_requeue_delay: Duration::from_secs(self.config.breaker.break_duration_s),
        }
    }

    fn engine(&self) -> Arc<ConcurrencyEngine> {
        ConcurrencyEngine::new(
            self.task_queue.clone(),
            self.batches.clone(),
            self.cache.clone(),
            self.rate_limiter.clone(),
            self.breakers.clone(),
            self.llm.clone(),
            self.retry.clone(),
            self.engine_config(),
        )
    }

    fn register(&self, batch_id: &str) -> CancellationToken {
        let token = CancellationToken::new();
        self.active.lock().unwrap().insert(batch_id.to_string(), token.clone());
        token
    }

    fn unregister(&self, batch_id: &str) {
        self.active.lock().unwrap().remove(batch_id);
    }

    /// Submits a fresh batch and drives it to completion (or to a Fatal
    /// abort / external cancellation), streaming ordered Stage 2 artifacts
    /// to `sink` as they become available.
    pub async fn run_batch(&self, items: Vec<VocabularyItem>, sink: Box<dyn ResultSink>) -> Result<BatchReport, PipelineError> {
        for item in &items {
            item.validate()?;
        }

        let batch_id = Uuid::new_v4().to_string();
        let start = Instant::now();

        self.batches.create(&batch_id, items.len() as u64)?;
        self.task_queue.enqueue(&batch_id, &items)?;
        self.batches.set_status(&batch_id, BatchStatus::InProgress)?;

        let collector = Arc::new(OrderedCollector::new(1));
        self.drive(&batch_id, collector, sink, start).await
    }

    /// Resumes a batch left in a non-terminal state by a previous process:
    /// stale Processing tasks are reclaimed to Pending, and the collector is
    /// seeded from the last saved checkpoint so already-emitted positions
    /// are never re-emitted.
    pub async fn resume_batch(&self, batch_id: &str, sink: Box<dyn ResultSink>) -> Result<BatchReport, PipelineError> {
        let batch = self
            .batches
            .get(batch_id)?
            .ok_or_else(|| PipelineError::new(ErrorKind::SchemaValidation, format!("unknown batch '{batch_id}'")))?;

        let reclaimed = self.task_queue.reclaim_stale(batch_id, chrono::Duration::seconds(-1))?;
        if reclaimed > 0 {
            tracing::info!(batch_id, reclaimed, "reclaimed stale in-flight tasks on resume");
        }

        let checkpoint = self.batches.load_checkpoint(batch_id)?;
        let start_position = checkpoint.map(|c| c.last_contiguous_position + 1).unwrap_or(1);

        // A resume is an explicit request to keep going; drop any
        // cancellation persisted by an earlier `cancel_batch` call so the
        // engine's claim loop doesn't cancel itself before claiming anything.
        self.batches.clear_cancel_request(batch_id)?;
        self.batches.set_status(batch_id, BatchStatus::InProgress)?;
        let collector = Arc::new(OrderedCollector::new(start_position));
        let start = Instant::now();
        let _ = batch;
        self.drive(batch_id, collector, sink, start).await
    }

    /// Requests that `batch_id` stop claiming new tasks; items already in
    /// flight finish or bail at their next suspension point. Persists the
    /// request so it reaches the batch's claim loop even when it is being
    /// driven by a different process (e.g. the CLI's `cancel` subcommand
    /// against an already-running `run`/`resume` invocation); also wakes the
    /// in-process cancellation token immediately if this `Orchestrator`
    /// instance happens to be the one driving it. A no-op if `batch_id` does
    /// not exist.
    pub fn cancel_batch(&self, batch_id: &str) -> Result<(), PipelineError> {
        self.batches.request_cancel(batch_id)?;
        if let Some(token) = self.active.lock().unwrap().get(batch_id) {
            token.cancel();
        }
        Ok(())
    }

    /// Batch ids currently being driven by this process. Lets a caller (a
    /// test, or operational tooling) discover an in-flight batch's generated
    /// id before `run_batch` returns it.
    pub fn active_batch_ids(&self) -> Vec<String> {
        self.active.lock().unwrap().keys().cloned().collect()
    }

    /// Current batch row plus a per-state task count, for a `status`
    /// command that doesn't need to hold `active`'s lock or run anything.
    pub fn batch_status(&self, batch_id: &str) -> Result<(Batch, HashMap<String, u64>), PipelineError> {
        let batch = self
            .batches
            .get(batch_id)?
            .ok_or_else(|| PipelineError::new(ErrorKind::SchemaValidation, format!("unknown batch '{batch_id}'")))?;
        let counts = self.task_queue.counts_by_state(batch_id)?;
        Ok((batch, counts))
    }

    async fn drive(
        &self,
        batch_id: &str,
        collector: Arc<OrderedCollector<Stage2Artifact>>,
        sink: Box<dyn ResultSink>,
        start: Instant,
    ) -> Result<BatchReport, PipelineError> {
        let cancel = self.register(batch_id);
        let engine = self.engine();
        let result = engine.run(batch_id, collector, sink, cancel).await;
        self.unregister(batch_id);

        let summary = match result {
            Ok(summary) => summary,
            Err(err) => {
                self.batches.set_status(batch_id, BatchStatus::Failed)?;
                return Err(err);
            }
        };

        self.finalize_batch(batch_id, start.elapsed(), summary).await
    }

    async fn finalize_batch(&self, batch_id: &str, elapsed: Duration, summary: EngineSummary) -> Result<BatchReport, PipelineError> {
        let batch = self
            .batches
            .get(batch_id)?
            .unwrap_or_else(|| Batch {
                batch_id: batch_id.to_string(),
                total_items: 0,
                completed: 0,
                failed: 0,
                quarantined: 0,
                status: BatchStatus::InProgress,
                started_at: Utc::now(),
                ended_at: None,
            });

        let counts = self.task_queue.counts_by_state(batch_id)?;
        let completed = counts.get("completed").copied().unwrap_or(0);
        let failed = counts.get("failed").copied().unwrap_or(0);
        let quarantined = counts.get("quarantined").copied().unwrap_or(0);

        let status = if summary.fatal_cause.is_some() {
            BatchStatus::Failed
        } else if completed + quarantined == batch.total_items {
            if quarantined > 0 { BatchStatus::Partial } else { BatchStatus::Completed }
        } else {
            // Stopped short of every item reaching a terminal state, most
            // likely an external cancel_batch call; resumable via
            // resume_batch rather than a fresh run_batch.
            BatchStatus::Partial
        };

        self.batches.update_counts(batch_id, completed, failed, quarantined)?;
        self.batches.set_status(batch_id, status)?;
        self.persist_reliability_state().await?;

        Ok(BatchReport {
            batch_id: batch_id.to_string(),
            status,
            total_items: batch.total_items,
            completed,
            quarantined_count: quarantined,
            tokens_used: summary.tokens_used,
            cache_hits: CacheHitCounts { stage1: summary.cache_hits_stage1, stage2: summary.cache_hits_stage2 },
            elapsed,
            quarantined: summary.quarantined,
            fatal_cause: summary.fatal_cause,
        })
    }

    /// Persists the circuit breakers' and rate limiter's current state for
    /// forensics and the cache-friendly log line, not for hot-reload: see
    /// `bootstrap`'s doc comment for why a fresh process never replays it.
    async fn persist_reliability_state(&self) -> Result<(), PipelineError> {
        for service in ["stage1", "stage2"] {
            let snapshot = self.breakers.get_or_create(service).state();
            self.breaker_state.save(&BreakerStateRecord {
                service: service.to_string(),
                state: snapshot.state,
                window_start: Utc::now(),
                failures: snapshot.failures_in_window,
                successes: snapshot.successes_in_window,
                opened_at: snapshot.opened_at,
            })?;

            let record = self.rate_limiter.accounting_record(service).await?;
            self.rate_accounting.save(&record)?;
        }
        Ok(())
    }

    /// Items currently sitting in the quarantine table for `batch_id`,
    /// reconstructed from persisted state (used by a caller inspecting a
    /// batch report from a previous process rather than the one that ran
    /// it, where `BatchReport::quarantined` would be empty).
    pub fn quarantined_items(&self, batch_id: &str) -> Result<Vec<QuarantinedItem>, PipelineError> {
        self.task_queue
            .quarantined(batch_id)?
            .into_iter()
            .map(|task| {
                Ok(QuarantinedItem {
                    position: task.position,
                    term: task.term,
                    error_kind: task.last_error_kind.map(|k| k.as_str().to_string()).unwrap_or_default(),
                    attempt_count: task.retry_count,
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::VecSink;
    use crate::models::{HonorificLevel, Stage1Artifact, Stage2Row};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tempfile::tempdir;

    struct FakeLlm {
        calls: AtomicU32,
    }

    #[async_trait]
    impl LlmClient for FakeLlm {
        async fn stage1(&self, term: &str, _type_hint: Option<&str>) -> Result<(Stage1Artifact, u64), PipelineError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok((
                Stage1Artifact {
                    term: term.to_string(),
                    term_number: 0,
                    pronunciation: "pron".to_string(),
                    part_of_speech: "noun".to_string(),
                    primary_meaning: "meaning".to_string(),
                    secondary_meanings: vec![],
                    metaphor: "metaphor".to_string(),
                    anchor: "anchor".to_string(),
                    comparison: None,
                    homonyms: vec![],
                    keywords: vec![],
                },
                50,
            ))
        }

        async fn stage2(&self, term: &str, _stage1_artifact: &Stage1Artifact) -> Result<(Stage2Artifact, u64), PipelineError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok((
                Stage2Artifact {
                    term: term.to_string(),
                    rows: vec![Stage2Row {
                        row_position: 1,
                        term: term.to_string(),
                        term_number: 1,
                        tab_name: "default".to_string(),
                        primer: "primer".to_string(),
                        front: format!("front {term}"),
                        back: "back".to_string(),
                        tags: vec![],
                        honorific_level: HonorificLevel::Neutral,
                    }],
                },
                80,
            ))
        }
    }

    fn orchestrator(dir: &std::path::Path) -> Orchestrator {
        let mut config = PipelineConfig::default();
        config.workers = 4;
        config.checkpoint.every_n = 1;
        Orchestrator::new(config, Arc::new(FakeLlm { calls: AtomicU32::new(0) }), dir).unwrap()
    }

    #[tokio::test]
    async fn run_batch_emits_every_item_in_order() {
        let dir = tempdir().unwrap();
        let orchestrator = orchestrator(dir.path());

        let items = (1..=5).map(|p| VocabularyItem::new(p, format!("term-{p}"), None)).collect();
        let report = orchestrator.run_batch(items, Box::new(VecSink::default())).await.unwrap();

        assert_eq!(report.status, BatchStatus::Completed);
        assert_eq!(report.completed, 5);
        assert_eq!(report.quarantined_count, 0);
    }

    #[tokio::test]
    async fn run_batch_rejects_invalid_items_before_creating_a_batch() {
        let dir = tempdir().unwrap();
        let orchestrator = orchestrator(dir.path());

        let items = vec![VocabularyItem::new(0, "bad", None)];
        let err = orchestrator.run_batch(items, Box::new(VecSink::default())).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::SchemaValidation);
    }

    #[tokio::test]
    async fn cancel_of_unknown_batch_is_a_harmless_no_op() {
        let dir = tempdir().unwrap();
        let orchestrator = orchestrator(dir.path());
        orchestrator.cancel_batch("does-not-exist").unwrap();
    }
}
