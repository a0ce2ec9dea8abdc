//! Concurrency engine: a bounded worker pool that runs each item's
//! Stage1 -> Stage2 pipeline, consulting the cache, the reliability envelope
//! (rate limiter, breaker, retry executor), and the task queue, and feeding
//! completed artifacts to the ordered collector.
//!
//! Suspension points: cache get/put, rate-limiter acquire, breaker probe
//! admission, the LLM HTTP round-trip, queue state transitions, and the
//! collector high-watermark wait.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::breaker::CircuitBreakerRegistry;
use crate::cache::{fingerprint, CacheStore};
use crate::collector::OrderedCollector;
use crate::error::{ErrorKind, PipelineError};
use crate::llm::LlmClient;
use crate::models::{CacheStage, Checkpoint, QuarantinedItem, Stage1Artifact, Stage2Artifact, Task, TaskState};
use crate::rate_limit::RateLimiter;
use crate::repository::{BatchRepository, TaskQueueRepository};
use crate::retry::{classify_default, RetryExecutor};

/// Narrow capability for the downstream consumer of ordered Stage 2
/// artifacts. Output formatting is the caller's concern; callers of the
/// orchestrator supply an implementation of this trait to receive results.
pub trait ResultSink: Send {
    fn emit(&mut self, position: u64, artifact: Stage2Artifact) -> Result<(), PipelineError>;
}

/// A `ResultSink` that simply appends to an in-memory vector, for tests and
/// for the CLI binary's JSON-array output mode.
#[derive(Default)]
pub struct VecSink(pub Vec<(u64, Stage2Artifact)>);

impl ResultSink for VecSink {
    fn emit(&mut self, position: u64, artifact: Stage2Artifact) -> Result<(), PipelineError> {
        self.0.push((position, artifact));
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub workers: usize,
    pub timeout_item: Duration,
    pub stage1_tokens_estimate: f64,
    pub stage2_tokens_estimate: f64,
    pub rate_limit_acquire_timeout: Duration,
    pub max_attempts: u32,
    pub checkpoint_every_n: u64,
    /// Delay before requeueing an item that hit an open breaker, approximating
    /// the breaker's `break_duration` rather than the flat retry backoff used
    /// for ordinary transient failures.
    pub breaker_open_requeue_delay: Duration,
}

/// Aggregate outcome of one item's pipeline run, reported back to the
/// orchestrator for the batch report.
enum ItemOutcome {
    Completed { tokens: u64, cache_hit_stage1: bool, cache_hit_stage2: bool },
    Requeued,
    Quarantined(QuarantinedItem),
    Fatal(String),
}

/// Tracks collector draining, sink delivery, and checkpoint cadence as
/// items complete. Shared by every worker in a batch run.
struct BatchProgress {
    batch_id: String,
    collector: Arc<OrderedCollector<Stage2Artifact>>,
    sink: Mutex<Box<dyn ResultSink>>,
    batches: Arc<BatchRepository>,
    checkpoint_every_n: u64,
    since_checkpoint: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    quarantined: AtomicU64,
    last_processed_task_id: Mutex<Option<String>>,
    fatal_cause: Mutex<Option<String>>,
}

impl BatchProgress {
    /// First Fatal cause wins; later ones are logged but do not overwrite it.
    async fn set_fatal(&self, cause: String) {
        let mut slot = self.fatal_cause.lock().await;
        if slot.is_none() {
            *slot = Some(cause);
        }
    }
}

impl BatchProgress {
    /// Drains whatever contiguous prefix is now available and feeds it to
    /// the sink, writing a checkpoint at least every `checkpoint_every_n`
    /// emitted items.
    async fn advance(&self, task_id: &str) -> Result<(), PipelineError> {
        *self.last_processed_task_id.lock().await = Some(task_id.to_string());
        let drained = self.collector.drain();
        if drained.is_empty() {
            return Ok(());
        }
        let mut sink = self.sink.lock().await;
        for (position, artifact) in drained {
            sink.emit(position, artifact)?;
            if self.since_checkpoint.fetch_add(1, Ordering::SeqCst) + 1 >= self.checkpoint_every_n {
                self.since_checkpoint.store(0, Ordering::SeqCst);
                drop(sink);
                self.checkpoint().await?;
                sink = self.sink.lock().await;
            }
        }
        Ok(())
    }

    async fn checkpoint(&self) -> Result<(), PipelineError> {
        let checkpoint = Checkpoint {
            batch_id: self.batch_id.clone(),
            last_contiguous_position: self.collector.next_expected().saturating_sub(1),
            last_processed_task_id: self.last_processed_task_id.lock().await.clone(),
            completed: self.completed.load(Ordering::SeqCst),
            failed: self.failed.load(Ordering::SeqCst),
            quarantined: self.quarantined.load(Ordering::SeqCst),
            created_at: Utc::now(),
        };
        self.batches.save_checkpoint(&checkpoint)
    }

    /// Final checkpoint on clean shutdown, regardless of cadence.
    async fn final_checkpoint(&self) -> Result<(), PipelineError> {
        self.checkpoint().await
    }
}

/// Totals accumulated across one `run` call, read by the orchestrator to
/// build a `BatchReport`.
#[derive(Debug, Default, Clone)]
pub struct EngineSummary {
    pub tokens_used: u64,
    pub cache_hits_stage1: u64,
    pub cache_hits_stage2: u64,
    pub completed: u64,
    pub requeued: u64,
    pub quarantined: Vec<QuarantinedItem>,
    /// Set when a Fatal error aborted the batch before every item reached a
    /// terminal state; non-terminal tasks remain claimable by a later resume.
    pub fatal_cause: Option<String>,
}

pub struct ConcurrencyEngine {
    task_queue: Arc<TaskQueueRepository>,
    batches: Arc<BatchRepository>,
    cache: Arc<CacheStore>,
    rate_limiter: Arc<RateLimiter>,
    breakers: Arc<CircuitBreakerRegistry>,
    llm: Arc<dyn LlmClient>,
    retry: Arc<RetryExecutor>,
    config: EngineConfig,
}

impl ConcurrencyEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        task_queue: Arc<TaskQueueRepository>,
        batches: Arc<BatchRepository>,
        cache: Arc<CacheStore>,
        rate_limiter: Arc<RateLimiter>,
        breakers: Arc<CircuitBreakerRegistry>,
        llm: Arc<dyn LlmClient>,
        retry: Arc<RetryExecutor>,
        config: EngineConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            task_queue,
            batches,
            cache,
            rate_limiter,
            breakers,
            llm,
            retry,
            config,
        })
    }

    /// Runs every Pending/non-terminal task of `batch_id` to a terminal
    /// state, bounded to `config.workers` items in flight at once. Returns
    /// once the queue has no more claimable tasks and every spawned worker
    /// has finished (cancellation causes in-flight items to finish or bail
    /// at their next suspension point, but claims no new ones).
    pub async fn run(
        self: &Arc<Self>,
        batch_id: &str,
        collector: Arc<OrderedCollector<Stage2Artifact>>,
        sink: Box<dyn ResultSink>,
        cancel: CancellationToken,
    ) -> Result<EngineSummary, PipelineError> {
        let progress = Arc::new(BatchProgress {
            batch_id: batch_id.to_string(),
            collector: collector.clone(),
            sink: Mutex::new(sink),
            batches: self.batches.clone(),
            checkpoint_every_n: self.config.checkpoint_every_n.max(1),
            since_checkpoint: AtomicU64::new(0),
            completed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            quarantined: AtomicU64::new(0),
            last_processed_task_id: Mutex::new(None),
            fatal_cause: Mutex::new(None),
        });

        let semaphore = Arc::new(Semaphore::new(self.config.workers.max(1)));
        let mut joinset: JoinSet<ItemOutcome> = JoinSet::new();
        let summary = Mutex::new(EngineSummary::default());

        loop {
            if cancel.is_cancelled() {
                break;
            }

            // The in-process token only reaches a `cancel_batch` call against
            // this same `Orchestrator` instance; a separate process (e.g. the
            // CLI's `cancel` subcommand run against an already-running `run`)
            // can only persist the request, so poll for it here too.
            if self.batches.is_cancel_requested(batch_id)? {
                tracing::info!(batch_id, "cancellation requested, stopping claim loop");
                cancel.cancel();
                break;
            }

            let available = semaphore.available_permits();
            if available == 0 {
                if joinset.join_next().await.is_none() {
                    break;
                }
                continue;
            }

            let claimed = self.task_queue.claim(batch_id, available as u32)?;
            if claimed.is_empty() {
                if joinset.is_empty() {
                    break;
                }
                if let Some(outcome) = joinset.join_next().await {
                    Self::fold(&summary, outcome.map_err(|e| PipelineError::internal(e.to_string()))?).await;
                }
                continue;
            }

            for task in claimed {
                let permit = semaphore.clone().acquire_owned().await.expect("semaphore not closed");
                let engine = self.clone();
                let progress = progress.clone();
                let collector = collector.clone();
                let cancel = cancel.clone();
                joinset.spawn(async move {
                    let _permit = permit;
                    engine.process_item(task, &collector, &progress, &cancel).await
                });
            }
        }

        while let Some(outcome) = joinset.join_next().await {
            Self::fold(&summary, outcome.map_err(|e| PipelineError::internal(e.to_string()))?).await;
        }

        progress.final_checkpoint().await?;
        let mut summary = summary.into_inner();
        summary.fatal_cause = progress.fatal_cause.lock().await.clone();
        Ok(summary)
    }

    async fn fold(summary: &Mutex<EngineSummary>, outcome: ItemOutcome) {
        let mut summary = summary.lock().await;
        match outcome {
            ItemOutcome::Completed { tokens, cache_hit_stage1, cache_hit_stage2 } => {
                summary.tokens_used += tokens;
                summary.completed += 1;
                if cache_hit_stage1 {
                    summary.cache_hits_stage1 += 1;
                }
                if cache_hit_stage2 {
                    summary.cache_hits_stage2 += 1;
                }
            }
            ItemOutcome::Requeued => summary.requeued += 1,
            ItemOutcome::Quarantined(item) => summary.quarantined.push(item),
            ItemOutcome::Fatal(_) => {}
        }
    }

    /// Runs the end-to-end per-item pipeline under an item-level timeout,
    /// converting any failure into the appropriate task state transition.
    async fn process_item(
        self: &Arc<Self>,
        task: Task,
        collector: &OrderedCollector<Stage2Artifact>,
        progress: &BatchProgress,
        cancel: &CancellationToken,
    ) -> ItemOutcome {
        let outcome = tokio::select! {
            result = tokio::time::timeout(self.config.timeout_item, self.run_stages(&task, cancel)) => {
                match result {
                    Ok(inner) => inner,
                    Err(_elapsed) => Err(PipelineError::new(ErrorKind::Timeout, "item end-to-end timeout exceeded")),
                }
            }
            _ = cancel.cancelled() => Err(PipelineError::cancelled()),
        };

        let result = match outcome {
            Ok((tokens, hit1, hit2, artifact)) => {
                collector.submit(task.position, artifact);
                ItemOutcome::Completed { tokens, cache_hit_stage1: hit1, cache_hit_stage2: hit2 }
            }
            Err(err) => self.finalize_failure(&task, err, collector, progress, cancel).await,
        };

        match &result {
            ItemOutcome::Completed { .. } => {
                progress.completed.fetch_add(1, Ordering::SeqCst);
            }
            ItemOutcome::Quarantined(_) => {
                progress.quarantined.fetch_add(1, Ordering::SeqCst);
            }
            ItemOutcome::Requeued | ItemOutcome::Fatal(_) => {
                progress.failed.fetch_add(1, Ordering::SeqCst);
            }
        }

        if let Err(e) = progress.advance(&task.task_id).await {
            tracing::warn!(task_id = %task.task_id, error = %e, "failed to drain collector into sink");
        }

        result
    }

    async fn run_stages(
        self: &Arc<Self>,
        task: &Task,
        cancel: &CancellationToken,
    ) -> Result<(u64, bool, bool, Stage2Artifact), PipelineError> {
        let stage1_fp = fingerprint::stage1_fingerprint(&task.term, task.type_hint.as_deref());

        let llm = self.llm.clone();
        let term = task.term.clone();
        let type_hint = task.type_hint.clone();
        let position = task.position;
        let (stage1, tokens1, hit1) = self
            .cache
            .get_or_compute(CacheStage::Stage1, &stage1_fp, || {
                Self::call_stage1(self.breakers.clone(), self.rate_limiter.clone(), self.retry.clone(), llm, term, type_hint, position, self.config.stage1_tokens_estimate, self.config.rate_limit_acquire_timeout)
            })
            .await?;

        self.task_queue.mark_completed_stage1(&task.task_id, &stage1_fp)?;
        if cancel.is_cancelled() {
            return Err(PipelineError::cancelled());
        }

        let stage2_fp = fingerprint::stage2_fingerprint(&task.term, task.type_hint.as_deref(), &stage1_fp);
        let llm = self.llm.clone();
        let (mut stage2, tokens2, hit2): (Stage2Artifact, u64, bool) = self
            .cache
            .get_or_compute(CacheStage::Stage2, &stage2_fp, || {
                Self::call_stage2(self.breakers.clone(), self.rate_limiter.clone(), self.retry.clone(), llm, stage1.clone(), self.config.stage2_tokens_estimate, self.config.rate_limit_acquire_timeout)
            })
            .await?;

        // Never trust the LLM response for this: it is carried from the
        // Stage 1 artifact that produced these rows, not re-derived per call.
        for row in &mut stage2.rows {
            row.term_number = stage1.term_number;
        }

        self.task_queue.advance(&task.task_id, TaskState::Completed, None, Some(&stage1_fp), Some(&stage2_fp), false)?;
        Ok((tokens1 + tokens2, hit1, hit2, stage2))
    }

    async fn call_stage1(
        breakers: Arc<CircuitBreakerRegistry>,
        rate_limiter: Arc<RateLimiter>,
        retry: Arc<RetryExecutor>,
        llm: Arc<dyn LlmClient>,
        term: String,
        type_hint: Option<String>,
        position: u64,
        tokens_estimate: f64,
        acquire_timeout: Duration,
    ) -> Result<(Stage1Artifact, u64), PipelineError> {
        retry
            .execute(classify_default, move || {
                let breaker = breakers.get_or_create("stage1");
                let rate_limiter = rate_limiter.clone();
                let llm = llm.clone();
                let term = term.clone();
                let type_hint = type_hint.clone();
                async move {
                    let permit = breaker
                        .allow()
                        .ok_or_else(|| PipelineError::new(ErrorKind::BreakerOpen, "stage1 breaker open"))?;
                    rate_limiter.acquire("stage1", tokens_estimate, acquire_timeout).await?;

                    match llm.stage1(&term, type_hint.as_deref()).await {
                        Ok((mut artifact, tokens)) => {
                            artifact.term_number = position as u32;
                            breaker.on_success(&permit);
                            rate_limiter.reconcile("stage1", tokens_estimate, tokens as f64).await?;
                            Ok((artifact, tokens))
                        }
                        Err(err) => {
                            breaker.on_failure(&err.kind, &permit);
                            Err(err)
                        }
                    }
                }
            })
            .await
    }

    async fn call_stage2(
        breakers: Arc<CircuitBreakerRegistry>,
        rate_limiter: Arc<RateLimiter>,
        retry: Arc<RetryExecutor>,
        llm: Arc<dyn LlmClient>,
        stage1: Stage1Artifact,
        tokens_estimate: f64,
        acquire_timeout: Duration,
    ) -> Result<(Stage2Artifact, u64), PipelineError> {
        retry
            .execute(classify_default, move || {
                let breaker = breakers.get_or_create("stage2");
                let rate_limiter = rate_limiter.clone();
                let llm = llm.clone();
                let stage1 = stage1.clone();
                async move {
                    let permit = breaker
                        .allow()
                        .ok_or_else(|| PipelineError::new(ErrorKind::BreakerOpen, "stage2 breaker open"))?;
                    rate_limiter.acquire("stage2", tokens_estimate, acquire_timeout).await?;

                    match llm.stage2(&stage1.term, &stage1).await {
                        Ok((artifact, tokens)) => {
                            breaker.on_success(&permit);
                            rate_limiter.reconcile("stage2", tokens_estimate, tokens as f64).await?;
                            Ok((artifact, tokens))
                        }
                        Err(err) => {
                            breaker.on_failure(&err.kind, &permit);
                            Err(err)
                        }
                    }
                }
            })
            .await
    }

    /// A stage failed (after the retry executor exhausted its attempts, or
    /// hit a Terminal/Fatal classification). Moves the task to Failed,
    /// marks the item Quarantined if retries are exhausted, otherwise
    /// returns it to Pending after a short backoff so another claim picks
    /// it up.
    async fn finalize_failure(
        &self,
        task: &Task,
        err: PipelineError,
        collector: &OrderedCollector<Stage2Artifact>,
        progress: &BatchProgress,
        cancel: &CancellationToken,
    ) -> ItemOutcome {
        // Non-retryable within the current attempt, but retryable at the
        // batch level once the breaker's break_duration has elapsed: wait it
        // out and requeue without spending any of the item's retry budget,
        // rather than racing the breaker's recovery with a sub-second backoff.
        if err.kind.is_breaker_open() {
            if let Err(e) = self.task_queue.advance(&task.task_id, TaskState::Failed, Some(&err), None, None, false) {
                tracing::warn!(task_id = %task.task_id, error = %e, "failed to record breaker-open failure");
            }
            tracing::info!(
                task_id = %task.task_id,
                position = task.position,
                delay_s = self.config.breaker_open_requeue_delay.as_secs_f64(),
                "breaker open, requeueing to wait out break_duration instead of spending a retry attempt"
            );
            tokio::time::sleep(self.config.breaker_open_requeue_delay).await;
            if let Err(e) = self.task_queue.advance(&task.task_id, TaskState::Pending, None, None, None, false) {
                tracing::warn!(task_id = %task.task_id, error = %e, "failed to re-enqueue task after breaker-open wait");
            }
            return ItemOutcome::Requeued;
        }

        let new_retry_count = task.retry_count + 1;

        if let Err(e) = self.task_queue.advance(&task.task_id, TaskState::Failed, Some(&err), None, None, true) {
            tracing::warn!(task_id = %task.task_id, error = %e, "failed to record task failure");
        }

        if err.kind.is_fatal_for_batch() {
            tracing::error!(task_id = %task.task_id, kind = %err.kind, message = %err.message, "fatal error, aborting batch");
            progress.set_fatal(err.message.clone()).await;
            cancel.cancel();
            return ItemOutcome::Fatal(err.message);
        }

        if new_retry_count >= self.config.max_attempts {
            let item = QuarantinedItem {
                position: task.position,
                term: task.term.clone(),
                error_kind: err.kind.as_str().to_string(),
                attempt_count: new_retry_count,
            };
            if let Err(e) = self.task_queue.advance(&task.task_id, TaskState::Quarantined, None, None, None, false) {
                tracing::warn!(task_id = %task.task_id, error = %e, "failed to quarantine task");
            }
            collector.mark_skipped(task.position, err.kind.to_string());
            tracing::warn!(position = task.position, term = %task.term, kind = %err.kind, "item quarantined after exhausting retries");
            ItemOutcome::Quarantined(item)
        } else {
            let delay = Duration::from_millis(200 * new_retry_count as u64);
            tokio::time::sleep(delay).await;
            if let Err(e) = self.task_queue.advance(&task.task_id, TaskState::Pending, None, None, None, false) {
                tracing::warn!(task_id = %task.task_id, error = %e, "failed to re-enqueue task after failure");
            }
            ItemOutcome::Requeued
        }
    }
}
