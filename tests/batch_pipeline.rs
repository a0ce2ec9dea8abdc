//! End-to-end coverage of `Orchestrator` against a fake LLM backend: ordered
//! output under concurrency, retry-then-success, permanent failure ending in
//! quarantine, and cancel/resume across two separate runs.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tempfile::tempdir;

use flashcard_pipeline::engine::VecSink;
use flashcard_pipeline::error::{ErrorKind, PipelineError};
use flashcard_pipeline::llm::LlmClient;
use flashcard_pipeline::models::{HonorificLevel, Stage1Artifact, Stage2Artifact, Stage2Row};
use flashcard_pipeline::{BatchReport, Orchestrator, PipelineConfig, VocabularyItem};
use flashcard_pipeline::models::BatchStatus;

fn stage1_for(term: &str) -> Stage1Artifact {
    Stage1Artifact {
        term: term.to_string(),
        term_number: 0,
        pronunciation: "pron".to_string(),
        part_of_speech: "noun".to_string(),
        primary_meaning: format!("meaning of {term}"),
        secondary_meanings: vec![],
        metaphor: "metaphor".to_string(),
        anchor: "anchor".to_string(),
        comparison: None,
        homonyms: vec![],
        keywords: vec![],
    }
}

fn stage2_for(term: &str) -> Stage2Artifact {
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
    }
}

/// A fake LLM backend whose behavior per term is configurable: always
/// succeed, fail a fixed number of times before succeeding (simulating a
/// transient provider hiccup the retry executor should absorb), or fail
/// permanently (simulating a response the pipeline can never parse).
#[derive(Clone, Default)]
struct ScriptedLlm {
    /// term -> remaining failures before success. Absent term: always
    /// succeeds. Present with `u32::MAX`: fails forever (terminal error).
    failures_remaining: Arc<Mutex<HashMap<String, u32>>>,
    calls: Arc<AtomicU32>,
    /// Artificial per-call latency, so a test can reliably observe a batch
    /// still in flight instead of racing a near-instant fake backend.
    call_delay: Duration,
}

impl ScriptedLlm {
    fn fail_then_succeed(terms: &[(&str, u32)]) -> Self {
        let map = terms.iter().map(|(t, n)| (t.to_string(), *n)).collect();
        Self { failures_remaining: Arc::new(Mutex::new(map)), calls: Arc::new(AtomicU32::new(0)), call_delay: Duration::ZERO }
    }

    fn slow(call_delay: Duration) -> Self {
        Self { call_delay, ..Default::default() }
    }

    fn take_failure(&self, term: &str) -> Option<PipelineError> {
        let mut guard = self.failures_remaining.lock().unwrap();
        match guard.get_mut(term) {
            Some(n) if *n == u32::MAX => Some(PipelineError::new(ErrorKind::InvalidResponse, "permanently malformed response")),
            Some(n) if *n > 0 => {
                *n -= 1;
                Some(PipelineError::new(ErrorKind::Network, "simulated transient network failure"))
            }
            _ => None,
        }
    }
}

#[async_trait]
impl LlmClient for ScriptedLlm {
    async fn stage1(&self, term: &str, _type_hint: Option<&str>) -> Result<(Stage1Artifact, u64), PipelineError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.call_delay.is_zero() {
            tokio::time::sleep(self.call_delay).await;
        }
        if let Some(err) = self.take_failure(term) {
            return Err(err);
        }
        Ok((stage1_for(term), 40))
    }

    async fn stage2(&self, term: &str, _stage1_artifact: &Stage1Artifact) -> Result<(Stage2Artifact, u64), PipelineError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.call_delay.is_zero() {
            tokio::time::sleep(self.call_delay).await;
        }
        Ok((stage2_for(term), 60))
    }
}

fn config_for_tests() -> PipelineConfig {
    let mut config = PipelineConfig::default();
    config.workers = 4;
    config.checkpoint.every_n = 1;
    config.retry.max_attempts = 4;
    config.retry.base_delay_ms = 1;
    config.retry.max_delay_ms = 5;
    config
}

fn items(n: u64) -> Vec<VocabularyItem> {
    (1..=n).map(|p| VocabularyItem::new(p, format!("term-{p}"), None)).collect()
}

#[tokio::test]
async fn completes_a_batch_with_every_item_in_order() {
    let dir = tempdir().unwrap();
    let llm: Arc<dyn LlmClient> = Arc::new(ScriptedLlm::default());
    let orchestrator = Orchestrator::new(config_for_tests(), llm, dir.path()).unwrap();
    orchestrator.bootstrap().unwrap();

    let sink = VecSink::default();
    let report: BatchReport = orchestrator.run_batch(items(8), Box::new(sink)).await.unwrap();

    assert_eq!(report.status, BatchStatus::Completed);
    assert_eq!(report.completed, 8);
    assert_eq!(report.quarantined_count, 0);
    assert!(report.fatal_cause.is_none());
    assert!(report.tokens_used > 0);
}

#[tokio::test]
async fn absorbs_transient_failures_via_retry_without_quarantining() {
    let dir = tempdir().unwrap();
    let llm = ScriptedLlm::fail_then_succeed(&[("term-2", 2), ("term-4", 1)]);
    let orchestrator = Orchestrator::new(config_for_tests(), Arc::new(llm), dir.path()).unwrap();

    let report = orchestrator.run_batch(items(5), Box::new(VecSink::default())).await.unwrap();

    assert_eq!(report.status, BatchStatus::Completed);
    assert_eq!(report.completed, 5);
    assert_eq!(report.quarantined_count, 0);
}

#[tokio::test]
async fn quarantines_an_item_whose_llm_response_never_parses() {
    let dir = tempdir().unwrap();
    let llm = ScriptedLlm::fail_then_succeed(&[("term-3", u32::MAX)]);
    let orchestrator = Orchestrator::new(config_for_tests(), Arc::new(llm), dir.path()).unwrap();

    let report = orchestrator.run_batch(items(5), Box::new(VecSink::default())).await.unwrap();

    assert_eq!(report.status, BatchStatus::Partial);
    assert_eq!(report.completed, 4);
    assert_eq!(report.quarantined_count, 1);

    let quarantined = orchestrator.quarantined_items(&report.batch_id).unwrap();
    assert_eq!(quarantined.len(), 1);
    assert_eq!(quarantined[0].term, "term-3");
}

#[tokio::test]
async fn cancel_mid_run_leaves_a_resumable_batch() {
    // One worker and an artificially slow backend so the batch is still
    // claiming items when we cancel it instead of racing completion.
    let mut config = config_for_tests();
    config.workers = 1;
    let dir = tempdir().unwrap();
    let llm = ScriptedLlm::slow(Duration::from_millis(20));
    let orchestrator = Arc::new(Orchestrator::new(config, Arc::new(llm), dir.path()).unwrap());

    let run_orchestrator = orchestrator.clone();
    let handle = tokio::spawn(async move { run_orchestrator.run_batch(items(20), Box::new(VecSink::default())).await });

    // Poll for the batch id rather than sleeping a fixed guess: run_batch
    // generates it internally and only publishes it via active_batch_ids
    // once the batch is registered.
    let batch_id = loop {
        if let Some(id) = orchestrator.active_batch_ids().into_iter().next() {
            break id;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    };
    orchestrator.cancel_batch(&batch_id).unwrap();

    let report = handle.await.unwrap().unwrap();
    assert_eq!(report.batch_id, batch_id);
    assert_eq!(report.status, BatchStatus::Partial);
    assert!(report.completed < 20, "expected cancellation to stop the batch short of completion, got {}", report.completed);

    let resumed = orchestrator.resume_batch(&batch_id, Box::new(VecSink::default())).await.unwrap();
    assert_eq!(resumed.status, BatchStatus::Completed);
    assert_eq!(resumed.completed, 20);
}

#[tokio::test]
async fn resume_batch_picks_up_after_reopening_the_same_data_dir() {
    let dir = tempdir().unwrap();

    // First process: run a batch to completion and record its id.
    let first_report = {
        let llm: Arc<dyn LlmClient> = Arc::new(ScriptedLlm::default());
        let orchestrator = Orchestrator::new(config_for_tests(), llm, dir.path()).unwrap();
        orchestrator.run_batch(items(6), Box::new(VecSink::default())).await.unwrap()
    };
    assert_eq!(first_report.status, BatchStatus::Completed);

    // A second orchestrator instance pointed at the same data directory can
    // still read back the batch's persisted status.
    let llm: Arc<dyn LlmClient> = Arc::new(ScriptedLlm::default());
    let orchestrator = Orchestrator::new(config_for_tests(), llm, dir.path()).unwrap();
    let (batch, counts) = orchestrator.batch_status(&first_report.batch_id).unwrap();
    assert_eq!(batch.status, BatchStatus::Completed);
    assert_eq!(counts.get("completed").copied().unwrap_or(0), 6);
}
