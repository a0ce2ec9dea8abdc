//! Concurrent two-stage LLM pipeline that turns Korean vocabulary lists into
//! Anki-ready flashcard rows.
//!
//! A batch of [`models::VocabularyItem`]s is enqueued into a durable task
//! queue ([`repository::TaskQueueRepository`]) and driven to completion by
//! the [`engine::ConcurrencyEngine`], which wraps every LLM call in a
//! content-addressed [`cache::CacheStore`], a [`rate_limit::RateLimiter`], a
//! [`breaker::CircuitBreakerRegistry`], and a [`retry::RetryExecutor`]. The
//! [`orchestrator::Orchestrator`] is the entry point callers use; it wires
//! all of the above together from a [`config::PipelineConfig`] and exposes
//! `run_batch` / `resume_batch` / `cancel_batch`.

pub mod breaker;
pub mod cache;
pub mod collector;
pub mod config;
pub mod engine;
pub mod error;
pub mod llm;
pub mod models;
pub mod orchestrator;
pub mod rate_limit;
pub mod repository;
pub mod retry;

pub use config::PipelineConfig;
pub use engine::{ResultSink, VecSink};
pub use error::{ErrorKind, PipelineError};
pub use llm::{HttpLlmClient, LlmClient};
pub use models::{BatchReport, VocabularyItem};
pub use orchestrator::Orchestrator;
