//! flashcard-pipeline: turns a JSON list of Korean vocabulary terms into
//! ordered Anki flashcard rows via a two-stage LLM pipeline.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use clap::{Parser, Subcommand};
use console::style;
use flashcard_pipeline::engine::ResultSink;
use flashcard_pipeline::models::Stage2Artifact;
use flashcard_pipeline::{llm::HttpLlmClient, BatchReport, LlmClient, Orchestrator, PipelineConfig, PipelineError, VocabularyItem};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "flashcard-pipeline")]
#[command(about = "Concurrent two-stage LLM pipeline that turns Korean vocabulary lists into Anki flashcards")]
#[command(version)]
struct Cli {
    /// Directory holding the pipeline's SQLite databases and cache blobs
    #[arg(long, global = true, default_value = "./data")]
    data_dir: PathBuf,

    /// Optional TOML configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Submit a new batch of vocabulary terms and run it to completion
    Run {
        /// JSON array of {"position", "term", "type"} objects
        input: PathBuf,
        /// Where to write the ordered JSON array of flashcard artifacts (stdout if omitted)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Resume a batch left incomplete by a previous process
    Resume {
        batch_id: String,
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Request that an in-flight batch stop claiming new work
    Cancel { batch_id: String },

    /// Show a batch's persisted status and per-state task counts
    Status { batch_id: String },
}

fn is_verbose() -> bool {
    std::env::args().any(|arg| arg == "-v" || arg == "--verbose")
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    let default_filter = if is_verbose() { "flashcard_pipeline=info" } else { "flashcard_pipeline=warn" };
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter.into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    run(cli).await
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = match &cli.config {
        Some(path) => PipelineConfig::from_toml_file(path)?,
        None => PipelineConfig::default(),
    }
    .with_env_overrides();

    match cli.command {
        Commands::Run { input, output } => cmd_run(config, &cli.data_dir, &input, output.as_deref()).await,
        Commands::Resume { batch_id, output } => cmd_resume(config, &cli.data_dir, &batch_id, output.as_deref()).await,
        Commands::Cancel { batch_id } => cmd_cancel(config, &cli.data_dir, &batch_id),
        Commands::Status { batch_id } => cmd_status(config, &cli.data_dir, &batch_id),
    }
}

fn build_orchestrator(config: PipelineConfig, data_dir: &std::path::Path) -> anyhow::Result<Orchestrator> {
    let llm: Arc<dyn LlmClient> = Arc::new(HttpLlmClient::new(config.llm_config()));
    let orchestrator = Orchestrator::new(config, llm, data_dir)?;
    orchestrator.bootstrap()?;
    Ok(orchestrator)
}

/// Collects ordered artifacts into a shared buffer the caller can read back
/// once the batch finishes, since `ResultSink` is consumed by the engine.
#[derive(Clone, Default)]
struct CollectingSink(Arc<Mutex<Vec<(u64, Stage2Artifact)>>>);

impl ResultSink for CollectingSink {
    fn emit(&mut self, position: u64, artifact: Stage2Artifact) -> Result<(), PipelineError> {
        self.0.lock().unwrap().push((position, artifact));
        Ok(())
    }
}

async fn cmd_run(
    config: PipelineConfig,
    data_dir: &std::path::Path,
    input: &std::path::Path,
    output: Option<&std::path::Path>,
) -> anyhow::Result<()> {
    let text = std::fs::read_to_string(input)?;
    let items: Vec<VocabularyItem> = serde_json::from_str(&text)?;

    eprintln!("{} submitting {} terms ({} workers)", style("->").cyan(), items.len(), config.workers);

    let orchestrator = build_orchestrator(config, data_dir)?;
    let sink = CollectingSink::default();
    let collected = sink.0.clone();
    let report = orchestrator.run_batch(items, Box::new(sink)).await?;
    write_results(&report, &collected, output)
}

async fn cmd_resume(
    config: PipelineConfig,
    data_dir: &std::path::Path,
    batch_id: &str,
    output: Option<&std::path::Path>,
) -> anyhow::Result<()> {
    eprintln!("{} resuming batch {batch_id}", style("->").cyan());

    let orchestrator = build_orchestrator(config, data_dir)?;
    let sink = CollectingSink::default();
    let collected = sink.0.clone();
    let report = orchestrator.resume_batch(batch_id, Box::new(sink)).await?;
    write_results(&report, &collected, output)
}

fn cmd_cancel(config: PipelineConfig, data_dir: &std::path::Path, batch_id: &str) -> anyhow::Result<()> {
    let orchestrator = build_orchestrator(config, data_dir)?;
    orchestrator.cancel_batch(batch_id)?;
    eprintln!("{} cancellation requested for batch {batch_id}", style("!").yellow());
    Ok(())
}

fn cmd_status(config: PipelineConfig, data_dir: &std::path::Path, batch_id: &str) -> anyhow::Result<()> {
    let orchestrator = build_orchestrator(config, data_dir)?;
    let (batch, counts) = orchestrator.batch_status(batch_id)?;

    println!("{} batch {}", style("status").bold(), batch.batch_id);
    println!("  status:      {}", batch.status.as_str());
    println!("  total_items: {}", batch.total_items);
    println!("  completed:   {}", batch.completed);
    println!("  quarantined: {}", batch.quarantined);
    for (state, count) in counts {
        println!("  {state:<20} {count}");
    }
    Ok(())
}

fn write_results(
    report: &BatchReport,
    collected: &Mutex<Vec<(u64, Stage2Artifact)>>,
    output: Option<&std::path::Path>,
) -> anyhow::Result<()> {
    let mut artifacts = collected.lock().unwrap().clone();
    artifacts.sort_by_key(|(position, _)| *position);
    let rows: Vec<&Stage2Artifact> = artifacts.iter().map(|(_, artifact)| artifact).collect();
    let json = serde_json::to_string_pretty(&rows)?;

    match output {
        Some(path) => std::fs::write(path, json)?,
        None => println!("{json}"),
    }

    let summary_color = match report.status {
        flashcard_pipeline::models::BatchStatus::Completed => style(report.status.as_str()).green(),
        flashcard_pipeline::models::BatchStatus::Partial => style(report.status.as_str()).yellow(),
        _ => style(report.status.as_str()).red(),
    };
    eprintln!(
        "{} batch {} {} ({}/{} completed, {} quarantined, {} tokens)",
        style("<-").cyan(),
        report.batch_id,
        summary_color,
        report.completed,
        report.total_items,
        report.quarantined_count,
        report.tokens_used,
    );
    if let Some(cause) = &report.fatal_cause {
        eprintln!("{} aborted: {cause}", style("!").red());
    }

    Ok(())
}
