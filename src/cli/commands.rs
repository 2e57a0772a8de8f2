//! CLI command definitions for modelforge.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::info;
use uuid::Uuid;

use crate::backend::HttpTrainingBackend;
use crate::config::PipelineConfig;
use crate::dataset::{normalize_dataset, LocalDatasetSource, SplitRatios};
use crate::objstore::FsObjectStore;
use crate::record::ProjectPlan;
use crate::service::PipelineService;
use crate::store::PostgresRecordStore;
use crate::workflow::StageContext;

/// Automated model training pipeline orchestrator.
#[derive(Parser)]
#[command(name = "modelforge")]
#[command(about = "Orchestrate dataset acquisition, training and evaluation pipelines")]
#[command(version)]
#[command(
    long_about = "modelforge runs a phase-driven pipeline: submitted projects are picked up by\n\
                  polling workers that acquire a dataset, train a model and evaluate it,\n\
                  advancing each record through its lifecycle phases.\n\n\
                  Example usage:\n  \
                  modelforge submit --name flowers --keywords flower,species\n  \
                  modelforge serve"
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Run the polling scheduler serving all pipeline stages.
    Serve(ServeArgs),

    /// Submit a new project plan into the pipeline.
    Submit(SubmitArgs),

    /// Trigger a single stage for a record immediately.
    Trigger(TriggerArgs),

    /// Show a record's phase and recent audit log entries.
    Status(StatusArgs),

    /// Normalize an extracted dataset directory in place.
    Normalize(NormalizeArgs),
}

/// Arguments for `modelforge serve`.
#[derive(Parser, Debug)]
pub struct ServeArgs {
    /// Poll interval in seconds; overrides MODELFORGE_POLL_INTERVAL_SECS.
    #[arg(short, long)]
    pub interval_secs: Option<u64>,
}

/// Arguments for `modelforge submit`.
#[derive(Parser, Debug)]
pub struct SubmitArgs {
    /// Project name.
    #[arg(short, long)]
    pub name: String,

    /// Comma-separated dataset search keywords.
    #[arg(short, long)]
    pub keywords: String,

    /// Preferred model architecture.
    #[arg(short, long, default_value = "resnet18")]
    pub model: String,

    /// Maximum dataset size to acquire, in gigabytes.
    #[arg(long, default_value = "50.0")]
    pub max_size_gb: f64,
}

/// Arguments for `modelforge trigger`.
#[derive(Parser, Debug)]
pub struct TriggerArgs {
    /// Stage to run: acquisition, training or evaluation.
    pub stage: String,

    /// Record id.
    pub record_id: Uuid,
}

/// Arguments for `modelforge status`.
#[derive(Parser, Debug)]
pub struct StatusArgs {
    /// Record id.
    pub record_id: Uuid,
}

/// Arguments for `modelforge normalize`.
#[derive(Parser, Debug)]
pub struct NormalizeArgs {
    /// Dataset directory to normalize.
    pub dir: PathBuf,

    /// Fraction of each class assigned to training on auto-split.
    #[arg(long, default_value = "0.7")]
    pub train_ratio: f64,

    /// Fraction of each class assigned to validation on auto-split.
    #[arg(long, default_value = "0.2")]
    pub val_ratio: f64,
}

/// Parse CLI arguments and return the Cli struct.
///
/// This allows main.rs to access CLI arguments (like log_level) before
/// running commands.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Run the CLI by parsing arguments and executing the command.
pub async fn run() -> anyhow::Result<()> {
    run_with_cli(parse_cli()).await
}

/// Run the CLI with the parsed arguments.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Serve(args) => run_serve_command(args).await,
        Commands::Submit(args) => run_submit_command(args).await,
        Commands::Trigger(args) => run_trigger_command(args).await,
        Commands::Status(args) => run_status_command(args).await,
        Commands::Normalize(args) => run_normalize_command(args),
    }
}

/// Connects every collaborator and assembles the pipeline service.
async fn build_service(config: &PipelineConfig) -> anyhow::Result<PipelineService> {
    let store = PostgresRecordStore::connect(&config.database_url).await?;
    store.run_migrations().await?;

    let ctx = StageContext {
        store: Arc::new(store),
        objects: Arc::new(FsObjectStore::new(&config.object_store_path)),
        source: Arc::new(LocalDatasetSource::new(&config.catalog_path)),
        backend: Arc::new(HttpTrainingBackend::new(config.trainer_url.clone())),
        config: config.clone(),
    };

    Ok(PipelineService::new(ctx))
}

async fn run_serve_command(args: ServeArgs) -> anyhow::Result<()> {
    let config = PipelineConfig::from_env()?;
    let service = build_service(&config).await?;

    let interval = args
        .interval_secs
        .map(Duration::from_secs)
        .unwrap_or(config.poll_interval);

    let scheduler = Arc::new(service.scheduler(interval));
    let runner = {
        let scheduler = Arc::clone(&scheduler);
        tokio::spawn(async move { scheduler.run().await })
    };

    tokio::signal::ctrl_c().await?;
    info!("Ctrl-C received, stopping scheduler");
    scheduler.stop();
    runner.await?;

    Ok(())
}

async fn run_submit_command(args: SubmitArgs) -> anyhow::Result<()> {
    let config = PipelineConfig::from_env()?;
    let service = build_service(&config).await?;

    let keywords: Vec<String> = args
        .keywords
        .split(',')
        .map(|k| k.trim().to_string())
        .filter(|k| !k.is_empty())
        .collect();

    let plan = ProjectPlan::new(&args.name, keywords)
        .with_preferred_model(&args.model)
        .with_max_dataset_size_gb(args.max_size_gb);

    let record = service.submit(&plan).await?;
    println!("Submitted project '{}' as record {}", record.name, record.id);
    println!("Phase: {}", record.phase);

    Ok(())
}

async fn run_trigger_command(args: TriggerArgs) -> anyhow::Result<()> {
    let config = PipelineConfig::from_env()?;
    let service = build_service(&config).await?;

    match service.trigger_stage(&args.stage, args.record_id).await {
        Ok(outcome) => {
            println!(
                "Stage '{}' completed for record {}",
                outcome.stage, outcome.record_id
            );
            if let Some(produced) = outcome.produced_ref {
                println!("Produced: {produced}");
            }
            if outcome.recovered {
                println!("Note: stage body failed but the artifact already existed");
            }
            Ok(())
        }
        Err(e) => Err(anyhow::anyhow!("{e}")),
    }
}

async fn run_status_command(args: StatusArgs) -> anyhow::Result<()> {
    let config = PipelineConfig::from_env()?;
    let service = build_service(&config).await?;

    let status = service.status(args.record_id).await?;
    println!("Record: {} ('{}')", status.record_id, status.name);
    println!("Phase: {}", status.phase);
    println!("Recent activity:");
    for entry in &status.recent_logs {
        println!(
            "  [{}] {} {}: {}",
            entry.created_at.format("%Y-%m-%d %H:%M:%S"),
            entry.level.as_str(),
            entry.stage,
            entry.message
        );
    }

    Ok(())
}

fn run_normalize_command(args: NormalizeArgs) -> anyhow::Result<()> {
    let ratios = SplitRatios::new(args.train_ratio, args.val_ratio);
    normalize_dataset(&args.dir, &ratios)?;
    println!("Normalized dataset at {}", args.dir.display());

    Ok(())
}
