use clap::{Parser, Subcommand};
use insight_pipeline::config::{self, Config};
use insight_pipeline::scheduler::{self, PipelineContext};
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "insight-pipeline", about = "News-intelligence ingestion, dedup, LLM orchestration, and digest delivery")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Execute one hourly cycle followed by one daily cycle.
    RunFullPipeline,
    /// Long-running daemon driving the hourly/daily timers.
    Scheduler,
    /// One-shot relevance-stage runner.
    Relevance {
        #[arg(long)]
        limit: Option<i64>,
    },
    /// One-shot classification-stage runner.
    Classify {
        #[arg(long)]
        limit: Option<i64>,
    },
    /// Administrative: delete all articles with relevance = false.
    PurgeIrrelevant,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt::init();

    match run().await {
        Ok(()) => ExitCode::from(0),
        Err(RunError::Configuration(msg)) => {
            error!("configuration or connectivity error: {msg}");
            ExitCode::from(1)
        }
        Err(RunError::Partial(msg)) => {
            error!("partial failure: {msg}");
            ExitCode::from(2)
        }
    }
}

enum RunError {
    Configuration(String),
    Partial(String),
}

async fn run() -> Result<(), RunError> {
    let cli = Cli::parse();

    let config = Config::from_env().map_err(|e| RunError::Configuration(e.to_string()))?;
    info!("connecting to database: {}", config.redacted_database_url());

    let sources = config::load_feed_sources(&config.sources_path)
        .map_err(|e| RunError::Configuration(e.to_string()))?
        .sources;
    let taxonomy = config::load_taxonomy(&config.taxonomy_path).map_err(|e| RunError::Configuration(e.to_string()))?;

    let ctx = Arc::new(
        PipelineContext::bootstrap(config, sources, taxonomy)
            .await
            .map_err(|e| RunError::Configuration(e.to_string()))?,
    );

    match cli.command {
        Command::RunFullPipeline => {
            scheduler::hourly_job(&ctx).await.map_err(|e| RunError::Partial(e.to_string()))?;
            scheduler::daily_job(&ctx).await.map_err(|e| RunError::Partial(e.to_string()))?;
        }
        Command::Scheduler => {
            scheduler::run_scheduler(ctx).await.map_err(|e| RunError::Configuration(e.to_string()))?;
        }
        Command::Relevance { limit } => {
            scheduler::run_relevance_stage(&ctx, limit)
                .await
                .map_err(|e| RunError::Partial(e.to_string()))?;
        }
        Command::Classify { limit } => {
            scheduler::run_classification_stage(&ctx, limit)
                .await
                .map_err(|e| RunError::Partial(e.to_string()))?;
        }
        Command::PurgeIrrelevant => {
            let removed = ctx.store.delete_irrelevant().await.map_err(|e| RunError::Partial(e.to_string()))?;
            info!("purged {removed} irrelevant articles");
        }
    }

    Ok(())
}
