use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use bidwatch_pipeline::{ClassifierModel, Collector, CollectorConfig};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "bidwatch")]
#[command(about = "Public contract opportunity collector")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run collection for the given adapters (default: enabled sources).
    Collect {
        #[arg(short, long = "adapter")]
        adapters: Vec<String>,
    },
    /// Canonicalize pending raw records (normalize, classify, dedup).
    Process,
    /// Collect then process; --watch keeps doing so on the cron schedule.
    Run {
        #[arg(long)]
        watch: bool,
    },
    /// Serve the read-only API.
    Serve {
        #[arg(long, default_value_t = 8000)]
        port: u16,
    },
    /// Write the seed classifier model to disk.
    TrainClassifier {
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// List registered adapters.
    ListAdapters,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let mut config = CollectorConfig::from_env();

    match cli.command.unwrap_or(Commands::Run { watch: false }) {
        Commands::Collect { adapters } => {
            let collector = Collector::init(config).await?;
            let report = collector.collect(&adapters).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::Process => {
            let collector = Collector::init(config).await?;
            let summary = collector.process().await?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Commands::Run { watch } => {
            if watch {
                config.scheduler_enabled = true;
            }
            let collector = Arc::new(Collector::init(config).await?);
            let (report, summary) = collector.run_cycle().await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            println!("{}", serde_json::to_string_pretty(&summary)?);

            if let Some(mut scheduler) = collector.clone().build_scheduler().await? {
                scheduler.start().await.context("starting scheduler")?;
                info!("scheduler running, ctrl-c to stop");
                tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
                collector.cancellation_token().cancel();
                info!("shutting down");
            }
        }
        Commands::Serve { port } => {
            let collector = Collector::init(config).await?;
            info!(port, "serving read API");
            bidwatch_web::serve(port, collector.store()).await?;
        }
        Commands::TrainClassifier { output } => {
            let path = output
                .or(config.classifier_model_path)
                .unwrap_or_else(|| PathBuf::from("models/category_classifier.json"));
            ClassifierModel::seed().save(&path)?;
            println!("classifier model written to {}", path.display());
        }
        Commands::ListAdapters => {
            for &name in bidwatch_adapters::ADAPTER_NAMES {
                if let Some(adapter) = bidwatch_adapters::adapter_for_source(name) {
                    println!(
                        "  {:20} {:20} {:?}",
                        adapter.name(),
                        adapter.base_domain(),
                        adapter.capability()
                    );
                }
            }
        }
    }

    Ok(())
}
