//! Self-training schedule quality service
//!
//! `serve` runs the background retraining loop next to the health, metrics
//! and status endpoints. The remaining subcommands are one-shot operator
//! tools working on the same corpus and model directories.

mod api;
mod commands;
mod config;
mod output;

use anyhow::Result;
use clap::{Parser, Subcommand};
use selftrain_lib::{
    health::{components, HealthRegistry},
    observability::{ServiceMetrics, StructuredLogger},
    RetrainingService,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const SERVICE_VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser)]
#[command(name = "selftrain")]
#[command(author, version, about = "Self-training schedule quality service", long_about = None)]
pub struct Cli {
    /// Configuration file (TOML, YAML or JSON)
    #[arg(long, short, env = "SELFTRAIN_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Output format
    #[arg(long, short, default_value = "table", global = true)]
    pub format: output::OutputFormat,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the retraining loop and the HTTP endpoints
    Serve,

    /// Train models from the current corpus
    Train {
        /// Train even if the retrain interval or new-schedule gate is not met
        #[arg(long)]
        force: bool,
    },

    /// Show the loaded models and retrain state
    Status,

    /// Show completed training runs, newest first
    History,

    /// Delete all but the newest schedules from the corpus
    Prune {
        /// Number of schedules to keep
        #[arg(long, default_value_t = 1000)]
        keep: usize,
    },

    /// Show how a request would be routed right now
    Route {
        /// Trains in the request
        #[arg(long)]
        num_trains: Option<u32>,

        /// Treat the ML path as unavailable
        #[arg(long)]
        ml_unavailable: bool,
    },

    /// Add a schedule JSON document to the corpus
    Record {
        /// Path to the schedule document
        file: PathBuf,

        /// Quality score assigned to the schedule
        #[arg(long)]
        quality: Option<f64>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // JSON logs on stderr; stdout is reserved for command output
    let default_level = match cli.command {
        Commands::Serve => "info",
        _ => "warn",
    };
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)))
        .with(fmt::layer().json().with_writer(std::io::stderr))
        .init();

    let config = config::ServiceConfig::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Serve => serve(config).await?,
        Commands::Train { force } => commands::train(&config.training, force, cli.format).await?,
        Commands::Status => commands::status(&config.training, cli.format)?,
        Commands::History => commands::history(&config.training, cli.format)?,
        Commands::Prune { keep } => commands::prune(&config.training, keep, cli.format)?,
        Commands::Route {
            num_trains,
            ml_unavailable,
        } => commands::route(&config.training, num_trains, !ml_unavailable, cli.format)?,
        Commands::Record { file, quality } => {
            commands::record(&config.training, &file, quality)?
        }
    }

    Ok(())
}

async fn serve(config: config::ServiceConfig) -> Result<()> {
    info!(instance = %config.instance_name, "Starting selftrain");

    let health_registry = HealthRegistry::new();
    health_registry.register(components::CORPUS).await;
    health_registry.register(components::TRAINER).await;
    health_registry.register(components::SCHEDULER).await;

    let logger = StructuredLogger::new(&config.instance_name);

    let trainer = match commands::open_trainer(&config.training) {
        Ok(trainer) => trainer,
        Err(e) => {
            health_registry
                .set_unhealthy(components::CORPUS, format!("{:#}", e))
                .await;
            return Err(e);
        }
    };
    health_registry.set_healthy(components::CORPUS).await;

    if let Ok(count) = trainer.corpus().count_all() {
        ServiceMetrics::new().set_corpus_size(count);
    }

    let service = Arc::new(RetrainingService::new(
        trainer,
        health_registry.clone(),
        logger.clone(),
    ));
    service.start().await;

    logger.log_startup(
        SERVICE_VERSION,
        config.training.retrain_interval_hours,
        &config.training.model_types,
    );

    let app_state = Arc::new(api::AppState::new(
        health_registry.clone(),
        Arc::clone(&service),
    ));

    health_registry.set_ready(true).await;

    let api_handle = tokio::spawn(api::serve(config.api_port, app_state));

    let reason = tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal?;
            "SIGINT received"
        }
        result = api_handle => {
            match result {
                Ok(Ok(())) => "API server exited",
                Ok(Err(e)) => {
                    error!(error = %e, "API server failed");
                    "API server failed"
                }
                Err(e) => {
                    error!(error = %e, "API server task panicked");
                    "API server task panicked"
                }
            }
        }
    };

    health_registry.set_ready(false).await;
    logger.log_shutdown(reason);
    service.stop().await;
    info!("Shutdown complete");

    Ok(())
}
