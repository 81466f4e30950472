//! Command-line interface for requeue.
//!
//! Provides commands for running a pipeline, validating a config, and
//! previewing backoff scores.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::Config;
use crate::core::build_pipeline;
use crate::queue::{backoff_score, now_seconds, BackoffOptions};

/// requeue - Configurable job retry pipeline
#[derive(Parser, Debug)]
#[command(name = "requeue")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Log output format
    #[arg(long, value_enum, global = true, env = "REQUEUE_LOG_FORMAT", default_value = "console")]
    pub log_format: LogFormat,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    /// Human-readable lines
    Console,
    /// One JSON object per line
    Json,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run a pipeline until Ctrl-C
    Run {
        /// Pipeline config file
        #[arg(short, long, env = "REQUEUE_CONFIG")]
        config: PathBuf,
    },

    /// Build a pipeline without running it and print its stages
    Validate {
        /// Pipeline config file
        #[arg(short, long, env = "REQUEUE_CONFIG")]
        config: PathBuf,
    },

    /// Print the backoff score a job would get now
    Score {
        /// Retry count of the job
        #[arg(short, long)]
        retry_count: f64,

        /// Base delay in seconds
        #[arg(long)]
        base_delay: Option<f64>,
    },
}

impl Cli {
    /// Execute the CLI command
    pub async fn execute(self) -> Result<()> {
        match self.command {
            Commands::Run { config } => run_pipeline(&config).await,
            Commands::Validate { config } => validate_config(&config).await,
            Commands::Score {
                retry_count,
                base_delay,
            } => show_score(retry_count, base_delay),
        }
    }
}

fn load_config(path: &Path) -> Result<Config> {
    let mut config = Config::from_file(path)?;
    config.apply_env_overrides();
    Ok(config)
}

/// Run a pipeline until interrupted
async fn run_pipeline(path: &Path) -> Result<()> {
    let config = load_config(path)?;
    let built = build_pipeline(&config)
        .await
        .with_context(|| format!("Failed to build pipeline from {}", path.display()))?;

    let cancel = CancellationToken::new();
    let shutdown = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown requested");
            shutdown.cancel();
        }
    });

    let result = built.pipeline.start(cancel).await;

    let stats = built.pipeline.stats().snapshot();
    eprintln!(
        "\n[Pipeline '{}' stopped: {} dispatched, {} succeeded, {} failed, {} skipped]",
        built.pipeline.name(),
        stats.dispatched,
        stats.succeeded,
        stats.failed,
        stats.skipped
    );

    result.context("Pipeline failed")
}

/// Build a pipeline and describe it
async fn validate_config(path: &Path) -> Result<()> {
    let config = load_config(path)?;
    let built = build_pipeline(&config)
        .await
        .with_context(|| format!("Invalid pipeline config {}", path.display()))?;

    println!("Pipeline: {}", built.pipeline.name());
    println!("Source: {}", config.pipeline.get_items);

    let mut queues: Vec<&String> = built.queues.keys().collect();
    queues.sort();
    println!("Queues:");
    for name in queues {
        println!("  {}", name);
    }

    println!("Stages:");
    for (i, stage) in built.stages.iter().enumerate() {
        println!("  {}. {}", i + 1, stage);
    }

    Ok(())
}

/// Print the score for a retry count
fn show_score(retry_count: f64, base_delay: Option<f64>) -> Result<()> {
    let base_delay = base_delay.unwrap_or(BackoffOptions::default().base_delay_seconds);
    let now = now_seconds();
    let score = backoff_score(retry_count, base_delay, now);

    let due = DateTime::<Utc>::from_timestamp(score as i64, 0)
        .context("Score is out of range for a timestamp")?;

    println!("Score: {:.3}", score);
    println!("Due: {} (in {:.0}s)", due.to_rfc3339(), score - now);

    Ok(())
}
