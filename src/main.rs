//! rainwatch CLI entry point.

use anyhow::{Context, Result};
use chrono::{Local, NaiveDate};
use clap::{Parser, Subcommand};
use rainwatch::pipeline::{self, Services};
use rainwatch::validation::{SuiteStore, default_suite, validate};
use rainwatch::weather::Table;
use rainwatch::PipelineConfig;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

#[derive(Parser, Debug)]
#[command(name = "rainwatch")]
#[command(version)]
#[command(about = "Weather ingestion, validation and forecast decay monitoring")]
struct Cli {
    /// Log level used when RUST_LOG is not set
    #[arg(long, global = true, env = "RAINWATCH_LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// JSON configuration file
    #[arg(short, long, global = true, env = "RAINWATCH_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the pipeline once
    Run {
        /// Logical date of the run, defaults to today
        #[arg(long)]
        date: Option<NaiveDate>,

        /// First day to fetch
        #[arg(long)]
        start: Option<NaiveDate>,

        /// Last day to fetch
        #[arg(long)]
        end: Option<NaiveDate>,

        /// Monitoring cutoff, overrides the trained-until date of the model
        #[arg(long, env = "CUT_OFF_DATE")]
        cutoff: Option<NaiveDate>,

        /// Canonical dataset file
        #[arg(long, env = "DATA_PATH")]
        dataset: Option<PathBuf>,

        /// Directory holding expectation suites
        #[arg(long, env = "EXPECTATIONS_PATH")]
        expectations: Option<PathBuf>,

        /// Slack incoming webhook for alerts
        #[arg(long, env = "SLACK_WEBHOOK_URL", hide_env_values = true)]
        slack_webhook: Option<String>,
    },
    /// Validate a CSV file against the expectation suite
    Validate {
        file: PathBuf,

        /// Suite name, defaults to the configured one
        #[arg(long)]
        suite: Option<String>,
    },
    /// Print the task graph
    Graph,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    // RUST_LOG wins over --log-level
    let log_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| cli.log_level.clone());
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&log_filter)))
        .init();

    let mut config = match &cli.config {
        Some(path) => PipelineConfig::load(path)?,
        None => PipelineConfig::default(),
    };

    match cli.command {
        Command::Run {
            date,
            start,
            end,
            cutoff,
            dataset,
            expectations,
            slack_webhook,
        } => {
            config.fetch_start = start.or(config.fetch_start);
            config.fetch_end = end.or(config.fetch_end);
            config.monitoring_cutoff = cutoff.or(config.monitoring_cutoff);
            if let Some(path) = dataset {
                config.dataset_path = path;
            }
            if let Some(dir) = expectations {
                config.expectations_dir = dir;
            }
            if slack_webhook.is_some() {
                config.slack_webhook_url = slack_webhook;
            }
            run(config, date.unwrap_or_else(|| Local::now().date_naive())).await
        }
        Command::Validate { file, suite } => validate_file(config, file, suite),
        Command::Graph => {
            let services = Arc::new(Services::production(config)?);
            pipeline::build_orchestrator(services)?.print_graph();
            Ok(ExitCode::SUCCESS)
        }
    }
}

async fn run(config: PipelineConfig, logical_date: NaiveDate) -> Result<ExitCode> {
    let services = Arc::new(Services::production(config)?);

    let ctx = CancellationToken::new();
    let cancel = ctx.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, letting running tasks finish");
            cancel.cancel();
        }
    });

    let result = pipeline::run_pipeline(services, ctx, logical_date)
        .await
        .context("pipeline run aborted")?;

    for (task, status) in &result.statuses {
        info!(%task, %status, "final status");
    }
    if result.succeeded() {
        info!(run_id = %result.run_id, "run succeeded");
        Ok(ExitCode::SUCCESS)
    } else {
        for (task, detail) in &result.failures {
            error!(%task, %detail, "task failed");
        }
        Ok(ExitCode::FAILURE)
    }
}

fn validate_file(config: PipelineConfig, file: PathBuf, suite: Option<String>) -> Result<ExitCode> {
    let name = suite.unwrap_or_else(|| config.suite_name.clone());
    let store = SuiteStore::new(&config.expectations_dir);
    let suite = if store.exists(&name) {
        store.get(&name)?
    } else {
        warn!(suite = %name, "suite not found, using the default rules without saving them");
        default_suite(&name)
    };

    let table = Table::read_csv(&file).with_context(|| format!("cannot read {}", file.display()))?;
    let result = validate(&table, &suite);
    println!("{}", serde_json::to_string_pretty(&result)?);

    Ok(if result.success {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}
