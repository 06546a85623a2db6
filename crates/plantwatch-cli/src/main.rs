use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::{NaiveDate, Utc};
use clap::{Parser, Subcommand};
use plantwatch_pipeline::{Pipeline, PipelineConfig, TriggerResponse};
use plantwatch_storage::PgFactStore;
use tracing::error;

#[derive(Debug, Parser)]
#[command(name = "plantwatch-cli")]
#[command(about = "Plant health monitoring pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Probe the plant API, load the readings and send alerts.
    Sync,
    /// Transform and load a raw batch stored by an earlier sync.
    Replay { key: String },
    /// Send alerts for the error rows of a saved sync response.
    Alert {
        #[arg(long)]
        input: PathBuf,
    },
    /// Summarise the fact store into the daily archive, then purge it.
    Archive {
        /// Defaults to today (UTC).
        #[arg(long)]
        date: Option<NaiveDate>,
    },
    /// Apply the fact store's database migrations.
    Migrate,
    /// Run sync and archive on their cron schedules until Ctrl-C.
    Schedule,
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();
}

async fn run(command: Commands) -> Result<TriggerResponse> {
    let config = PipelineConfig::from_env()?;

    match command {
        Commands::Sync => {
            let pipeline = Pipeline::connect(config).await?;
            Ok(pipeline.run_sync().await?.into_response())
        }
        Commands::Replay { key } => {
            let pipeline = Pipeline::connect(config).await?;
            Ok(pipeline.replay_raw(&key).await?.into_response())
        }
        Commands::Alert { input } => {
            let raw = std::fs::read_to_string(&input)
                .with_context(|| format!("reading {}", input.display()))?;
            let saved: TriggerResponse = serde_json::from_str(&raw)
                .with_context(|| format!("parsing {}", input.display()))?;
            let pipeline = Pipeline::connect(config).await?;
            let outcome = pipeline
                .run_alerts(saved.error_rows.unwrap_or_default())
                .await?;
            Ok(TriggerResponse::ok(outcome.message()))
        }
        Commands::Archive { date } => {
            let pipeline = Pipeline::connect(config).await?;
            let date = date.unwrap_or_else(|| Utc::now().date_naive());
            Ok(TriggerResponse::ok(pipeline.run_archive(date).await?.message()))
        }
        Commands::Migrate => {
            PgFactStore::connect(&config.database_url)
                .await?
                .migrate()
                .await?;
            Ok(TriggerResponse::ok("migrations applied"))
        }
        Commands::Schedule => {
            if !config.scheduler_enabled {
                bail!("scheduler disabled; set PLANTWATCH_SCHEDULER_ENABLED=true");
            }
            let pipeline = Arc::new(Pipeline::connect(config).await?);
            pipeline.run_scheduler().await?;
            Ok(TriggerResponse::ok("scheduler stopped"))
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let _ = dotenvy::dotenv();
    init_tracing();
    let cli = Cli::parse();

    let response = match run(cli.command.unwrap_or(Commands::Sync)).await {
        Ok(response) => response,
        Err(err) => {
            error!(error = %format!("{err:#}"), "run failed");
            TriggerResponse::failed(format!("{err:#}"))
        }
    };

    match serde_json::to_string_pretty(&response) {
        Ok(json) => println!("{json}"),
        Err(err) => eprintln!("failed to encode response: {err}"),
    }
    if response.is_ok() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn every_subcommand_is_described_in_help() {
        Cli::command().debug_assert();
        for sub in Cli::command().get_subcommands() {
            assert!(sub.get_about().is_some(), "{} has no help text", sub.get_name());
        }
    }

    #[test]
    fn bare_invocation_defaults_to_sync() {
        let cli = Cli::try_parse_from(["plantwatch"]).unwrap();
        assert!(cli.command.is_none());
        let cli = Cli::try_parse_from(["plantwatch", "archive", "--date", "2025-06-05"]).unwrap();
        assert!(matches!(
            cli.command,
            Some(Commands::Archive { date: Some(date) }) if date == NaiveDate::from_ymd_opt(2025, 6, 5).unwrap()
        ));
    }
}
