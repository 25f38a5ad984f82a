use std::path::Path;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use sp_cli::commands::{ingest, payroll, purge, status};
use sp_cli::{Cli, Commands, Config};
use sp_core::EventRunId;

/// Load config and open the ledger, ensuring the parent directory exists.
fn open_ledger(config_path: Option<&Path>) -> Result<(sp_db::Ledger, Config)> {
    let config = Config::load_from(config_path).context("failed to load configuration")?;
    tracing::debug!(?config, "loaded configuration");

    if let Some(parent) = config.database_path.parent() {
        std::fs::create_dir_all(parent).context("failed to create database directory")?;
    }

    let ledger = sp_db::Ledger::open(&config.database_path).context("failed to open ledger")?;
    Ok((ledger, config))
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize tracing with verbose flag support
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::from_default_env()
    };
    // Use try_init to avoid panic if tracing is already initialized (e.g., in tests)
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();

    match &cli.command {
        Some(Commands::Ingest {
            event,
            channels,
            input,
            end,
        }) => {
            let event = match event {
                Some(id) => EventRunId::new(id.as_str())?,
                None => EventRunId::new(uuid::Uuid::new_v4().to_string())?,
            };
            let (ledger, _config) = open_ledger(cli.config.as_deref())?;
            ingest::run(ledger, &event, channels, input, *end)?;
        }
        Some(Commands::Status { event }) => {
            let event = EventRunId::new(event.as_str())?;
            let (ledger, config) = open_ledger(cli.config.as_deref())?;
            status::run(&ledger, &event, config.count_staging_time)?;
        }
        Some(Commands::Payroll {
            event,
            manifest,
            prices,
            prices_url,
            donation,
            donors,
            requested_by,
            json,
        }) => {
            let event = EventRunId::new(event.as_str())?;
            let (ledger, config) = open_ledger(cli.config.as_deref())?;
            payroll::run(
                &ledger,
                &payroll::PayrollRequest {
                    event: &event,
                    manifest_path: manifest,
                    prices_path: prices.as_deref(),
                    prices_url: prices_url.as_deref(),
                    donation: *donation,
                    donors,
                    requested_by: requested_by.as_deref(),
                    json: *json,
                    count_staging_time: config.count_staging_time,
                },
            )?;
        }
        Some(Commands::Purge { event }) => {
            let event = EventRunId::new(event.as_str())?;
            let (mut ledger, _config) = open_ledger(cli.config.as_deref())?;
            purge::run(&mut ledger, &event)?;
        }
        None => {
            // No subcommand, show help
            use clap::CommandFactory;
            Cli::command().print_help()?;
            println!();
        }
    }

    Ok(())
}
