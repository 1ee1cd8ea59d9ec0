//! Pocketclaw - embedded personal assistant runtime
//!
#![doc = "Main entry point for the Pocketclaw runtime."]

use anyhow::{Context, Result};
use colored::Colorize;

use pocketclaw::cli::{Cli, Commands};
use pocketclaw::commands;
use pocketclaw::config::Config;
use pocketclaw::error::PocketclawError;
use pocketclaw::logging::init_logging;
use pocketclaw::metrics::init_metrics_exporter;

fn main() {
    let cli = Cli::parse_args();

    if let Err(e) = start(cli) {
        eprintln!("{} {:#}", "error:".red().bold(), e);
        let code = match e.downcast_ref::<PocketclawError>() {
            Some(PocketclawError::Config(_)) => 1,
            _ => 2,
        };
        std::process::exit(code);
    }
}

/// Load configuration, then size the executor from it before any async work
fn start(cli: Cli) -> Result<()> {
    let config_path = cli.config_path();
    let config = Config::load(&config_path, &cli)?;
    config.validate()?;

    let runtime = config
        .runtime
        .build()
        .context("Failed to start the async runtime")?;
    runtime.block_on(run(cli, config, config_path))
}

async fn run(cli: Cli, config: Config, config_path: String) -> Result<()> {
    init_logging(&config.logging)?;
    init_metrics_exporter(config.metrics.listen.as_deref());
    tracing::debug!(
        worker_threads = config.runtime.worker_threads,
        max_blocking_threads = config.runtime.max_blocking_threads,
        "Runtime started"
    );

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => commands::run::run_service(config).await,
        Commands::Chat => commands::chat::run_chat(config).await,
        Commands::Ask { prompt, stream } => commands::ask::run_ask(config, prompt, stream).await,
        Commands::Sessions { command } => {
            commands::sessions::handle_sessions(&config, command).await
        }
        Commands::Config { command } => {
            commands::config_cmd::handle_config(&config, &config_path, command)
        }
    }
}
