//! Requestor CLI - rent compute on the market and run work on it
//!
//! - `install` creates the run store
//! - `run` negotiates activities and distributes a work source over them
//! - `show` and `summary` report on a recorded run

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::process::ExitCode;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod commands;
mod config;
mod error;
mod output;

use commands::run::RunArgs;
use config::RequestorConfig;

/// Requestor CLI application
#[derive(Parser)]
#[command(name = "requestor")]
#[command(about = "Requestor - run work on rented compute", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, env = "REQUESTOR_CONFIG", global = true)]
    config: Option<String>,

    /// Run store URL
    #[arg(long, env = "REQUESTOR_STORAGE_URL", global = true)]
    storage_url: Option<String>,

    /// Output format (table, json, yaml)
    #[arg(short, long, default_value = "table", global = true)]
    output: output::OutputFormat,

    /// Log level
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Enable JSON logging
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Available commands
#[derive(Subcommand)]
enum Commands {
    /// Create the run store
    Install,

    /// Execute a work source, or resume an earlier run
    Run(RunArgs),

    /// Show the activities of a run
    Show {
        /// Run id; the most recent run when omitted
        run_id: Option<String>,
    },

    /// Summarize a run
    Summary {
        /// Run id; the most recent run when omitted
        run_id: Option<String>,
    },
}

fn init_tracing(level: &str, json: bool) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| level.into());

    if json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

async fn execute(cli: Cli) -> anyhow::Result<u8> {
    let mut config = RequestorConfig::load(cli.config.as_deref()).map_err(error::CliError::from)?;

    // Override with CLI args
    if let Some(url) = cli.storage_url {
        config.storage.url = url;
    }
    if let Some(level) = cli.log_level {
        config.logging.level = level;
    }
    config.logging.json |= cli.json;

    init_tracing(&config.logging.level, config.logging.json);

    match cli.command {
        Commands::Install => commands::install::execute(&config.storage)
            .await
            .context("Failed to install the run store")?,
        Commands::Run(args) => {
            let outcome = commands::run::execute(args, &config, cli.output).await?;
            return Ok(u8::try_from(outcome.exit_code()).unwrap_or(1));
        }
        Commands::Show { run_id } => {
            commands::show::execute(&config.storage, run_id.as_deref(), cli.output).await?
        }
        Commands::Summary { run_id } => {
            commands::summary::execute(&config.storage, run_id.as_deref(), cli.output).await?
        }
    }
    Ok(0)
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    match execute(cli).await {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            output::print_error(&format!("{:#}", e));
            ExitCode::FAILURE
        }
    }
}
