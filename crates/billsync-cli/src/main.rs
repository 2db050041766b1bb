//! billsync CLI - incremental billing sync
//!
//! Runs sync jobs on demand, drives the cron schedule and inspects failed
//! records and configuration.

mod commands;
mod output;

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "billsync")]
#[command(author, version, about = "Incremental legacy billing sync CLI", long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Output format: table (default) or json
    #[arg(long, global = true, default_value = "table")]
    format: output::OutputFormat,

    /// Suppress progress messages
    #[arg(long, short, global = true)]
    quiet: bool,

    /// Override config file path (or set BILLSYNC_CONFIG env var)
    #[arg(long, env = "BILLSYNC_CONFIG", global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one sync job now
    Run(commands::run::RunArgs),

    /// List jobs with their effective settings
    Jobs,

    /// Run the configured cron schedule until interrupted
    Schedule,

    /// List records that failed and have not been migrated since
    Failures(commands::failures::FailuresArgs),

    /// Manage configuration
    Config {
        #[command(subcommand)]
        action: commands::config::ConfigAction,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let default_level = if cli.quiet { "warn" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .format_timestamp_millis()
        .init();

    if let Err(e) = dispatch(cli).await {
        output::print_error(&format!("Error: {:#}", e));
        std::process::exit(1);
    }
}

async fn dispatch(cli: Cli) -> Result<()> {
    let ctx = commands::Context {
        format: cli.format,
        quiet: cli.quiet,
        config_path: cli.config,
    };

    match cli.command {
        Commands::Run(args) => commands::run::execute(&ctx, args).await,
        Commands::Jobs => commands::jobs::execute(&ctx).await,
        Commands::Schedule => commands::schedule::execute(&ctx).await,
        Commands::Failures(args) => commands::failures::execute(&ctx, args).await,
        Commands::Config { action } => commands::config::execute(&ctx, action).await,
    }
}
