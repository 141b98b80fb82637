//! Segrun CLI
//!
//! Command-line interface for submitting segmentation jobs to the segrun
//! orchestrator and following them.

mod cases;
mod commands;
mod config;
mod id_resolver;
mod types;

use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use commands::{Commands, handle_command};
use config::Config;

#[derive(Parser)]
#[command(name = "segrun")]
#[command(about = "Segmentation inference job CLI", long_about = None)]
struct Cli {
    /// Orchestrator URL
    #[arg(
        long,
        env = "SEGRUN_ORCHESTRATOR_URL",
        default_value = "http://localhost:8000"
    )]
    orchestrator_url: String,

    /// Polling interval in milliseconds
    #[arg(long, env = "SEGRUN_POLL_MS", default_value_t = 1000)]
    poll_ms: u64,

    #[command(subcommand)]
    command: Commands,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = Config {
        orchestrator_url: cli.orchestrator_url,
        poll_interval: Duration::from_millis(cli.poll_ms.max(50)),
    };

    handle_command(cli.command, &config).await
}
