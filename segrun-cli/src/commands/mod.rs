//! Commands module
//!
//! Defines all CLI commands and their handlers.

mod health;
mod job;
mod submit;

pub use job::JobCommands;
pub use submit::SubmitArgs;

use anyhow::Result;
use clap::Subcommand;
use segrun_client::OrchestratorClient;

use crate::config::Config;

/// Top-level CLI commands
#[derive(Subcommand)]
pub enum Commands {
    /// Submit every case found in a directory
    Submit(SubmitArgs),
    /// Job management
    Job {
        #[command(subcommand)]
        command: JobCommands,
    },
    /// Check the orchestrator and its inference executable
    Health,
}

/// Handle a CLI command
///
/// Routes the command to the appropriate handler module.
///
/// # Arguments
/// * `command` - The command to execute
/// * `config` - The CLI configuration
pub async fn handle_command(command: Commands, config: &Config) -> Result<()> {
    let client = OrchestratorClient::new(&config.orchestrator_url);

    match command {
        Commands::Submit(args) => submit::handle_submit(args, &client, config).await,
        Commands::Job { command } => job::handle_job_command(command, &client, config).await,
        Commands::Health => health::show_health(&client).await,
    }
}
