//! Health command handler

use anyhow::{Context, Result};
use colored::*;
use segrun_client::OrchestratorClient;

/// Print orchestrator health
pub async fn show_health(client: &OrchestratorClient) -> Result<()> {
    let health = client
        .health()
        .await
        .with_context(|| format!("Orchestrator at {} is not reachable", client.base_url()))?;

    println!("{} {}", "✓".green(), format!("Orchestrator at {}", client.base_url()).bold());
    match &health.executable {
        Some(exe) if health.executable_found => println!("  Executable:  {}", exe.cyan()),
        Some(exe) => println!("  Executable:  {} {}", exe.red(), "(missing)".red()),
        None => println!("  Executable:  {}", "not configured".yellow()),
    }
    println!("  Active jobs: {}", health.active_jobs);

    Ok(())
}
