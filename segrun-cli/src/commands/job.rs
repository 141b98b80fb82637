//! Job command handlers
//!
//! Handles listing, inspecting, log tailing, cancellation and result
//! download of jobs.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Subcommand;
use colored::*;
use segrun_client::OrchestratorClient;
use segrun_core::domain::case::CaseOutcome;
use segrun_core::domain::job::JobState;
use segrun_core::domain::log::{LogLevel, LogRecord};
use segrun_core::dto::job::{JobStatusView, JobSummary};
use uuid::Uuid;

use crate::config::Config;
use crate::id_resolver::resolve_job_id;

/// Job subcommands
#[derive(Subcommand)]
pub enum JobCommands {
    /// List all jobs
    List,
    /// Show job status and per-case results
    Status {
        /// Job ID or unambiguous prefix
        id: String,
    },
    /// Show job logs
    Logs {
        /// Job ID or unambiguous prefix
        id: String,

        /// Keep printing new events until the job finishes
        #[arg(short, long)]
        follow: bool,
    },
    /// Request cancellation of a job
    Cancel {
        /// Job ID or unambiguous prefix
        id: String,
    },
    /// Download the result archive of a finished job
    Download {
        /// Job ID or unambiguous prefix
        id: String,

        /// Destination file (default: ./<job id>.zip)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

/// Handle job commands
///
/// # Arguments
/// * `command` - The job command to execute
/// * `client` - Client of the configured orchestrator
/// * `config` - The CLI configuration
pub async fn handle_job_command(
    command: JobCommands,
    client: &OrchestratorClient,
    config: &Config,
) -> Result<()> {
    match command {
        JobCommands::List => list_jobs(client).await,
        JobCommands::Status { id } => show_status(client, &id).await,
        JobCommands::Logs { id, follow } => show_logs(client, config, &id, follow).await,
        JobCommands::Cancel { id } => cancel_job(client, &id).await,
        JobCommands::Download { id, output } => {
            let job_id = resolve_job_id(client, &id).await?;
            let dest = output.unwrap_or_else(|| default_archive_path(job_id));
            download_result(client, job_id, &dest).await
        }
    }
}

/// List all jobs
async fn list_jobs(client: &OrchestratorClient) -> Result<()> {
    let jobs = client.list_jobs().await.context("Failed to list jobs")?;

    if jobs.is_empty() {
        println!("{}", "No jobs found.".yellow());
    } else {
        println!("{}", format!("Found {} job(s):", jobs.len()).bold());
        println!();
        for job in &jobs {
            print_job_summary(job);
        }
    }

    Ok(())
}

async fn show_status(client: &OrchestratorClient, id: &str) -> Result<()> {
    let job_id = resolve_job_id(client, id).await?;
    let status = client.get_job(job_id).await?;

    print_job_details(&status);

    Ok(())
}

async fn show_logs(
    client: &OrchestratorClient,
    config: &Config,
    id: &str,
    follow: bool,
) -> Result<()> {
    let job_id = resolve_job_id(client, id).await?;

    if follow {
        let status = follow_job(client, config, job_id).await?;
        println!();
        println!("Job finished: {}", colorize_state(status.state));
        return Ok(());
    }

    let page = client.get_logs(job_id, 0).await?;
    if page.events.is_empty() {
        println!("{}", "No logs found for this job.".yellow());
        return Ok(());
    }

    println!("{}", format!("Logs for job {}:", job_id).bold());
    println!("{}", "─".repeat(80).dimmed());
    if page.dropped > 0 {
        println!(
            "{}",
            format!("… {} earlier event(s) no longer retained", page.dropped).dimmed()
        );
    }
    for record in &page.events {
        print_log_record(record);
    }
    println!("{}", "─".repeat(80).dimmed());

    Ok(())
}

async fn cancel_job(client: &OrchestratorClient, id: &str) -> Result<()> {
    let job_id = resolve_job_id(client, id).await?;

    match client.cancel_job(job_id).await {
        Ok(accepted) => {
            println!(
                "{} Cancellation requested for job {} (currently {})",
                "✓".green(),
                job_id.to_string().cyan(),
                colorize_state(accepted.state)
            );
            Ok(())
        }
        Err(e) if e.is_conflict() => {
            println!("{}", format!("Job {} has already finished.", job_id).yellow());
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

/// Print log events and status updates until the job is terminal
///
/// # Returns
/// The terminal status
pub async fn follow_job(
    client: &OrchestratorClient,
    config: &Config,
    job_id: Uuid,
) -> Result<JobStatusView> {
    let mut last_percent = None;
    let status = client
        .wait_until_done(job_id, config.poll_interval, |status, events| {
            for record in events {
                print_log_record(record);
            }
            if last_percent != Some(status.percent) {
                last_percent = Some(status.percent);
                println!(
                    "{} {}% {}",
                    "▸".cyan(),
                    status.percent,
                    status.current_case.as_deref().unwrap_or("").dimmed()
                );
            }
        })
        .await
        .with_context(|| format!("Lost track of job {}", job_id))?;

    Ok(status)
}

/// Download a result archive to `dest`
pub async fn download_result(client: &OrchestratorClient, job_id: Uuid, dest: &Path) -> Result<()> {
    let bytes = client
        .download_result(job_id, dest)
        .await
        .with_context(|| format!("Failed to download result of job {}", job_id))?;

    println!(
        "{} Saved {} ({} bytes)",
        "✓".green(),
        dest.display().to_string().cyan(),
        bytes
    );
    Ok(())
}

pub fn default_archive_path(job_id: Uuid) -> PathBuf {
    PathBuf::from(format!("{}.zip", job_id))
}

// =============================================================================
// Output
// =============================================================================

fn print_job_summary(job: &JobSummary) {
    println!("  {} Job {}", "▸".cyan(), job.id.to_string().dimmed());
    println!("    Dataset:  {}", job.dataset);
    println!("    State:    {} ({}%)", colorize_state(job.state), job.percent);
    println!(
        "    Cases:    {} total, {} succeeded, {} failed",
        job.case_count,
        job.succeeded.to_string().green(),
        job.failed.to_string().red()
    );
    println!(
        "    Created:  {}",
        job.created_at
            .format("%Y-%m-%d %H:%M:%S")
            .to_string()
            .dimmed()
    );
    println!();
}

/// Print detailed job information
pub fn print_job_details(job: &JobStatusView) {
    println!("{}", "Job Details:".bold());
    println!("  ID:          {}", job.id.to_string().cyan());
    println!("  State:       {}", colorize_state(job.state));
    println!("  Progress:    {}%", job.percent);
    println!(
        "  Model:       dataset {} / {} / folds {}",
        job.params.dataset, job.params.configuration, job.params.folds
    );
    println!("  Created:     {}", job.created_at.format("%Y-%m-%d %H:%M:%S"));

    if let Some(started) = job.started_at {
        println!("  Started:     {}", started.format("%Y-%m-%d %H:%M:%S"));
    }

    if let Some(finished) = job.finished_at {
        println!("  Finished:    {}", finished.format("%Y-%m-%d %H:%M:%S"));
        if let Some(started) = job.started_at {
            let seconds = finished.signed_duration_since(started).num_seconds();
            println!("  Duration:    {}s", seconds);
        }
    }

    if let Some(case) = &job.current_case {
        println!("  Current:     {}", case);
    }
    if job.cancel_requested && !job.state.is_terminal() {
        println!("  {}", "Cancellation requested".yellow());
    }

    println!(
        "\n{} ({} of {} finished)",
        "Cases:".bold(),
        job.case_results.len(),
        job.case_count
    );
    for result in &job.case_results {
        match (result.outcome, &result.error) {
            (CaseOutcome::Succeeded, _) => {
                println!("  {} {}", "✓".green(), result.case_id);
            }
            (CaseOutcome::Failed, Some(error)) => {
                println!("  {} {}: {}", "✗".red(), result.case_id, error.to_string().red());
            }
            (CaseOutcome::Failed, None) => {
                println!("  {} {}", "✗".red(), result.case_id);
            }
        }
    }
}

/// Print a log record
pub fn print_log_record(record: &LogRecord) {
    let event = &record.event;
    let level_str = format!("{:?}", event.level).to_uppercase();
    let level_colored = match event.level {
        LogLevel::Debug => level_str.dimmed(),
        LogLevel::Info => level_str.cyan(),
        LogLevel::Warning => level_str.yellow(),
        LogLevel::Error => level_str.red(),
    };
    let case = event
        .case_id
        .as_deref()
        .map(|c| format!("{} ", c))
        .unwrap_or_default();

    println!(
        "{} [{}] {}{}",
        event.timestamp.format("%H:%M:%S").to_string().dimmed(),
        level_colored,
        case.dimmed(),
        event.message
    );
}

/// Colorize job state for display
pub fn colorize_state(state: JobState) -> ColoredString {
    let state_str = state.to_string();
    match state {
        JobState::Pending => state_str.yellow(),
        JobState::Running | JobState::Packaging => state_str.cyan(),
        JobState::Succeeded => state_str.green(),
        JobState::PartiallyFailed => state_str.yellow(),
        JobState::Failed => state_str.red(),
        JobState::Cancelled => state_str.dimmed(),
    }
}
