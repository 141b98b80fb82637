//! Submit command handler

use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use clap::Args;
use colored::*;
use segrun_client::OrchestratorClient;
use segrun_core::domain::job::{InferenceParams, JobState};
use segrun_core::dto::job::SubmitJob;

use crate::cases::{collect_cases, ensure_cases};
use crate::commands::job::{default_archive_path, download_result, follow_job, print_job_details};
use crate::config::Config;

/// Arguments of `segrun submit`
#[derive(Args)]
pub struct SubmitArgs {
    /// Directory holding the case images
    pub dir: PathBuf,

    /// Dataset (task) id of the trained model
    #[arg(short, long, default_value = "101")]
    pub dataset: String,

    /// Model configuration
    #[arg(short, long, default_value = "3d_fullres")]
    pub config: String,

    /// Folds, e.g. "0" or "0,1,2"
    #[arg(short, long, default_value = "0")]
    pub folds: String,

    /// Where multi-channel cases are staged (default: <dir>/.segrun-staging)
    #[arg(long)]
    pub stage_dir: Option<PathBuf>,

    /// Follow the job until it finishes
    #[arg(short, long)]
    pub wait: bool,

    /// Download the result archive once finished (implies --wait)
    #[arg(long)]
    pub download: Option<PathBuf>,
}

/// Collect the cases of a directory, submit them and optionally follow the job
pub async fn handle_submit(args: SubmitArgs, client: &OrchestratorClient, config: &Config) -> Result<()> {
    let cases = collect_cases(&args.dir)?;
    ensure_cases(&cases, &args.dir)?;

    let stage_root = match args.stage_dir {
        Some(dir) => dir,
        None => std::fs::canonicalize(&args.dir)?.join(".segrun-staging"),
    };

    println!("{}", format!("Found {} case(s):", cases.len()).bold());
    let mut descriptors = Vec::with_capacity(cases.len());
    for case in cases {
        println!("  {} {}", "▸".cyan(), case.case_id);
        descriptors.push(case.into_descriptor(&stage_root)?);
    }

    let request = SubmitJob {
        cases: descriptors,
        params: InferenceParams {
            dataset: args.dataset,
            configuration: args.config,
            folds: args.folds,
        },
    };
    let created = client
        .submit_job(&request)
        .await
        .context("Failed to submit job")?;

    println!();
    println!(
        "{} Submitted job {}",
        "✓".green(),
        created.job_id.to_string().cyan()
    );

    if !args.wait && args.download.is_none() {
        return Ok(());
    }

    let status = follow_job(client, config, created.job_id).await?;
    println!();
    print_job_details(&status);

    match status.state {
        JobState::Succeeded | JobState::PartiallyFailed => {
            if let Some(dest) = args.download {
                let dest = if dest.is_dir() {
                    dest.join(default_archive_path(created.job_id))
                } else {
                    dest
                };
                download_result(client, created.job_id, &dest).await?;
            }
            Ok(())
        }
        state => bail!("Job {} finished as {}", created.job_id, state),
    }
}
