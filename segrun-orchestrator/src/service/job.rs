//! Job Service
//!
//! Business logic behind the job endpoints: submission checks, lookups,
//! cancellation and result retrieval.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

use segrun_core::domain::case::CaseDescriptor;
use segrun_core::domain::job::{Job, JobState};
use segrun_core::domain::log::LogSlice;
use segrun_core::dto::job::{JobSummary, SubmitJob};
use segrun_runner::{job_dir, sanitize_component};
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::repository::job_repository::{JobRegistry, RegistryError};
use crate::service::job_manager::JobManager;

/// Service error type
#[derive(Debug, Error)]
pub enum JobError {
    #[error("job {0} not found")]
    NotFound(Uuid),

    #[error("{0}")]
    ValidationError(String),

    #[error("job {id} is already {state}")]
    AlreadyTerminal { id: Uuid, state: JobState },

    #[error("job {id} is still {state}")]
    NotReady { id: Uuid, state: JobState },

    #[error("job {id} ended {state} and has no result")]
    NoArtifact { id: Uuid, state: JobState },
}

impl From<RegistryError> for JobError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::NotFound(id) => JobError::NotFound(id),
            RegistryError::AlreadyTerminal { id, state } => JobError::AlreadyTerminal { id, state },
        }
    }
}

/// Validates a submission and launches the job
pub fn submit_job(
    manager: &Arc<JobManager>,
    req: SubmitJob,
    log_capacity: usize,
) -> Result<Uuid, JobError> {
    let SubmitJob { cases, mut params } = req;

    params.dataset = params.dataset.trim().to_string();
    if params.dataset.is_empty() {
        return Err(JobError::ValidationError(
            "params.dataset must not be empty".to_string(),
        ));
    }
    let cases = prepare_cases(cases)?;

    let job = Job::new(cases, params, log_capacity);
    let case_count = job.cases.len();
    let id = manager.launch(job);
    info!("Job created: {} with {} case(s)", id, case_count);

    Ok(id)
}

/// Checks every case and pins a unique case id on each
///
/// Ids are the explicit or derived id; repeats get `-2`, `-3`, ... so that
/// outputs never overwrite each other. Two ids count as repeats when they
/// map to the same output file name, e.g. `a b` and `a_b`.
pub fn prepare_cases(cases: Vec<CaseDescriptor>) -> Result<Vec<CaseDescriptor>, JobError> {
    if cases.is_empty() {
        return Err(JobError::ValidationError(
            "at least one case is required".to_string(),
        ));
    }

    let mut used: HashSet<String> = HashSet::new();
    let mut prepared = Vec::with_capacity(cases.len());

    for (index, mut case) in cases.into_iter().enumerate() {
        validate_input_path(index, &case)?;

        let base = case.effective_id();
        let mut id = base.clone();
        let mut key = sanitize_component(&id);
        let mut n = 1;
        while used.contains(&key) {
            n += 1;
            id = format!("{}-{}", base, n);
            key = sanitize_component(&id);
        }
        used.insert(key);

        case.case_id = Some(id);
        prepared.push(case);
    }

    Ok(prepared)
}

fn validate_input_path(index: usize, case: &CaseDescriptor) -> Result<(), JobError> {
    let raw = case.input_path.to_string_lossy();
    if raw.trim().is_empty() {
        return Err(JobError::ValidationError(format!(
            "cases[{}].input_path must not be empty",
            index
        )));
    }
    if raw.contains('\0') {
        return Err(JobError::ValidationError(format!(
            "cases[{}].input_path contains a NUL byte",
            index
        )));
    }
    Ok(())
}

/// Get a job by ID
pub fn get_job(registry: &JobRegistry, id: Uuid) -> Result<Job, JobError> {
    Ok(registry.get(id)?)
}

/// List all jobs
pub fn list_jobs(registry: &JobRegistry) -> Vec<JobSummary> {
    registry.list()
}

/// Log events of a job after `since`
pub fn job_logs(registry: &JobRegistry, id: Uuid, since: u64) -> Result<LogSlice, JobError> {
    Ok(registry.logs_since(id, since)?)
}

/// Requests cancellation of a non-terminal job
pub fn cancel_job(registry: &JobRegistry, id: Uuid) -> Result<(), JobError> {
    registry.request_cancel(id)?;
    info!("Cancellation requested for job {}", id);
    Ok(())
}

/// Path of the packaged result of a finished job
pub fn result_archive(registry: &JobRegistry, id: Uuid) -> Result<PathBuf, JobError> {
    let job = registry.get(id)?;

    if !job.state.is_terminal() {
        return Err(JobError::NotReady {
            id,
            state: job.state,
        });
    }
    match job.archive_path {
        Some(path) if job.state.has_artifact() => Ok(path),
        _ => Err(JobError::NoArtifact {
            id,
            state: job.state,
        }),
    }
}

/// Evicts finished jobs past the retention window and removes their files
///
/// # Returns
/// Number of evicted jobs
pub async fn evict_expired(registry: &JobRegistry, config: &Config) -> usize {
    let evicted = registry.evict_finished(config.job_retention);

    for job in &evicted {
        debug!("Evicting job {}", job.id);
        let mut dirs = vec![
            config.results_dir().join(job.id.to_string()),
            job_dir(&config.scratch_dir(), job.id),
        ];
        dirs.retain(|d| d.exists());
        for dir in dirs {
            if let Err(e) = tokio::fs::remove_dir_all(&dir).await {
                warn!("Failed to remove {}: {}", dir.display(), e);
            }
        }
        if let Some(archive) = &job.archive_path {
            if let Err(e) = tokio::fs::remove_file(archive).await {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!("Failed to remove {}: {}", archive.display(), e);
                }
            }
        }
    }

    if !evicted.is_empty() {
        info!("Evicted {} finished job(s)", evicted.len());
    }
    evicted.len()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(cases: &[CaseDescriptor]) -> Vec<&str> {
        cases
            .iter()
            .map(|c| c.case_id.as_deref().unwrap())
            .collect()
    }

    #[test]
    fn test_prepare_cases_assigns_unique_ids() {
        let cases = vec![
            CaseDescriptor::new("/a/liver_0000.nii.gz"),
            CaseDescriptor::new("/b/liver_0000.nii.gz"),
            CaseDescriptor::new("/c/liver.nii"),
            CaseDescriptor::new("/d/kidney.nii.gz"),
        ];
        let prepared = prepare_cases(cases).unwrap();
        assert_eq!(ids(&prepared), vec!["liver", "liver-2", "liver-3", "kidney"]);
    }

    #[test]
    fn test_prepare_cases_avoids_explicit_collisions() {
        let cases = vec![
            CaseDescriptor::new("/x/a.nii").with_id("a-2"),
            CaseDescriptor::new("/y/a.nii"),
            CaseDescriptor::new("/z/a.nii"),
        ];
        let prepared = prepare_cases(cases).unwrap();
        assert_eq!(ids(&prepared), vec!["a-2", "a", "a-3"]);
    }

    #[test]
    fn test_prepare_cases_dedupes_on_output_name() {
        let cases = vec![
            CaseDescriptor::new("/in/a b.nii.gz"),
            CaseDescriptor::new("/in/a_b.nii.gz"),
            CaseDescriptor::new("/in/x.nii").with_id("a?b"),
        ];
        let prepared = prepare_cases(cases).unwrap();
        assert_eq!(ids(&prepared), vec!["a b", "a_b-2", "a?b-3"]);

        let names: HashSet<String> = prepared
            .iter()
            .map(|c| sanitize_component(c.case_id.as_deref().unwrap()))
            .collect();
        assert_eq!(names.len(), 3);
    }

    #[test]
    fn test_prepare_cases_rejects_bad_input() {
        assert!(matches!(
            prepare_cases(vec![]),
            Err(JobError::ValidationError(_))
        ));
        assert!(matches!(
            prepare_cases(vec![CaseDescriptor::new("  ")]),
            Err(JobError::ValidationError(_))
        ));
        assert!(matches!(
            prepare_cases(vec![CaseDescriptor::new("/in/a\0b.nii")]),
            Err(JobError::ValidationError(_))
        ));
    }

    #[test]
    fn test_result_archive_states() {
        let registry = JobRegistry::new();
        let handle = registry.create(Job::new(
            vec![CaseDescriptor::new("/in/a.nii")],
            segrun_core::domain::job::InferenceParams::new("1"),
            10,
        ));
        let id = handle.id();

        assert!(matches!(
            result_archive(&registry, id),
            Err(JobError::NotReady { .. })
        ));

        handle.update(|job| {
            job.start().unwrap();
            job.cancel().unwrap();
        });
        assert!(matches!(
            result_archive(&registry, id),
            Err(JobError::NoArtifact {
                state: JobState::Cancelled,
                ..
            })
        ));

        assert!(matches!(
            result_archive(&registry, Uuid::new_v4()),
            Err(JobError::NotFound(_))
        ));
    }
}
