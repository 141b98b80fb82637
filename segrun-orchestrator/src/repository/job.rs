//! Job Repository
//!
//! In-memory registry of every known job. Each job sits behind its own lock
//! together with its cancellation token; reads hand out cloned snapshots, so
//! a reader never observes a half-applied update.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use chrono::Utc;
use segrun_core::domain::job::{Job, JobState};
use segrun_core::domain::log::LogSlice;
use segrun_core::dto::job::JobSummary;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("job {0} not found")]
    NotFound(Uuid),

    #[error("job {id} is already {state}")]
    AlreadyTerminal { id: Uuid, state: JobState },
}

struct JobSlot {
    job: RwLock<Job>,
    cancel: CancellationToken,
}

/// Exclusive write access to one registered job
///
/// Only the job manager holds one; everyone else goes through
/// [`JobRegistry`] reads.
#[derive(Clone)]
pub struct JobHandle {
    id: Uuid,
    slot: Arc<JobSlot>,
}

impl JobHandle {
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Applies `f` to the job under its write lock
    pub fn update<R>(&self, f: impl FnOnce(&mut Job) -> R) -> R {
        let mut job = self.slot.job.write().unwrap_or_else(PoisonError::into_inner);
        f(&mut job)
    }

    pub fn snapshot(&self) -> Job {
        self.slot
            .job
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn cancel_requested(&self) -> bool {
        self.slot
            .job
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .cancel_requested
    }

    /// Fires when cancellation is requested for this job
    pub fn cancel_token(&self) -> CancellationToken {
        self.slot.cancel.clone()
    }
}

#[derive(Default)]
struct Jobs {
    by_id: HashMap<Uuid, Arc<JobSlot>>,
    /// Creation order
    order: Vec<Uuid>,
}

#[derive(Default)]
pub struct JobRegistry {
    jobs: RwLock<Jobs>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a new job and returns the handle used to drive it
    pub fn create(&self, job: Job) -> JobHandle {
        let id = job.id;
        let slot = Arc::new(JobSlot {
            job: RwLock::new(job),
            cancel: CancellationToken::new(),
        });

        let mut jobs = self.jobs.write().unwrap_or_else(PoisonError::into_inner);
        jobs.by_id.insert(id, slot.clone());
        jobs.order.push(id);

        JobHandle { id, slot }
    }

    fn slot(&self, id: Uuid) -> Result<Arc<JobSlot>, RegistryError> {
        self.jobs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .by_id
            .get(&id)
            .cloned()
            .ok_or(RegistryError::NotFound(id))
    }

    /// Consistent snapshot of one job
    pub fn get(&self, id: Uuid) -> Result<Job, RegistryError> {
        let slot = self.slot(id)?;
        let job = slot.job.read().unwrap_or_else(PoisonError::into_inner);
        Ok(job.clone())
    }

    /// Sets the cancel flag and fires the job's cancellation token
    ///
    /// Cancellation is observed by the job manager at the next case
    /// boundary; a running invocation is terminated right away.
    pub fn request_cancel(&self, id: Uuid) -> Result<(), RegistryError> {
        let slot = self.slot(id)?;
        {
            let mut job = slot.job.write().unwrap_or_else(PoisonError::into_inner);
            if job.state.is_terminal() {
                return Err(RegistryError::AlreadyTerminal {
                    id,
                    state: job.state,
                });
            }
            job.cancel_requested = true;
        }
        slot.cancel.cancel();
        Ok(())
    }

    /// Summaries of every job, oldest first
    pub fn list(&self) -> Vec<JobSummary> {
        let slots: Vec<Arc<JobSlot>> = {
            let jobs = self.jobs.read().unwrap_or_else(PoisonError::into_inner);
            jobs.order
                .iter()
                .filter_map(|id| jobs.by_id.get(id).cloned())
                .collect()
        };

        slots
            .iter()
            .map(|slot| {
                let job = slot.job.read().unwrap_or_else(PoisonError::into_inner);
                JobSummary::from(&*job)
            })
            .collect()
    }

    /// Log events of one job after `cursor`
    pub fn logs_since(&self, id: Uuid, cursor: u64) -> Result<LogSlice, RegistryError> {
        let slot = self.slot(id)?;
        let job = slot.job.read().unwrap_or_else(PoisonError::into_inner);
        Ok(job.log.since(cursor))
    }

    /// Number of jobs not yet in a terminal state
    pub fn active_count(&self) -> usize {
        let jobs = self.jobs.read().unwrap_or_else(PoisonError::into_inner);
        jobs.by_id
            .values()
            .filter(|slot| {
                !slot
                    .job
                    .read()
                    .unwrap_or_else(PoisonError::into_inner)
                    .state
                    .is_terminal()
            })
            .count()
    }

    /// Removes terminal jobs that finished more than `older_than` ago
    ///
    /// # Returns
    /// Final snapshots of the evicted jobs, so their files can be removed
    pub fn evict_finished(&self, older_than: Duration) -> Vec<Job> {
        let cutoff = chrono::Duration::from_std(older_than)
            .ok()
            .and_then(|age| Utc::now().checked_sub_signed(age));
        let Some(cutoff) = cutoff else {
            return Vec::new();
        };

        let mut jobs = self.jobs.write().unwrap_or_else(PoisonError::into_inner);
        let expired: Vec<(Uuid, Job)> = jobs
            .by_id
            .iter()
            .filter_map(|(id, slot)| {
                let job = slot.job.read().unwrap_or_else(PoisonError::into_inner);
                match job.finished_at {
                    Some(finished) if job.state.is_terminal() && finished <= cutoff => {
                        Some((*id, job.clone()))
                    }
                    _ => None,
                }
            })
            .collect();

        for (id, _) in &expired {
            jobs.by_id.remove(id);
        }
        jobs.order.retain(|id| !expired.iter().any(|(gone, _)| gone == id));

        expired.into_iter().map(|(_, job)| job).collect()
    }
}
