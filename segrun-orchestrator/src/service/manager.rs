//! Job Manager
//!
//! Drives one job from `Pending` to a terminal state:
//! - Cases run strictly one after another
//! - Cancellation is checked at every case boundary; a running case is
//!   terminated through its cancellation token
//! - Once every case has a result, successful outputs are packaged and the
//!   final state is derived from the case outcomes

use std::sync::Arc;

use async_trait::async_trait;
use segrun_core::domain::case::{CaseDescriptor, CaseResult};
use segrun_core::domain::job::{InferenceParams, Job, JobState};
use segrun_core::domain::log::{ProgressEvent, Stage};
use segrun_runner::{CaseExecutor, CaseRun, ProgressSink};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::repository::job_repository::{JobHandle, JobRegistry};
use crate::service::packaging::Packager;

/// Runs a single case to completion
#[async_trait]
pub trait CaseRunner: Send + Sync {
    async fn run_case(
        &self,
        job_id: Uuid,
        params: &InferenceParams,
        case: &CaseDescriptor,
        sink: &dyn ProgressSink,
        cancel: &CancellationToken,
    ) -> CaseRun;
}

#[async_trait]
impl CaseRunner for CaseExecutor {
    async fn run_case(
        &self,
        job_id: Uuid,
        params: &InferenceParams,
        case: &CaseDescriptor,
        sink: &dyn ProgressSink,
        cancel: &CancellationToken,
    ) -> CaseRun {
        self.execute(job_id, params, case, sink, cancel).await
    }
}

pub struct JobManager {
    registry: Arc<JobRegistry>,
    runner: Arc<dyn CaseRunner>,
    packager: Arc<dyn Packager>,
}

impl JobManager {
    pub fn new(
        registry: Arc<JobRegistry>,
        runner: Arc<dyn CaseRunner>,
        packager: Arc<dyn Packager>,
    ) -> Self {
        Self {
            registry,
            runner,
            packager,
        }
    }

    pub fn registry(&self) -> &Arc<JobRegistry> {
        &self.registry
    }

    /// Registers `job` and starts driving it on its own task
    pub fn launch(self: &Arc<Self>, job: Job) -> Uuid {
        let handle = self.registry.create(job);
        let id = handle.id();
        let manager = Arc::clone(self);
        tokio::spawn(async move { manager.drive(handle).await });
        id
    }

    /// Runs every case of the job and leaves it in a terminal state
    pub async fn drive(&self, handle: JobHandle) {
        let job_id = handle.id();

        let started = handle.update(|job| {
            job.start()?;
            job.log_event(ProgressEvent::info(
                Stage::Setup,
                format!(
                    "Job started: {} case(s), dataset {}, configuration {}",
                    job.cases.len(),
                    job.params.dataset,
                    job.params.configuration
                ),
            ));
            Ok::<_, segrun_core::domain::job::TransitionError>((
                job.cases.clone(),
                job.params.clone(),
            ))
        });
        let (cases, params) = match started {
            Ok(started) => started,
            Err(e) => {
                error!("Job {} could not start: {}", job_id, e);
                return;
            }
        };
        info!("Job {} started with {} case(s)", job_id, cases.len());

        let cancel = handle.cancel_token();
        let sink_handle = handle.clone();
        let sink = move |event: ProgressEvent| {
            sink_handle.update(|job| {
                if let (Some(percent), Some(case_id)) = (event.percent, event.case_id.as_deref()) {
                    job.set_case_progress(case_id, percent);
                }
                job.log_event(event);
            })
        };

        for (index, case) in cases.iter().enumerate() {
            if handle.cancel_requested() {
                self.finish_cancelled(&handle, index, cases.len());
                return;
            }

            let case_id = case.effective_id();
            handle.update(|job| {
                job.set_case_progress(&case_id, 0);
                job.log_event(
                    ProgressEvent::info(
                        Stage::Setup,
                        format!("Case {}/{}: {}", index + 1, cases.len(), case_id),
                    )
                    .for_case(&case_id),
                );
            });

            match self
                .runner
                .run_case(job_id, &params, case, &sink, &cancel)
                .await
            {
                CaseRun::Finished(result) => self.record(&handle, result),
                CaseRun::Cancelled { case_id, attempts } => {
                    info!(
                        "Job {}: case {} interrupted by cancellation after {} attempt(s)",
                        job_id, case_id, attempts
                    );
                    self.finish_cancelled(&handle, index, cases.len());
                    return;
                }
            }
        }

        // The last case may have finished just as cancellation arrived.
        if handle.cancel_requested() {
            self.finish_cancelled(&handle, cases.len(), cases.len());
            return;
        }

        self.package(&handle).await;
    }

    fn record(&self, handle: &JobHandle, result: CaseResult) {
        let job_id = handle.id();
        let event = match &result.error {
            None => {
                info!(
                    "Job {}: case {} succeeded after {} attempt(s)",
                    job_id, result.case_id, result.attempts
                );
                ProgressEvent::info(Stage::Setup, format!("Case {} succeeded", result.case_id))
            }
            Some(e) => {
                warn!("Job {}: case {} failed: {}", job_id, result.case_id, e);
                ProgressEvent::error(
                    Stage::Setup,
                    format!("Case {} failed: {}", result.case_id, e),
                )
            }
        }
        .for_case(&result.case_id);

        handle.update(|job| {
            job.log_event(event);
            if let Err(e) = job.record_case(result) {
                error!("Job {}: could not record case result: {}", job_id, e);
            }
        });
    }

    async fn package(&self, handle: &JobHandle) {
        let job_id = handle.id();

        let ready = handle.update(|job| {
            job.begin_packaging()?;
            job.log_event(ProgressEvent::info(
                Stage::Packaging,
                format!(
                    "All cases done: {} succeeded, {} failed",
                    job.succeeded_count(),
                    job.failed_count()
                ),
            ));
            Ok::<_, segrun_core::domain::job::TransitionError>((
                job.successful_outputs(),
                job.succeeded_count(),
                job.failed_count(),
            ))
        });
        let (outputs, succeeded, failed) = match ready {
            Ok(ready) => ready,
            Err(e) => {
                error!("Job {} could not enter packaging: {}", job_id, e);
                return;
            }
        };

        if succeeded == 0 {
            warn!("Job {}: no case succeeded, nothing to package", job_id);
            self.finish(
                handle,
                JobState::Failed,
                None,
                ProgressEvent::error(Stage::Packaging, "No case succeeded; no archive produced"),
            );
            return;
        }

        match self.packager.package(job_id, &outputs).await {
            Ok(archive) => {
                let state = JobState::from_case_outcomes(succeeded, failed);
                let event = ProgressEvent::info(
                    Stage::Packaging,
                    format!("Archive ready with {} output(s)", outputs.len()),
                );
                self.finish(handle, state, Some(archive), event);
            }
            Err(e) => {
                error!("Job {}: packaging failed: {}", job_id, e);
                self.finish(
                    handle,
                    JobState::Failed,
                    None,
                    ProgressEvent::error(Stage::Packaging, format!("Packaging failed: {}", e)),
                );
            }
        }
    }

    fn finish(
        &self,
        handle: &JobHandle,
        state: JobState,
        archive: Option<std::path::PathBuf>,
        event: ProgressEvent,
    ) {
        let job_id = handle.id();
        handle.update(|job| {
            job.log_event(event);
            match job.finish(state, archive) {
                Ok(()) => {
                    job.log_event(ProgressEvent::info(
                        Stage::Setup,
                        format!("Job finished: {}", state),
                    ));
                    info!("Job {} finished: {}", job_id, state);
                }
                Err(e) => error!("Job {} could not finish: {}", job_id, e),
            }
        });
    }

    fn finish_cancelled(&self, handle: &JobHandle, completed: usize, total: usize) {
        let job_id = handle.id();
        handle.update(|job| match job.cancel() {
            Ok(()) => {
                job.log_event(ProgressEvent::warning(
                    Stage::Setup,
                    format!(
                        "Job cancelled after {} of {} case(s); {} result(s) kept",
                        completed,
                        total,
                        job.case_results.len()
                    ),
                ));
                info!("Job {} cancelled", job_id);
            }
            Err(e) => error!("Job {} could not be cancelled: {}", job_id, e),
        });
    }
}
