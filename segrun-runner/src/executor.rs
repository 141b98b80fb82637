//! Case execution
//!
//! Drives one case through stage -> invoke -> collect, retrying the attempts
//! that failed for environmental reasons. Every attempt gets a fresh
//! workspace that is removed again once the attempt is over.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use segrun_core::domain::case::{CaseDescriptor, CaseError, CaseErrorKind, CaseResult};
use segrun_core::domain::job::InferenceParams;
use segrun_core::domain::log::{ProgressEvent, Stage};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::command::CommandBuilder;
use crate::process::{ExitOutcome, ProcessRunner};
use crate::progress::{ParseContext, parse_line};
use crate::workspace::CaseWorkspace;

// ============================================================================
// Configuration
// ============================================================================

/// Receives progress events as they are produced
pub trait ProgressSink: Send + Sync {
    fn emit(&self, event: ProgressEvent);
}

impl<F> ProgressSink for F
where
    F: Fn(ProgressEvent) + Send + Sync,
{
    fn emit(&self, event: ProgressEvent) {
        self(event)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Extra attempts after the first, applied only to retryable failures
    pub max_retries: u32,
}

impl RetryPolicy {
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    pub fn should_retry(&self, error: &CaseError, attempt: u32) -> bool {
        error.kind.is_retryable() && attempt < self.max_attempts()
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { max_retries: 1 }
    }
}

#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Root of the per-case scratch directories
    pub work_root: PathBuf,
    /// Collected outputs land in `<results_root>/<job_id>/`
    pub results_root: PathBuf,
    /// Default per-invocation timeout; `None` means unbounded
    pub timeout: Option<Duration>,
    pub grace_period: Duration,
    pub retry: RetryPolicy,
    /// Identical consecutive progress redraws within this window are emitted once
    pub duplicate_window: Duration,
}

impl ExecutorConfig {
    pub fn new(work_root: impl Into<PathBuf>, results_root: impl Into<PathBuf>) -> Self {
        Self {
            work_root: work_root.into(),
            results_root: results_root.into(),
            timeout: Some(Duration::from_secs(3600)),
            grace_period: Duration::from_secs(10),
            retry: RetryPolicy::default(),
            duplicate_window: Duration::from_millis(200),
        }
    }
}

// ============================================================================
// Executor
// ============================================================================

/// How a case run ended
#[derive(Debug, Clone, PartialEq)]
pub enum CaseRun {
    /// The case reached a final outcome, successful or not
    Finished(CaseResult),
    /// Cancellation interrupted the case; no result is recorded for it
    Cancelled { case_id: String, attempts: u32 },
}

enum Attempt {
    Succeeded(PathBuf),
    Failed(CaseError),
    Cancelled,
}

impl From<CaseError> for Attempt {
    fn from(error: CaseError) -> Self {
        Attempt::Failed(error)
    }
}

pub struct CaseExecutor {
    config: ExecutorConfig,
    builder: Arc<dyn CommandBuilder>,
    runner: ProcessRunner,
}

impl CaseExecutor {
    pub fn new(config: ExecutorConfig, builder: Arc<dyn CommandBuilder>) -> Self {
        let runner = ProcessRunner::new(config.grace_period);
        Self {
            config,
            builder,
            runner,
        }
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// Directory holding the collected outputs of one job
    pub fn results_dir(&self, job_id: Uuid) -> PathBuf {
        self.config.results_root.join(job_id.to_string())
    }

    /// Runs one case to a final outcome
    ///
    /// # Arguments
    /// * `job_id` - Owning job, used to lay out scratch and result directories
    /// * `params` - Job-wide inference parameters
    /// * `case` - The case to run
    /// * `sink` - Receives every progress event, stamped with the case id
    /// * `cancel` - Terminates the running invocation when triggered
    pub async fn execute(
        &self,
        job_id: Uuid,
        params: &InferenceParams,
        case: &CaseDescriptor,
        sink: &dyn ProgressSink,
        cancel: &CancellationToken,
    ) -> CaseRun {
        let case_id = case.effective_id();
        let max_attempts = self.config.retry.max_attempts();
        let mut attempt = 0;

        loop {
            if cancel.is_cancelled() {
                return CaseRun::Cancelled {
                    case_id,
                    attempts: attempt,
                };
            }
            attempt += 1;

            sink.emit(
                ProgressEvent::info(
                    Stage::Setup,
                    format!(
                        "Starting case {} (attempt {}/{})",
                        case_id, attempt, max_attempts
                    ),
                )
                .for_case(&case_id),
            );

            let workspace = CaseWorkspace::new(&self.config.work_root, job_id, &case_id);
            let outcome = self
                .run_attempt(job_id, params, case, &case_id, &workspace, sink, cancel)
                .await;
            workspace.cleanup().await;

            match outcome {
                Attempt::Succeeded(output) => {
                    info!("Case {} of job {} succeeded", case_id, job_id);
                    sink.emit(
                        ProgressEvent::info(
                            Stage::Postprocessing,
                            format!("Case {} finished: {}", case_id, output.display()),
                        )
                        .for_case(&case_id)
                        .with_percent(100),
                    );
                    return CaseRun::Finished(CaseResult::succeeded(case_id, output, attempt));
                }
                Attempt::Cancelled => {
                    info!("Case {} of job {} cancelled", case_id, job_id);
                    sink.emit(
                        ProgressEvent::warning(Stage::Setup, format!("Case {} cancelled", case_id))
                            .for_case(&case_id),
                    );
                    return CaseRun::Cancelled {
                        case_id,
                        attempts: attempt,
                    };
                }
                Attempt::Failed(error)
                    if self.config.retry.should_retry(&error, attempt) && !cancel.is_cancelled() =>
                {
                    warn!(
                        "Case {} of job {} attempt {} failed, retrying: {}",
                        case_id, job_id, attempt, error
                    );
                    sink.emit(
                        ProgressEvent::warning(
                            Stage::Setup,
                            format!("Attempt {} failed ({}), retrying", attempt, error),
                        )
                        .for_case(&case_id),
                    );
                }
                Attempt::Failed(error) => {
                    warn!("Case {} of job {} failed: {}", case_id, job_id, error);
                    sink.emit(
                        ProgressEvent::error(
                            Stage::Setup,
                            format!("Case {} failed: {}", case_id, error),
                        )
                        .for_case(&case_id),
                    );
                    return CaseRun::Finished(CaseResult::failed(case_id, error, attempt));
                }
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_attempt(
        &self,
        job_id: Uuid,
        params: &InferenceParams,
        case: &CaseDescriptor,
        case_id: &str,
        workspace: &CaseWorkspace,
        sink: &dyn ProgressSink,
        cancel: &CancellationToken,
    ) -> Attempt {
        if let Err(e) = workspace.prepare().await {
            return e.into();
        }
        match workspace.stage_inputs(&case.input_path).await {
            Ok(count) => sink.emit(
                ProgressEvent::info(
                    Stage::Preprocessing,
                    format!("Staged {} input file(s)", count),
                )
                .for_case(case_id),
            ),
            Err(e) => return e.into(),
        }

        let spec = match self.builder.build(params, case, workspace) {
            Ok(spec) => spec.timeout(self.effective_timeout(case)),
            Err(reason) => return CaseError::new(CaseErrorKind::LaunchFailed, reason).into(),
        };
        if cancel.is_cancelled() {
            return Attempt::Cancelled;
        }

        debug!("Case {}: {}", case_id, spec);
        let mut handle = match self.runner.spawn(&spec, cancel.clone()) {
            Ok(handle) => handle,
            Err(e) => return CaseError::new(CaseErrorKind::LaunchFailed, e.to_string()).into(),
        };

        let mut context = ParseContext::default();
        let mut dedup = DuplicateFilter::new(self.config.duplicate_window);
        let mut last_error: Option<String> = None;

        while let Some(line) = handle.next_line().await {
            let Some(parsed) = parse_line(&line, &context) else {
                continue;
            };
            context = parsed.context;
            let mut event = parsed.event;
            // The tool only sees staged names, so its own case ids are not ours.
            event.case_id = Some(case_id.to_string());
            if event.is_error {
                last_error = Some(event.message.clone());
            }
            if dedup.admit(&event, Instant::now()) {
                sink.emit(event);
            }
        }

        let outcome = match handle.wait().await {
            Ok(outcome) => outcome,
            Err(e) => return CaseError::new(CaseErrorKind::AbnormalExit, e.to_string()).into(),
        };

        match outcome {
            ExitOutcome::Success => {
                match workspace
                    .collect_output(&self.results_dir(job_id), case_id)
                    .await
                {
                    Ok(path) => Attempt::Succeeded(path),
                    Err(e) => e.into(),
                }
            }
            ExitOutcome::AbnormalExit { .. } => {
                let detail = match last_error {
                    Some(line) => format!("{}: {}", outcome, line),
                    None => outcome.to_string(),
                };
                CaseError::new(CaseErrorKind::AbnormalExit, detail).into()
            }
            ExitOutcome::TimedOut => {
                let detail = match spec.timeout {
                    Some(limit) => format!("no exit within {}s", limit.as_secs_f64()),
                    None => "timed out".to_string(),
                };
                CaseError::new(CaseErrorKind::TimedOut, detail).into()
            }
            ExitOutcome::Cancelled => Attempt::Cancelled,
        }
    }

    /// Per-case override wins; an override of 0 means unbounded
    fn effective_timeout(&self, case: &CaseDescriptor) -> Option<Duration> {
        match case.overrides.timeout_secs {
            Some(0) => None,
            Some(secs) => Some(Duration::from_secs(secs)),
            None => self.config.timeout,
        }
    }
}

/// Drops a progress redraw identical to the previous one within a short window
///
/// Progress bars redraw the same text many times per second. Only events
/// carrying a percent are throttled; every other line, and every error line,
/// is always emitted.
struct DuplicateFilter {
    window: Duration,
    last: Option<(String, Instant)>,
}

impl DuplicateFilter {
    fn new(window: Duration) -> Self {
        Self { window, last: None }
    }

    fn admit(&mut self, event: &ProgressEvent, now: Instant) -> bool {
        if event.percent.is_none() || event.is_error {
            self.last = None;
            return true;
        }
        if let Some((last, at)) = &self.last {
            if *last == event.message && now.duration_since(*at) < self.window {
                return false;
            }
        }
        self.last = Some((event.message.clone(), now));
        true
    }
}
