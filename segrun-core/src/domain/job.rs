//! Job domain types and the job state machine

use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::domain::case::{CaseDescriptor, CaseResult};
use crate::domain::log::{JobLog, ProgressEvent};

/// Task and configuration selectors passed through to every invocation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InferenceParams {
    /// Dataset/task tag, e.g. "101"
    pub dataset: String,
    #[serde(default = "default_configuration")]
    pub configuration: String,
    #[serde(default = "default_folds")]
    pub folds: String,
}

fn default_configuration() -> String {
    "3d_fullres".to_string()
}

fn default_folds() -> String {
    "0".to_string()
}

impl InferenceParams {
    pub fn new(dataset: impl Into<String>) -> Self {
        Self {
            dataset: dataset.into(),
            configuration: default_configuration(),
            folds: default_folds(),
        }
    }
}

/// Job lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobState {
    Pending,
    Running,
    Packaging,
    Succeeded,
    PartiallyFailed,
    Failed,
    Cancelled,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobState::Succeeded | JobState::PartiallyFailed | JobState::Failed | JobState::Cancelled
        )
    }

    /// Whether the state machine allows moving from `self` to `next`
    pub fn can_transition_to(self, next: JobState) -> bool {
        use JobState::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Running, Running)
                | (Running, Packaging)
                | (Running, Cancelled)
                | (Packaging, Succeeded)
                | (Packaging, PartiallyFailed)
                | (Packaging, Failed)
        )
    }

    /// Final state of a packaged job given its case outcomes
    pub fn from_case_outcomes(succeeded: usize, failed: usize) -> JobState {
        match (succeeded, failed) {
            (0, _) => JobState::Failed,
            (_, 0) => JobState::Succeeded,
            _ => JobState::PartiallyFailed,
        }
    }

    /// Whether a job in this state has a downloadable archive
    pub fn has_artifact(self) -> bool {
        matches!(self, JobState::Succeeded | JobState::PartiallyFailed)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransitionError {
    #[error("invalid transition from {from} to {to}")]
    Invalid { from: JobState, to: JobState },
    #[error("all {0} case results already recorded")]
    CaseResultsFull(usize),
}

/// One submitted batch of cases
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    /// Processing order
    pub cases: Vec<CaseDescriptor>,
    pub params: InferenceParams,
    pub state: JobState,
    /// Completion order
    pub case_results: Vec<CaseResult>,
    pub log: JobLog,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub cancel_requested: bool,
    /// Overall progress hint, 0..=100
    pub percent: u8,
    pub current_case: Option<String>,
    pub archive_path: Option<PathBuf>,
}

impl Job {
    pub fn new(cases: Vec<CaseDescriptor>, params: InferenceParams, log_capacity: usize) -> Self {
        Self {
            id: Uuid::new_v4(),
            cases,
            params,
            state: JobState::Pending,
            case_results: Vec::new(),
            log: JobLog::with_capacity(log_capacity),
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            cancel_requested: false,
            percent: 0,
            current_case: None,
            archive_path: None,
        }
    }

    fn transition(&mut self, next: JobState) -> Result<(), TransitionError> {
        if !self.state.can_transition_to(next) {
            return Err(TransitionError::Invalid {
                from: self.state,
                to: next,
            });
        }
        self.state = next;
        if next.is_terminal() && self.finished_at.is_none() {
            self.finished_at = Some(Utc::now());
            self.current_case = None;
        }
        Ok(())
    }

    /// Pending -> Running
    pub fn start(&mut self) -> Result<(), TransitionError> {
        if self.state != JobState::Pending {
            return Err(TransitionError::Invalid {
                from: self.state,
                to: JobState::Running,
            });
        }
        self.transition(JobState::Running)?;
        self.started_at = Some(Utc::now());
        Ok(())
    }

    /// Marks `case_id` as the case in flight and folds its percent into the overall hint
    pub fn set_case_progress(&mut self, case_id: &str, case_percent: u8) {
        if self.state != JobState::Running {
            return;
        }
        if self.current_case.as_deref() != Some(case_id) {
            self.current_case = Some(case_id.to_string());
        }
        let overall = self.overall_percent(case_percent);
        // The hint never moves backwards.
        self.percent = self.percent.max(overall);
    }

    /// Appends one finalized case result (Running -> Running)
    pub fn record_case(&mut self, result: CaseResult) -> Result<(), TransitionError> {
        if self.state != JobState::Running {
            return Err(TransitionError::Invalid {
                from: self.state,
                to: JobState::Running,
            });
        }
        if self.case_results.len() >= self.cases.len() {
            return Err(TransitionError::CaseResultsFull(self.cases.len()));
        }
        self.case_results.push(result);
        self.current_case = None;
        self.percent = self.percent.max(self.overall_percent(0));
        Ok(())
    }

    /// Running -> Packaging
    pub fn begin_packaging(&mut self) -> Result<(), TransitionError> {
        self.transition(JobState::Packaging)
    }

    /// Packaging -> Succeeded | PartiallyFailed | Failed
    pub fn finish(
        &mut self,
        state: JobState,
        archive_path: Option<PathBuf>,
    ) -> Result<(), TransitionError> {
        self.transition(state)?;
        if state.has_artifact() {
            self.archive_path = archive_path;
            self.percent = 100;
        }
        Ok(())
    }

    /// Running -> Cancelled
    pub fn cancel(&mut self) -> Result<(), TransitionError> {
        self.transition(JobState::Cancelled)
    }

    pub fn log_event(&mut self, event: ProgressEvent) -> u64 {
        self.log.push(event)
    }

    pub fn succeeded_count(&self) -> usize {
        self.case_results.iter().filter(|r| r.is_success()).count()
    }

    pub fn failed_count(&self) -> usize {
        self.case_results.len() - self.succeeded_count()
    }

    /// Output files of every succeeded case, in completion order
    pub fn successful_outputs(&self) -> Vec<PathBuf> {
        self.case_results
            .iter()
            .filter_map(|r| r.output_path.clone())
            .collect()
    }

    fn overall_percent(&self, case_percent: u8) -> u8 {
        let total = self.cases.len().max(1);
        let done = self.case_results.len().min(total);
        let raw = (done * 100 + case_percent.min(100) as usize) / total;
        raw.min(99) as u8
    }
}
