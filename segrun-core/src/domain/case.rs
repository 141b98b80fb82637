//! Case domain types

use std::fmt;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One unit of input data processed by a single inference invocation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaseDescriptor {
    /// Explicit case id; derived from `input_path` when absent
    #[serde(default)]
    pub case_id: Option<String>,
    /// A NIfTI file, or a directory holding the channel files of one case
    pub input_path: PathBuf,
    #[serde(default)]
    pub overrides: CaseOverrides,
}

/// Per-case overrides of the job parameters
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CaseOverrides {
    pub configuration: Option<String>,
    pub folds: Option<String>,
    pub timeout_secs: Option<u64>,
}

impl CaseDescriptor {
    pub fn new(input_path: impl Into<PathBuf>) -> Self {
        Self {
            case_id: None,
            input_path: input_path.into(),
            overrides: CaseOverrides::default(),
        }
    }

    pub fn with_id(mut self, case_id: impl Into<String>) -> Self {
        self.case_id = Some(case_id.into());
        self
    }

    /// The explicit case id, or one derived from the input path
    pub fn effective_id(&self) -> String {
        match &self.case_id {
            Some(id) if !id.trim().is_empty() => id.trim().to_string(),
            _ => derive_case_id(&self.input_path),
        }
    }
}

/// Derives a case id from a file or directory path
///
/// `liver_12_0000.nii.gz` -> `liver_12`, `scan.nii` -> `scan`, `study-7/` -> `study-7`.
pub fn derive_case_id(path: &Path) -> String {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();

    let base = match nifti_extension(&name) {
        Some(ext) => &name[..name.len() - ext.len()],
        None => name.as_str(),
    };
    let base = strip_channel_suffix(base);

    if base.is_empty() {
        "case".to_string()
    } else {
        base.to_string()
    }
}

/// Returns the NIfTI extension (`.nii.gz` or `.nii`) of a file name, if any
pub fn nifti_extension(name: &str) -> Option<&'static str> {
    let lower = name.to_ascii_lowercase();
    if lower.ends_with(".nii.gz") {
        Some(".nii.gz")
    } else if lower.ends_with(".nii") {
        Some(".nii")
    } else {
        None
    }
}

/// Splits `<id>_<NNNN>` into `<id>`; anything else is returned unchanged
pub fn strip_channel_suffix(base: &str) -> &str {
    split_channel(base).map(|(id, _)| id).unwrap_or(base)
}

/// Splits `<id>_<NNNN>` into the id and the channel number
pub fn split_channel(base: &str) -> Option<(&str, u32)> {
    let (id, channel) = base.rsplit_once('_')?;
    if id.is_empty() || channel.len() != 4 || !channel.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    channel.parse().ok().map(|ch| (id, ch))
}

/// Final outcome of one case
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CaseOutcome {
    Succeeded,
    Failed,
}

/// Why a case failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CaseErrorKind {
    LaunchFailed,
    TimedOut,
    AbnormalExit,
    OutputMissing,
    InputInvalid,
}

impl CaseErrorKind {
    /// Whether another attempt could plausibly succeed
    pub fn is_retryable(self) -> bool {
        matches!(self, CaseErrorKind::LaunchFailed | CaseErrorKind::TimedOut)
    }
}

impl fmt::Display for CaseErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CaseErrorKind::LaunchFailed => "launch failed",
            CaseErrorKind::TimedOut => "timed out",
            CaseErrorKind::AbnormalExit => "abnormal exit",
            CaseErrorKind::OutputMissing => "output missing",
            CaseErrorKind::InputInvalid => "invalid input",
        };
        f.write_str(s)
    }
}

/// Diagnostic attached to a failed case
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaseError {
    pub kind: CaseErrorKind,
    pub detail: String,
}

impl CaseError {
    pub fn new(kind: CaseErrorKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: detail.into(),
        }
    }
}

impl fmt::Display for CaseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.detail)
    }
}

impl std::error::Error for CaseError {}

/// Outcome of one case, finalized once per completed case
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaseResult {
    pub case_id: String,
    pub outcome: CaseOutcome,
    /// Present iff the case succeeded
    pub output_path: Option<PathBuf>,
    /// Present iff the case failed
    pub error: Option<CaseError>,
    /// Number of attempts consumed, including the first
    pub attempts: u32,
    pub finished_at: DateTime<Utc>,
}

impl CaseResult {
    pub fn succeeded(case_id: impl Into<String>, output_path: PathBuf, attempts: u32) -> Self {
        Self {
            case_id: case_id.into(),
            outcome: CaseOutcome::Succeeded,
            output_path: Some(output_path),
            error: None,
            attempts,
            finished_at: Utc::now(),
        }
    }

    pub fn failed(case_id: impl Into<String>, error: CaseError, attempts: u32) -> Self {
        Self {
            case_id: case_id.into(),
            outcome: CaseOutcome::Failed,
            output_path: None,
            error: Some(error),
            attempts,
            finished_at: Utc::now(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.outcome == CaseOutcome::Succeeded
    }
}
