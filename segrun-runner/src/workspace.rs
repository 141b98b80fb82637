//! Per-case scratch directories
//!
//! Each case attempt runs in `<work_root>/<job_id>/<case_id>/` with an `in/`
//! directory holding the staged channel files and an `out/` directory the
//! predictor writes into. The directory is recreated before every attempt
//! and removed after it.

use std::io;
use std::path::{Path, PathBuf};

use segrun_core::domain::case::{CaseError, CaseErrorKind, nifti_extension};
use tokio::fs;
use tracing::{debug, warn};
use uuid::Uuid;

/// Scratch directory of one job
pub fn job_dir(work_root: &Path, job_id: Uuid) -> PathBuf {
    work_root.join(job_id.to_string())
}

/// Makes a case id safe to use as a single path component
pub fn sanitize_component(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect();

    match cleaned.as_str() {
        "" | "." | ".." => "case".to_string(),
        _ => cleaned,
    }
}

#[derive(Debug, Clone)]
pub struct CaseWorkspace {
    root: PathBuf,
    input_dir: PathBuf,
    output_dir: PathBuf,
}

impl CaseWorkspace {
    pub fn new(work_root: &Path, job_id: Uuid, case_id: &str) -> Self {
        let root = job_dir(work_root, job_id).join(sanitize_component(case_id));
        Self {
            input_dir: root.join("in"),
            output_dir: root.join("out"),
            root,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn input_dir(&self) -> &Path {
        &self.input_dir
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// Recreates empty `in/` and `out/` directories
    ///
    /// Leftovers of a previous attempt are removed first, so a stale
    /// prediction can never be mistaken for a fresh one.
    pub async fn prepare(&self) -> Result<(), CaseError> {
        remove_dir_if_exists(&self.root)
            .await
            .map_err(|e| setup_error("failed to clear workspace", &self.root, e))?;
        fs::create_dir_all(&self.input_dir)
            .await
            .map_err(|e| setup_error("failed to create input dir", &self.input_dir, e))?;
        fs::create_dir_all(&self.output_dir)
            .await
            .map_err(|e| setup_error("failed to create output dir", &self.output_dir, e))?;
        Ok(())
    }

    /// Copies the case input into `in/` using the predictor's naming scheme
    ///
    /// A file input becomes `case_0000<ext>`. For a directory input every
    /// NIfTI file it contains is staged in name order as `case_0000<ext>`,
    /// `case_0001<ext>`, and so on.
    ///
    /// # Returns
    /// Number of staged channel files
    pub async fn stage_inputs(&self, input: &Path) -> Result<usize, CaseError> {
        let metadata = fs::metadata(input).await.map_err(|e| {
            CaseError::new(
                CaseErrorKind::InputInvalid,
                format!("cannot read input {}: {}", input.display(), e),
            )
        })?;

        let sources = if metadata.is_dir() {
            let files = nifti_files(input).await.map_err(|e| {
                CaseError::new(
                    CaseErrorKind::InputInvalid,
                    format!("cannot list input dir {}: {}", input.display(), e),
                )
            })?;
            if files.is_empty() {
                return Err(CaseError::new(
                    CaseErrorKind::InputInvalid,
                    format!("no NIfTI files in {}", input.display()),
                ));
            }
            files
        } else {
            if nifti_extension(&file_name(input)).is_none() {
                return Err(CaseError::new(
                    CaseErrorKind::InputInvalid,
                    format!("not a NIfTI file: {}", input.display()),
                ));
            }
            vec![input.to_path_buf()]
        };

        for (channel, source) in sources.iter().enumerate() {
            let ext = nifti_extension(&file_name(source)).unwrap_or(".nii.gz");
            let target = self.input_dir.join(format!("case_{:04}{}", channel, ext));
            fs::copy(source, &target).await.map_err(|e| {
                CaseError::new(
                    CaseErrorKind::InputInvalid,
                    format!("failed to stage {}: {}", source.display(), e),
                )
            })?;
            debug!("Staged {} as {}", source.display(), target.display());
        }

        Ok(sources.len())
    }

    /// First NIfTI file the predictor wrote into `out/`
    pub async fn find_prediction(&self) -> io::Result<Option<PathBuf>> {
        Ok(nifti_files(&self.output_dir).await?.into_iter().next())
    }

    /// Copies the prediction to `<results_dir>/<case_id><ext>`
    ///
    /// # Returns
    /// Path of the collected output
    pub async fn collect_output(
        &self,
        results_dir: &Path,
        case_id: &str,
    ) -> Result<PathBuf, CaseError> {
        let prediction = self
            .find_prediction()
            .await
            .map_err(|e| {
                CaseError::new(
                    CaseErrorKind::OutputMissing,
                    format!("cannot list {}: {}", self.output_dir.display(), e),
                )
            })?
            .ok_or_else(|| {
                CaseError::new(
                    CaseErrorKind::OutputMissing,
                    format!("no segmentation written to {}", self.output_dir.display()),
                )
            })?;

        let ext = nifti_extension(&file_name(&prediction)).unwrap_or(".nii.gz");
        let target = results_dir.join(format!("{}{}", sanitize_component(case_id), ext));

        fs::create_dir_all(results_dir).await.map_err(|e| {
            CaseError::new(
                CaseErrorKind::OutputMissing,
                format!("cannot create {}: {}", results_dir.display(), e),
            )
        })?;
        fs::copy(&prediction, &target).await.map_err(|e| {
            CaseError::new(
                CaseErrorKind::OutputMissing,
                format!("failed to collect {}: {}", prediction.display(), e),
            )
        })?;

        Ok(target)
    }

    /// Removes the workspace; failures are logged, never returned
    pub async fn cleanup(&self) {
        if let Err(e) = remove_dir_if_exists(&self.root).await {
            warn!("Failed to remove workspace {}: {}", self.root.display(), e);
        }
    }
}

async fn remove_dir_if_exists(path: &Path) -> io::Result<()> {
    match fs::remove_dir_all(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

/// NIfTI files directly inside `dir`, sorted by name
async fn nifti_files(dir: &Path) -> io::Result<Vec<PathBuf>> {
    let mut entries = fs::read_dir(dir).await?;
    let mut files = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if entry.file_type().await?.is_file() && nifti_extension(&file_name(&path)).is_some() {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default()
}

fn setup_error(what: &str, path: &Path, e: io::Error) -> CaseError {
    CaseError::new(
        CaseErrorKind::LaunchFailed,
        format!("{} {}: {}", what, path.display(), e),
    )
}
