//! Result packaging
//!
//! Bundles the collected outputs of a job into one downloadable archive.

use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;
use zip::ZipWriter;
use zip::write::SimpleFileOptions;

#[derive(Debug, Error)]
pub enum PackagingError {
    #[error("nothing to package")]
    Empty,

    #[error("archive I/O failed: {0}")]
    Io(#[from] io::Error),

    #[error("archive write failed: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("packaging task failed: {0}")]
    Task(String),
}

/// Turns a set of output files into one artifact
#[async_trait]
pub trait Packager: Send + Sync {
    /// # Arguments
    /// * `job_id` - Job the outputs belong to
    /// * `outputs` - Files to include; never empty when called by the job manager
    ///
    /// # Returns
    /// Path of the finished artifact
    async fn package(&self, job_id: Uuid, outputs: &[PathBuf]) -> Result<PathBuf, PackagingError>;
}

/// Writes `<archive_root>/<job_id>.zip` with one deflated entry per output
#[derive(Debug, Clone)]
pub struct ZipPackager {
    archive_root: PathBuf,
}

impl ZipPackager {
    pub fn new(archive_root: impl Into<PathBuf>) -> Self {
        Self {
            archive_root: archive_root.into(),
        }
    }

    pub fn archive_path(&self, job_id: Uuid) -> PathBuf {
        self.archive_root.join(format!("{}.zip", job_id))
    }
}

#[async_trait]
impl Packager for ZipPackager {
    async fn package(&self, job_id: Uuid, outputs: &[PathBuf]) -> Result<PathBuf, PackagingError> {
        if outputs.is_empty() {
            return Err(PackagingError::Empty);
        }

        let target = self.archive_path(job_id);
        let root = self.archive_root.clone();
        let files = outputs.to_vec();
        let path = target.clone();

        tokio::task::spawn_blocking(move || {
            std::fs::create_dir_all(&root)?;
            write_archive(&path, &files)
        })
        .await
        .map_err(|e| PackagingError::Task(e.to_string()))??;

        info!(
            "Packaged {} output(s) of job {} into {}",
            outputs.len(),
            job_id,
            target.display()
        );
        Ok(target)
    }
}

/// Writes to a temporary name first so a partial archive is never served
fn write_archive(target: &Path, files: &[PathBuf]) -> Result<(), PackagingError> {
    let partial = target.with_extension("zip.part");
    let result = write_entries(&partial, files);
    if result.is_err() {
        let _ = std::fs::remove_file(&partial);
        return result;
    }
    std::fs::rename(&partial, target)?;
    Ok(())
}

fn write_entries(path: &Path, files: &[PathBuf]) -> Result<(), PackagingError> {
    let mut zip = ZipWriter::new(File::create(path)?);
    let options =
        SimpleFileOptions::default().compression_method(zip::CompressionMethod::Deflated);

    for file in files {
        let name = file
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .ok_or_else(|| {
                PackagingError::Io(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("output has no file name: {}", file.display()),
                ))
            })?;
        debug!("Adding {} to archive", name);
        zip.start_file(name, options)?;
        let mut source = File::open(file)?;
        io::copy(&mut source, &mut zip)?;
    }

    zip.finish()?;
    Ok(())
}
