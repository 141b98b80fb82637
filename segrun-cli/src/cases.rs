//! Case collection
//!
//! Turns a directory of NIfTI images into case descriptors. Files named
//! `<id>_<NNNN>.nii[.gz]` are grouped by `<id>`, one file per channel; files
//! without a channel suffix are cases of their own. Each subdirectory holding
//! NIfTI files is one case.
//!
//! The orchestrator reads inputs by path, so multi-channel cases are linked
//! into a per-case directory under the staging root before submission.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use segrun_core::domain::case::{CaseDescriptor, nifti_extension, split_channel};

/// Where the images of one case come from
#[derive(Debug, Clone, PartialEq)]
pub enum CaseSource {
    File(PathBuf),
    /// Channel files of a flat directory, in channel order
    Channels(Vec<PathBuf>),
    Directory(PathBuf),
}

#[derive(Debug, Clone, PartialEq)]
pub struct CollectedCase {
    pub case_id: String,
    pub source: CaseSource,
}

impl CollectedCase {
    /// Builds the descriptor, staging channel groups under `stage_root`
    pub fn into_descriptor(self, stage_root: &Path) -> Result<CaseDescriptor> {
        let input = match self.source {
            CaseSource::File(path) | CaseSource::Directory(path) => path,
            CaseSource::Channels(files) => stage_channels(&files, &stage_root.join(&self.case_id))?,
        };
        Ok(CaseDescriptor::new(input).with_id(self.case_id))
    }
}

/// Collects the cases of `dir`, sorted by case id
pub fn collect_cases(dir: &Path) -> Result<Vec<CollectedCase>> {
    let dir = fs::canonicalize(dir)
        .with_context(|| format!("Cannot access input directory {}", dir.display()))?;

    let mut groups: BTreeMap<String, Vec<(u32, PathBuf)>> = BTreeMap::new();
    let mut cases = Vec::new();

    for entry in fs::read_dir(&dir).with_context(|| format!("Cannot list {}", dir.display()))? {
        let path = entry?.path();
        let name = file_name(&path);

        if path.is_dir() {
            if !name.starts_with('.') && has_nifti(&path)? {
                cases.push(CollectedCase {
                    case_id: name,
                    source: CaseSource::Directory(path),
                });
            }
            continue;
        }

        let Some(ext) = nifti_extension(&name) else {
            continue;
        };
        let base = &name[..name.len() - ext.len()];
        let (case_id, channel) = match split_channel(base) {
            Some((id, channel)) => (id.to_string(), channel),
            None => (base.to_string(), 0),
        };
        groups.entry(case_id).or_default().push((channel, path));
    }

    for (case_id, mut files) in groups {
        files.sort();
        let source = if files.len() == 1 {
            CaseSource::File(files.remove(0).1)
        } else {
            CaseSource::Channels(files.into_iter().map(|(_, path)| path).collect())
        };
        cases.push(CollectedCase { case_id, source });
    }

    cases.sort_by(|a, b| a.case_id.cmp(&b.case_id));
    Ok(cases)
}

/// Links (or copies, across filesystems) channel files into `target`
fn stage_channels(files: &[PathBuf], target: &Path) -> Result<PathBuf> {
    if target.exists() {
        fs::remove_dir_all(target)
            .with_context(|| format!("Cannot clear staging directory {}", target.display()))?;
    }
    fs::create_dir_all(target)
        .with_context(|| format!("Cannot create staging directory {}", target.display()))?;

    for file in files {
        let dest = target.join(file_name(file));
        if fs::hard_link(file, &dest).is_err() {
            fs::copy(file, &dest)
                .with_context(|| format!("Cannot stage {}", file.display()))?;
        }
    }
    Ok(target.to_path_buf())
}

fn has_nifti(dir: &Path) -> Result<bool> {
    for entry in fs::read_dir(dir).with_context(|| format!("Cannot list {}", dir.display()))? {
        let path = entry?.path();
        if path.is_file() && nifti_extension(&file_name(&path)).is_some() {
            return Ok(true);
        }
    }
    Ok(false)
}

/// Fails with a readable message when a directory yields no case
pub fn ensure_cases(cases: &[CollectedCase], dir: &Path) -> Result<()> {
    if cases.is_empty() {
        bail!("No .nii/.nii.gz images found in {}", dir.display());
    }
    Ok(())
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default()
}
