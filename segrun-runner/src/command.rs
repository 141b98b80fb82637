//! Inference command construction
//!
//! A [`CommandBuilder`] turns job parameters plus one staged case into the
//! command line of a single inference invocation. The production builder
//! targets `nnUNetv2_predict`; tests plug in their own.

use std::path::PathBuf;

use segrun_core::domain::case::CaseDescriptor;
use segrun_core::domain::job::InferenceParams;

use crate::process::CommandSpec;
use crate::workspace::CaseWorkspace;

/// Builds the command for one case invocation
pub trait CommandBuilder: Send + Sync {
    /// # Arguments
    /// * `params` - Job-wide inference parameters
    /// * `case` - The case, including its per-case overrides
    /// * `workspace` - Staged input and empty output directories
    ///
    /// # Returns
    /// The command to run, or a reason it cannot be built
    fn build(
        &self,
        params: &InferenceParams,
        case: &CaseDescriptor,
        workspace: &CaseWorkspace,
    ) -> Result<CommandSpec, String>;
}

/// Builds `nnUNetv2_predict -i <in> -o <out> -d <dataset> -c <config> -f <folds...>`
#[derive(Debug, Clone)]
pub struct NnUnetCommandBuilder {
    executable: Option<PathBuf>,
}

impl NnUnetCommandBuilder {
    /// # Arguments
    /// * `executable` - Resolved predictor path; `None` when it could not be found,
    ///   in which case every build fails and the case is reported as a launch failure
    pub fn new(executable: Option<PathBuf>) -> Self {
        Self { executable }
    }

    pub fn executable(&self) -> Option<&PathBuf> {
        self.executable.as_ref()
    }
}

impl CommandBuilder for NnUnetCommandBuilder {
    fn build(
        &self,
        params: &InferenceParams,
        case: &CaseDescriptor,
        workspace: &CaseWorkspace,
    ) -> Result<CommandSpec, String> {
        let executable = self
            .executable
            .as_ref()
            .ok_or_else(|| "inference executable not found".to_string())?;

        let configuration = case
            .overrides
            .configuration
            .as_deref()
            .unwrap_or(&params.configuration);
        let folds = case.overrides.folds.as_deref().unwrap_or(&params.folds);

        let folds: Vec<&str> = folds
            .split(|c: char| c == ',' || c.is_whitespace())
            .filter(|f| !f.is_empty())
            .collect();
        if folds.is_empty() {
            return Err("no folds given".to_string());
        }

        let spec = CommandSpec::new(executable)
            .arg("-i")
            .arg(workspace.input_dir())
            .arg("-o")
            .arg(workspace.output_dir())
            .arg("-d")
            .arg(&params.dataset)
            .arg("-c")
            .arg(configuration)
            .arg("-f")
            .args(folds)
            .current_dir(workspace.root());

        Ok(spec)
    }
}
