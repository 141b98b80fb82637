//! Orchestrator configuration
//!
//! Defines every tunable of the orchestrator: where it listens, where it
//! keeps scratch space and results, which inference executable it runs, and
//! the timeout, retry and retention policies.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;

/// Name of the predictor looked up in conda environments and on `PATH`
pub const PREDICTOR_NAME: &str = "nnUNetv2_predict";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{var} has an invalid value '{value}': {reason}")]
    InvalidValue {
        var: &'static str,
        value: String,
        reason: String,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Orchestrator configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Address the HTTP API binds to
    pub bind_addr: String,

    /// Root of scratch space, collected results and archives
    pub work_dir: PathBuf,

    /// Resolved inference executable; `None` when nothing was found
    pub inference_exe: Option<PathBuf>,

    /// Default per-invocation timeout; `None` means unbounded
    pub case_timeout: Option<Duration>,

    /// Time between SIGTERM and SIGKILL when stopping an invocation
    pub kill_grace: Duration,

    /// Extra attempts for launch failures and timeouts
    pub max_retries: u32,

    /// Progress events retained per job
    pub log_capacity: usize,

    /// How long finished jobs stay queryable before eviction
    pub job_retention: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8000".to_string(),
            work_dir: std::env::temp_dir().join("segrun"),
            inference_exe: None,
            case_timeout: Some(Duration::from_secs(3600)),
            kill_grace: Duration::from_secs(10),
            max_retries: 1,
            log_capacity: 2000,
            job_retention: Duration::from_secs(3600),
        }
    }
}

impl Config {
    /// Creates configuration from environment variables
    ///
    /// Expected environment variables (all optional):
    /// - SEGRUN_BIND_ADDR (default: 0.0.0.0:8000)
    /// - SEGRUN_WORK_DIR (default: <tmp>/segrun)
    /// - SEGRUN_INFERENCE_EXE (default: probed, see [`resolve_executable`])
    /// - SEGRUN_CASE_TIMEOUT (seconds, 0 = unbounded, default: 3600)
    /// - SEGRUN_KILL_GRACE (seconds, default: 10)
    /// - SEGRUN_MAX_RETRIES (default: 1)
    /// - SEGRUN_LOG_CAPACITY (default: 2000)
    /// - SEGRUN_JOB_RETENTION (seconds, default: 3600)
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let bind_addr = env_var("SEGRUN_BIND_ADDR").unwrap_or(defaults.bind_addr);
        let work_dir = env_var("SEGRUN_WORK_DIR")
            .map(PathBuf::from)
            .unwrap_or(defaults.work_dir);

        let conda_prefix = env_var("NNUNET_CONDA_PREFIX")
            .or_else(|| env_var("CONDA_PREFIX"))
            .map(PathBuf::from);
        let inference_exe = resolve_executable(
            env_var("SEGRUN_INFERENCE_EXE").map(PathBuf::from),
            conda_prefix.as_deref(),
        );

        let case_timeout = match parse_var::<u64>("SEGRUN_CASE_TIMEOUT")? {
            Some(0) => None,
            Some(secs) => Some(Duration::from_secs(secs)),
            None => defaults.case_timeout,
        };
        let kill_grace = parse_var::<u64>("SEGRUN_KILL_GRACE")?
            .map(Duration::from_secs)
            .unwrap_or(defaults.kill_grace);
        let max_retries = parse_var("SEGRUN_MAX_RETRIES")?.unwrap_or(defaults.max_retries);
        let log_capacity = parse_var("SEGRUN_LOG_CAPACITY")?.unwrap_or(defaults.log_capacity);
        let job_retention = parse_var::<u64>("SEGRUN_JOB_RETENTION")?
            .map(Duration::from_secs)
            .unwrap_or(defaults.job_retention);

        Ok(Self {
            bind_addr,
            work_dir,
            inference_exe,
            case_timeout,
            kill_grace,
            max_retries,
            log_capacity,
            job_retention,
        })
    }

    /// Validates the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.bind_addr
            .parse::<SocketAddr>()
            .map_err(|e| ConfigError::InvalidValue {
                var: "SEGRUN_BIND_ADDR",
                value: self.bind_addr.clone(),
                reason: e.to_string(),
            })?;

        if self.work_dir.as_os_str().is_empty() {
            return Err(ConfigError::Invalid("work_dir cannot be empty".to_string()));
        }

        if self.kill_grace.is_zero() {
            return Err(ConfigError::Invalid(
                "kill_grace must be positive".to_string(),
            ));
        }

        if self.log_capacity == 0 {
            return Err(ConfigError::Invalid(
                "log_capacity must be positive".to_string(),
            ));
        }

        Ok(())
    }

    /// Per-case scratch directories
    pub fn scratch_dir(&self) -> PathBuf {
        self.work_dir.join("scratch")
    }

    /// Collected case outputs, one subdirectory per job
    pub fn results_dir(&self) -> PathBuf {
        self.work_dir.join("results")
    }

    /// Packaged job archives
    pub fn archive_dir(&self) -> PathBuf {
        self.work_dir.join("archives")
    }
}

/// Finds the inference executable
///
/// Order: an explicit path, then `bin/nnUNetv2_predict` or
/// `Scripts/nnUNetv2_predict.exe` under the conda prefix, then `PATH`.
/// An explicit path is returned as given even if it does not exist, so that
/// a misconfiguration shows up as a launch failure rather than silently
/// picking another executable.
pub fn resolve_executable(explicit: Option<PathBuf>, conda_prefix: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit {
        return Some(path);
    }

    if let Some(prefix) = conda_prefix {
        let candidates = [
            prefix.join("bin").join(PREDICTOR_NAME),
            prefix.join("Scripts").join(format!("{}.exe", PREDICTOR_NAME)),
        ];
        if let Some(found) = candidates.into_iter().find(|c| c.is_file()) {
            return Some(found);
        }
    }

    which::which(PREDICTOR_NAME).ok()
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parse_var<T>(name: &'static str) -> Result<Option<T>, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match env_var(name) {
        None => Ok(None),
        Some(value) => value
            .parse::<T>()
            .map(Some)
            .map_err(|e| ConfigError::InvalidValue {
                var: name,
                value,
                reason: e.to_string(),
            }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.max_retries, 1);
        assert_eq!(config.case_timeout, Some(Duration::from_secs(3600)));
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let config = Config {
            bind_addr: "not an address".to_string(),
            ..Config::default()
        };
        assert!(config.validate().is_err());

        let config = Config {
            log_capacity: 0,
            ..Config::default()
        };
        assert!(config.validate().is_err());

        let config = Config {
            kill_grace: Duration::ZERO,
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_storage_layout() {
        let config = Config {
            work_dir: PathBuf::from("/srv/segrun"),
            ..Config::default()
        };
        assert_eq!(config.scratch_dir(), PathBuf::from("/srv/segrun/scratch"));
        assert_eq!(config.results_dir(), PathBuf::from("/srv/segrun/results"));
        assert_eq!(config.archive_dir(), PathBuf::from("/srv/segrun/archives"));
    }

    #[test]
    fn test_explicit_executable_wins() {
        let dir = tempfile::tempdir().unwrap();
        let explicit = PathBuf::from("/opt/custom/predict");
        assert_eq!(
            resolve_executable(Some(explicit.clone()), Some(dir.path())),
            Some(explicit)
        );
    }

    #[test]
    fn test_conda_prefix_is_probed() {
        let dir = tempfile::tempdir().unwrap();
        let bin = dir.path().join("bin");
        std::fs::create_dir(&bin).unwrap();
        let exe = bin.join(PREDICTOR_NAME);
        std::fs::write(&exe, b"#!/bin/sh\n").unwrap();

        assert_eq!(resolve_executable(None, Some(dir.path())), Some(exe));
    }

    #[test]
    fn test_windows_layout_under_conda_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let scripts = dir.path().join("Scripts");
        std::fs::create_dir(&scripts).unwrap();
        let exe = scripts.join("nnUNetv2_predict.exe");
        std::fs::write(&exe, b"").unwrap();

        assert_eq!(resolve_executable(None, Some(dir.path())), Some(exe));
    }
}
