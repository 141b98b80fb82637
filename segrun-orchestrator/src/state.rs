//! Shared application state

use std::sync::Arc;

use segrun_runner::{CaseExecutor, ExecutorConfig, NnUnetCommandBuilder, RetryPolicy};

use crate::config::Config;
use crate::repository::job_repository::JobRegistry;
use crate::service::job_manager::{CaseRunner, JobManager};
use crate::service::packaging::{Packager, ZipPackager};

/// State handed to every request handler
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub registry: Arc<JobRegistry>,
    pub manager: Arc<JobManager>,
}

impl AppState {
    pub fn new(config: Config, runner: Arc<dyn CaseRunner>, packager: Arc<dyn Packager>) -> Self {
        let registry = Arc::new(JobRegistry::new());
        let manager = Arc::new(JobManager::new(registry.clone(), runner, packager));
        Self {
            config: Arc::new(config),
            registry,
            manager,
        }
    }

    /// Wires the nnU-Net command builder, case executor and zip packager
    pub fn from_config(config: Config) -> Self {
        let builder = Arc::new(NnUnetCommandBuilder::new(config.inference_exe.clone()));

        let mut executor_config = ExecutorConfig::new(config.scratch_dir(), config.results_dir());
        executor_config.timeout = config.case_timeout;
        executor_config.grace_period = config.kill_grace;
        executor_config.retry = RetryPolicy {
            max_retries: config.max_retries,
        };

        let executor = Arc::new(CaseExecutor::new(executor_config, builder));
        let packager = Arc::new(ZipPackager::new(config.archive_dir()));
        Self::new(config, executor, packager)
    }
}
