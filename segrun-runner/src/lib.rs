//! Segrun Runner
//!
//! Everything needed to drive one case through the external inference tool:
//! - Process supervision: spawn, stream combined output, timeout and cancellation
//! - Progress parsing: raw output lines to structured progress events
//! - Case staging: per-case input/output directories with normalized file names
//! - Case execution: retry policy and per-case results
//!
//! Nothing in this crate knows about jobs as a whole; the orchestrator
//! sequences cases and owns job state.

pub mod command;
pub mod executor;
pub mod process;
pub mod progress;
pub mod workspace;

pub use command::{CommandBuilder, NnUnetCommandBuilder};
pub use executor::{CaseExecutor, CaseRun, ExecutorConfig, ProgressSink, RetryPolicy};
pub use process::{CommandSpec, ExitOutcome, ProcessError, ProcessHandle, ProcessRunner};
pub use progress::{ParseContext, ParsedLine, parse_line};
pub use workspace::{CaseWorkspace, job_dir, sanitize_component};
