//! Process supervision
//!
//! Launches one external invocation, streams its combined stdout/stderr as
//! lines, and enforces timeout and cancellation:
//! - The child runs in its own process group so helpers it forks are
//!   terminated with it
//! - Termination sends SIGTERM, waits a grace period, then SIGKILLs
//! - The child is always reaped and both output readers are joined before
//!   [`ProcessHandle::wait`] returns

use std::ffi::OsString;
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Longer lines are truncated
const MAX_LINE_BYTES: usize = 8 * 1024;

const LINE_CHANNEL_CAPACITY: usize = 256;

/// How long output readers may keep draining after the child is gone
const READER_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// How often a running child is checked for exit
#[cfg(any(target_os = "linux", target_os = "android"))]
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(20);

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("invalid command: {0}")]
    InvalidCommand(String),

    #[error("failed to launch '{program}': {source}")]
    LaunchFailed {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to wait for process: {0}")]
    Wait(#[from] std::io::Error),

    #[error("process supervisor stopped unexpectedly: {0}")]
    Supervisor(String),
}

/// What to run, where, and for how long
#[derive(Debug, Clone)]
pub struct CommandSpec {
    pub program: PathBuf,
    pub args: Vec<OsString>,
    pub working_dir: Option<PathBuf>,
    pub env: Vec<(OsString, OsString)>,
    /// `None` means unbounded
    pub timeout: Option<Duration>,
}

impl CommandSpec {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            working_dir: None,
            env: Vec::new(),
            timeout: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn current_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.working_dir = Some(dir.as_ref().to_path_buf());
        self
    }

    pub fn env(mut self, key: impl Into<OsString>, value: impl Into<OsString>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn validate(&self) -> Result<(), ProcessError> {
        if self.program.as_os_str().is_empty() {
            return Err(ProcessError::InvalidCommand(
                "program must not be empty".to_string(),
            ));
        }
        if self.timeout == Some(Duration::ZERO) {
            return Err(ProcessError::InvalidCommand(
                "timeout must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program.display())?;
        for arg in &self.args {
            write!(f, " {}", arg.to_string_lossy())?;
        }
        Ok(())
    }
}

/// How a supervised process ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitOutcome {
    Success,
    /// Nonzero exit code or killed by a signal it did not expect
    AbnormalExit {
        code: Option<i32>,
        signal: Option<i32>,
    },
    TimedOut,
    Cancelled,
}

impl ExitOutcome {
    fn from_status(status: ExitStatus) -> Self {
        if status.success() {
            return ExitOutcome::Success;
        }
        #[cfg(unix)]
        let signal = {
            use std::os::unix::process::ExitStatusExt;
            status.signal()
        };
        #[cfg(not(unix))]
        let signal = None;

        ExitOutcome::AbnormalExit {
            code: status.code(),
            signal,
        }
    }
}

impl fmt::Display for ExitOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitOutcome::Success => write!(f, "exited successfully"),
            ExitOutcome::AbnormalExit {
                code: Some(code), ..
            } => write!(f, "exited with code {}", code),
            ExitOutcome::AbnormalExit {
                signal: Some(signal),
                ..
            } => write!(f, "killed by signal {}", signal),
            ExitOutcome::AbnormalExit { .. } => write!(f, "exited abnormally"),
            ExitOutcome::TimedOut => write!(f, "timed out"),
            ExitOutcome::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Spawns supervised processes
#[derive(Debug, Clone)]
pub struct ProcessRunner {
    grace_period: Duration,
}

impl ProcessRunner {
    /// # Arguments
    /// * `grace_period` - Time between SIGTERM and SIGKILL on timeout or cancellation
    pub fn new(grace_period: Duration) -> Self {
        Self { grace_period }
    }

    pub fn grace_period(&self) -> Duration {
        self.grace_period
    }

    /// Launches `spec` and returns a live handle to its output and exit
    ///
    /// Cancelling `cancel` terminates the process through the same path as a
    /// timeout, but the outcome is reported as [`ExitOutcome::Cancelled`].
    pub fn spawn(
        &self,
        spec: &CommandSpec,
        cancel: CancellationToken,
    ) -> Result<ProcessHandle, ProcessError> {
        spec.validate()?;

        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &spec.working_dir {
            cmd.current_dir(dir);
        }
        for (key, value) in &spec.env {
            cmd.env(key, value);
        }
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd.spawn().map_err(|source| ProcessError::LaunchFailed {
            program: spec.program.display().to_string(),
            source,
        })?;
        let pid = child.id();
        debug!("Spawned process {:?}: {}", pid, spec);

        let (tx, rx) = mpsc::channel(LINE_CHANNEL_CAPACITY);
        let mut readers = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            readers.push(tokio::spawn(forward_lines(stdout, tx.clone())));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(tokio::spawn(forward_lines(stderr, tx.clone())));
        }
        drop(tx);

        let supervisor = tokio::spawn(supervise(
            child,
            readers,
            spec.timeout,
            self.grace_period,
            cancel,
        ));

        Ok(ProcessHandle {
            pid,
            lines: rx,
            supervisor,
        })
    }
}

/// Live handle to a supervised process
pub struct ProcessHandle {
    pid: Option<u32>,
    lines: mpsc::Receiver<String>,
    supervisor: JoinHandle<Result<ExitOutcome, ProcessError>>,
}

impl ProcessHandle {
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Next line of combined output; `None` once both streams are closed
    pub async fn next_line(&mut self) -> Option<String> {
        self.lines.recv().await
    }

    /// Waits for the process to end and be fully reaped
    ///
    /// Unread output is discarded.
    pub async fn wait(self) -> Result<ExitOutcome, ProcessError> {
        let ProcessHandle {
            lines, supervisor, ..
        } = self;
        drop(lines);
        supervisor
            .await
            .map_err(|e| ProcessError::Supervisor(e.to_string()))?
    }
}

enum Stop {
    Exited(std::io::Result<ExitStatus>),
    Deadline,
    Cancelled,
}

async fn supervise(
    mut child: Child,
    readers: Vec<JoinHandle<()>>,
    timeout: Option<Duration>,
    grace_period: Duration,
    cancel: CancellationToken,
) -> Result<ExitOutcome, ProcessError> {
    // Taken up front: tokio forgets the pid once the child is reaped.
    let group = child_group(child.id());
    let deadline = async {
        match timeout {
            Some(limit) => tokio::time::sleep(limit).await,
            None => std::future::pending::<()>().await,
        }
    };

    let stop = tokio::select! {
        biased;
        status = wait_and_sweep(&mut child, group) => Stop::Exited(status),
        _ = cancel.cancelled() => Stop::Cancelled,
        _ = deadline => Stop::Deadline,
    };

    let outcome = match stop {
        Stop::Exited(status) => {
            let status = match status {
                Ok(status) => status,
                Err(e) => {
                    terminate(&mut child, group, grace_period).await;
                    join_readers(readers).await;
                    return Err(ProcessError::Wait(e));
                }
            };
            ExitOutcome::from_status(status)
        }
        Stop::Deadline => {
            warn!("Process {:?} exceeded its timeout, terminating", group);
            terminate(&mut child, group, grace_period).await;
            ExitOutcome::TimedOut
        }
        Stop::Cancelled => {
            debug!("Process {:?} cancelled, terminating", group);
            terminate(&mut child, group, grace_period).await;
            ExitOutcome::Cancelled
        }
    };

    join_readers(readers).await;
    Ok(outcome)
}

/// SIGTERM, grace period, then SIGKILL; returns once the child is reaped
async fn terminate(child: &mut Child, group: Option<i32>, grace_period: Duration) {
    if group.is_some() {
        kill_group(group, false);
    } else if let Err(e) = child.start_kill() {
        debug!("start_kill failed: {}", e);
    }

    let reaped = tokio::time::timeout(grace_period, wait_and_sweep(child, group)).await;
    if reaped.is_err() {
        debug!("Grace period elapsed, killing process");
        // The leader is not reaped yet, so the group id still names our group.
        kill_group(group, true);
        if let Err(e) = child.kill().await {
            warn!("Failed to kill process: {}", e);
        }
    }
}

/// Waits for the child to exit, then kills what is left of its group before
/// reaping it
///
/// Helpers left behind in the group would keep the pipes open. An unreaped
/// leader keeps its pid, and with it the group id, from being recycled, so
/// the sweep can only reach our own group.
async fn wait_and_sweep(child: &mut Child, group: Option<i32>) -> std::io::Result<ExitStatus> {
    if exited_unreaped(group).await {
        kill_group(group, true);
    }
    child.wait().await
}

/// Resolves once the group leader has exited, without reaping it
///
/// # Returns
/// `false` when the exit could not be observed this way; the caller then
/// reaps without sweeping.
#[cfg(any(target_os = "linux", target_os = "android"))]
async fn exited_unreaped(group: Option<i32>) -> bool {
    use nix::errno::Errno;
    use nix::sys::wait::{Id, WaitPidFlag, WaitStatus, waitid};
    use nix::unistd::Pid;

    let Some(pid) = group else {
        return false;
    };
    let flags = WaitPidFlag::WEXITED | WaitPidFlag::WNOWAIT | WaitPidFlag::WNOHANG;
    loop {
        match waitid(Id::Pid(Pid::from_raw(pid)), flags) {
            Ok(WaitStatus::StillAlive) => tokio::time::sleep(EXIT_POLL_INTERVAL).await,
            Ok(_) => return true,
            Err(Errno::EINTR) => {}
            Err(e) => {
                debug!("waitid on {} failed: {}", pid, e);
                return false;
            }
        }
    }
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
async fn exited_unreaped(_group: Option<i32>) -> bool {
    false
}

/// The child leads its own process group, so its pid is the group id
fn child_group(pid: Option<u32>) -> Option<i32> {
    if cfg!(unix) {
        pid.and_then(|p| i32::try_from(p).ok())
    } else {
        None
    }
}

#[cfg(unix)]
fn kill_group(group: Option<i32>, force: bool) {
    use nix::sys::signal::{Signal, killpg};
    use nix::unistd::Pid;

    if let Some(pgid) = group {
        let signal = if force {
            Signal::SIGKILL
        } else {
            Signal::SIGTERM
        };
        // ESRCH just means the group is already gone.
        let _ = killpg(Pid::from_raw(pgid), signal);
    }
}

#[cfg(not(unix))]
fn kill_group(_group: Option<i32>, _force: bool) {}

async fn join_readers(readers: Vec<JoinHandle<()>>) {
    for mut reader in readers {
        if tokio::time::timeout(READER_DRAIN_TIMEOUT, &mut reader)
            .await
            .is_err()
        {
            debug!("Output reader did not finish, aborting");
            reader.abort();
            let _ = reader.await;
        }
    }
}

/// Reads a stream and forwards complete lines until EOF or until the receiver is gone
async fn forward_lines<R: AsyncRead + Unpin>(stream: R, tx: mpsc::Sender<String>) {
    let mut reader = BufReader::new(stream);
    let mut splitter = LineSplitter::default();

    loop {
        let (lines, used) = match reader.fill_buf().await {
            Ok([]) => break,
            Ok(chunk) => (splitter.feed(chunk), chunk.len()),
            Err(e) => {
                debug!("Output stream read failed: {}", e);
                break;
            }
        };
        reader.consume(used);

        for line in lines {
            if tx.send(line).await.is_err() {
                return;
            }
        }
    }

    if let Some(line) = splitter.finish() {
        let _ = tx.send(line).await;
    }
}

/// Splits a byte stream into lines on `\n`, `\r\n` and bare `\r`
///
/// Progress bars redraw with bare `\r`, so each redraw becomes a line.
/// Empty lines are skipped.
#[derive(Debug, Default)]
struct LineSplitter {
    current: Vec<u8>,
    truncated: bool,
}

impl LineSplitter {
    fn feed(&mut self, chunk: &[u8]) -> Vec<String> {
        let mut lines = Vec::new();
        for &byte in chunk {
            if byte == b'\n' || byte == b'\r' {
                if let Some(line) = self.take() {
                    lines.push(line);
                }
            } else if self.current.len() < MAX_LINE_BYTES {
                self.current.push(byte);
            } else {
                self.truncated = true;
            }
        }
        lines
    }

    fn finish(&mut self) -> Option<String> {
        self.take()
    }

    fn take(&mut self) -> Option<String> {
        let truncated = std::mem::take(&mut self.truncated);
        if self.current.is_empty() {
            return None;
        }
        let mut line = String::from_utf8_lossy(&self.current).into_owned();
        self.current.clear();
        if truncated {
            line.push_str(" [truncated]");
        }
        Some(line)
    }
}
