/// Process supervision for commands executed on behalf of the daemon.
///
/// A [`ProcessRunner`] runs one shell command to completion:
/// - stdout and stderr are read concurrently and merged into one interleaved
///   stream of lines, each forwarded to an optional sink as soon as it is read
/// - a timeout or a cancellation request terminates the whole process group
///   with SIGTERM, waits up to the grace period, then sends SIGKILL
/// - the result is always a [`RunOutcome`]; launch failures are reported as
///   [`RunStatus::Error`], never as an `Err`
use crate::errors::{RunnerError, RunnerResult};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Grace period between SIGTERM and SIGKILL (5 seconds)
pub const DEFAULT_GRACE_PERIOD_SECS: u64 = 5;

/// How long to keep collecting output after the process has exited.
const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// `sh` exit codes for commands it could not run.
const SHELL_NOT_EXECUTABLE: i32 = 126;
const SHELL_NOT_FOUND: i32 = 127;

/// Prefix of the shell's own diagnostics, e.g. `sh: 1: foo: not found`.
const SHELL_DIAGNOSTIC_PREFIX: &str = "sh:";

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    /// Exit code 0.
    Success,
    /// Non-zero exit code, or killed by a signal we did not send.
    Failure,
    /// Exceeded the command timeout and was terminated.
    Timeout,
    /// Terminated through [`RunHandle::cancel`].
    Cancelled,
    /// Never ran, or the runner itself failed (launch error, lost output).
    Error,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Success => "success",
            RunStatus::Failure => "failure",
            RunStatus::Timeout => "timeout",
            RunStatus::Cancelled => "cancelled",
            RunStatus::Error => "error",
        }
    }
}

/// A shell command plus everything it runs with.
#[derive(Debug, Clone)]
pub struct CommandSpec {
    pub command: String,
    pub working_dir: Option<PathBuf>,
    /// Merged over the runner's own environment.
    pub env: HashMap<String, String>,
    /// `None` runs without a deadline.
    pub timeout: Option<Duration>,
}

impl CommandSpec {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            working_dir: None,
            env: HashMap::new(),
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }
}

/// Final result of one run.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub status: RunStatus,
    pub exit_code: Option<i32>,
    /// Every line read, newline-terminated, in arrival order.
    pub output: String,
    pub error: Option<String>,
    pub duration: Duration,
    /// OS process id, when the process was launched.
    pub pid: Option<u32>,
}

impl RunOutcome {
    fn launch_error(error: String, started: Instant) -> Self {
        Self {
            status: RunStatus::Error,
            exit_code: None,
            output: String::new(),
            error: Some(error),
            duration: started.elapsed(),
            pid: None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == RunStatus::Success
    }
}

/// Cancellation handle for one in-flight run.
///
/// Clones share the same underlying token. Cancelling a run that already
/// finished does nothing.
#[derive(Debug, Clone, Default)]
pub struct RunHandle {
    token: CancellationToken,
}

impl RunHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    async fn cancelled(&self) {
        self.token.cancelled().await
    }
}

/// One line read from the child, or the reason reading stopped early.
enum StreamEvent {
    Line(String),
    ReadFailed(String),
}

/// Runs shell commands with streaming output, timeout and cancellation.
#[derive(Debug, Clone)]
pub struct ProcessRunner {
    grace_period: Duration,
}

impl Default for ProcessRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessRunner {
    pub fn new() -> Self {
        Self {
            grace_period: Duration::from_secs(DEFAULT_GRACE_PERIOD_SECS),
        }
    }

    pub fn with_grace_period(grace_period: Duration) -> Self {
        Self { grace_period }
    }

    pub fn grace_period(&self) -> Duration {
        self.grace_period
    }

    /// Request termination of the run behind `handle`.
    pub fn cancel(&self, handle: &RunHandle) {
        handle.cancel();
    }

    /// Run `spec` to completion.
    ///
    /// Each output line (without its trailing newline) is sent to `sink` as it
    /// is read. A closed sink does not stop the run.
    pub async fn run(
        &self,
        spec: &CommandSpec,
        handle: &RunHandle,
        sink: Option<mpsc::UnboundedSender<String>>,
    ) -> RunOutcome {
        let started = Instant::now();

        if let Some(dir) = &spec.working_dir {
            if !dir.is_dir() {
                return RunOutcome::launch_error(
                    format!("Working directory does not exist: {}", dir.display()),
                    started,
                );
            }
        }

        if handle.is_cancelled() {
            return RunOutcome {
                status: RunStatus::Cancelled,
                ..RunOutcome::launch_error("Cancelled before start".to_string(), started)
            };
        }

        let mut child = match self.spawn(spec) {
            Ok(child) => child,
            Err(e) => return RunOutcome::launch_error(e.to_string(), started),
        };
        let pid = child.id();
        debug!(pid = ?pid, command = %spec.command, "Process started");

        let (event_tx, mut event_rx) = mpsc::unbounded_channel();
        if let Some(stdout) = child.stdout.take() {
            spawn_line_reader(stdout, event_tx.clone());
        }
        if let Some(stderr) = child.stderr.take() {
            spawn_line_reader(stderr, event_tx.clone());
        }
        drop(event_tx);

        let deadline = async {
            match spec.timeout {
                Some(timeout) => tokio::time::sleep(timeout).await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::pin!(deadline);

        let mut output = String::new();
        let mut read_error: Option<String> = None;
        let mut terminated_by: Option<RunStatus> = None;

        let wait_result = loop {
            tokio::select! {
                Some(event) = event_rx.recv() => {
                    record_event(event, &mut output, &mut read_error, sink.as_ref());
                }
                status = child.wait() => break status,
                _ = &mut deadline => {
                    debug!(pid = ?pid, "Process timed out, terminating");
                    terminated_by = Some(RunStatus::Timeout);
                    break self.terminate(&mut child, pid).await;
                }
                _ = handle.cancelled() => {
                    debug!(pid = ?pid, "Process cancelled, terminating");
                    terminated_by = Some(RunStatus::Cancelled);
                    break self.terminate(&mut child, pid).await;
                }
            }
        };

        // Readers finish once every holder of the pipes is gone.
        loop {
            match tokio::time::timeout(OUTPUT_DRAIN_TIMEOUT, event_rx.recv()).await {
                Ok(Some(event)) => {
                    record_event(event, &mut output, &mut read_error, sink.as_ref())
                }
                Ok(None) => break,
                Err(_) => {
                    warn!(pid = ?pid, "Output pipes still open after exit, stopped reading");
                    break;
                }
            }
        }

        let duration = started.elapsed();
        let exit_status = match wait_result {
            Ok(status) => status,
            Err(e) => {
                return RunOutcome {
                    status: RunStatus::Error,
                    exit_code: None,
                    output,
                    error: Some(format!("Failed to wait for process: {}", e)),
                    duration,
                    pid,
                }
            }
        };

        let exit_code = exit_status.code();
        let (status, error) = match terminated_by {
            Some(RunStatus::Timeout) => (
                RunStatus::Timeout,
                Some(format!(
                    "Timed out after {}s",
                    spec.timeout.map(|t| t.as_secs()).unwrap_or_default()
                )),
            ),
            Some(reason) => (reason, None),
            None => classify_exit(exit_status, &output),
        };

        let (status, error) = match read_error {
            Some(reason) if matches!(status, RunStatus::Success | RunStatus::Failure) => (
                RunStatus::Error,
                Some(format!("Output stream error: {}", reason)),
            ),
            Some(reason) => (status, error.or(Some(reason))),
            None => (status, error),
        };

        debug!(pid = ?pid, status = status.as_str(), exit_code = ?exit_code, "Process finished");

        RunOutcome {
            status,
            exit_code,
            output,
            error,
            duration,
            pid,
        }
    }

    fn spawn(&self, spec: &CommandSpec) -> RunnerResult<Child> {
        let mut command = Command::new("sh");
        command
            .arg("-c")
            .arg(&spec.command)
            .envs(&spec.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let Some(dir) = &spec.working_dir {
            command.current_dir(dir);
        }

        // Own process group so termination reaches grandchildren too.
        #[cfg(unix)]
        command.process_group(0);

        command
            .spawn()
            .map_err(|e| RunnerError::SpawnFailed(format!("{}: {}", spec.command, e)))
    }

    /// SIGTERM, wait up to the grace period, then SIGKILL.
    async fn terminate(
        &self,
        child: &mut Child,
        pid: Option<u32>,
    ) -> std::io::Result<ExitStatus> {
        if let Err(e) = send_terminate(child, pid) {
            warn!(error = %e, "Failed to send SIGTERM");
        }

        match tokio::time::timeout(self.grace_period, child.wait()).await {
            Ok(status) => {
                // Leftover group members, if any.
                if let Err(e) = send_kill(child, pid) {
                    debug!(error = %e, "Process group already gone");
                }
                status
            }
            Err(_) => {
                warn!(pid = ?pid, "Process ignored SIGTERM, sending SIGKILL");
                if let Err(e) = send_kill(child, pid) {
                    warn!(error = %e, "Failed to send SIGKILL");
                }
                child.wait().await
            }
        }
    }
}

fn spawn_line_reader<R>(reader: R, tx: mpsc::UnboundedSender<StreamEvent>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(reader);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) => break, // EOF
                Ok(_) => {
                    let line = String::from_utf8_lossy(&buf);
                    let line = line.trim_end_matches(['\n', '\r']).to_string();
                    if tx.send(StreamEvent::Line(line)).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    let _ = tx.send(StreamEvent::ReadFailed(e.to_string()));
                    break;
                }
            }
        }
    });
}

fn record_event(
    event: StreamEvent,
    output: &mut String,
    read_error: &mut Option<String>,
    sink: Option<&mpsc::UnboundedSender<String>>,
) {
    match event {
        StreamEvent::Line(line) => {
            output.push_str(&line);
            output.push('\n');
            if let Some(sink) = sink {
                let _ = sink.send(line);
            }
        }
        StreamEvent::ReadFailed(reason) => {
            warn!(error = %reason, "Lost process output");
            read_error.get_or_insert(reason);
        }
    }
}

/// Map an exit status onto a run status.
///
/// Exit codes 126 and 127 count as a launch error only when the last output
/// line is the shell's own diagnostic; a command that exits with them
/// itself is an ordinary failure.
fn classify_exit(status: ExitStatus, output: &str) -> (RunStatus, Option<String>) {
    let shell_gave_up = output
        .lines()
        .rev()
        .find(|line| !line.trim().is_empty())
        .map_or(false, |line| line.starts_with(SHELL_DIAGNOSTIC_PREFIX));
    match status.code() {
        Some(0) => (RunStatus::Success, None),
        Some(SHELL_NOT_EXECUTABLE) if shell_gave_up => (
            RunStatus::Error,
            Some("Command is not executable".to_string()),
        ),
        Some(SHELL_NOT_FOUND) if shell_gave_up => {
            (RunStatus::Error, Some("Command not found".to_string()))
        }
        Some(code) => (RunStatus::Failure, Some(format!("Exited with code {}", code))),
        None => (RunStatus::Failure, Some(describe_signal_exit(status))),
    }
}

#[cfg(unix)]
fn describe_signal_exit(status: ExitStatus) -> String {
    use std::os::unix::process::ExitStatusExt;
    match status.signal() {
        Some(signal) => format!("Terminated by signal {}", signal),
        None => "Terminated without exit code".to_string(),
    }
}

#[cfg(not(unix))]
fn describe_signal_exit(_status: ExitStatus) -> String {
    "Terminated without exit code".to_string()
}

#[cfg(unix)]
fn signal_group(pid: u32, signal: nix::sys::signal::Signal) -> RunnerResult<()> {
    use nix::errno::Errno;
    use nix::sys::signal::killpg;
    use nix::unistd::Pid;

    match killpg(Pid::from_raw(pid as i32), signal) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(e) => Err(RunnerError::SignalFailed {
            pid,
            reason: e.to_string(),
        }),
    }
}

#[cfg(unix)]
fn send_terminate(_child: &mut Child, pid: Option<u32>) -> RunnerResult<()> {
    match pid {
        Some(pid) => signal_group(pid, nix::sys::signal::Signal::SIGTERM),
        None => Ok(()),
    }
}

#[cfg(unix)]
fn send_kill(child: &mut Child, pid: Option<u32>) -> RunnerResult<()> {
    match pid {
        Some(pid) => signal_group(pid, nix::sys::signal::Signal::SIGKILL),
        None => child.start_kill().map_err(RunnerError::from),
    }
}

#[cfg(not(unix))]
fn send_terminate(child: &mut Child, _pid: Option<u32>) -> RunnerResult<()> {
    child.start_kill().map_err(RunnerError::from)
}

#[cfg(not(unix))]
fn send_kill(child: &mut Child, _pid: Option<u32>) -> RunnerResult<()> {
    child.start_kill().map_err(RunnerError::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_success_collects_output() {
        let runner = ProcessRunner::new();
        let spec = CommandSpec::new("echo hello; echo world").with_timeout(Duration::from_secs(10));

        let outcome = runner.run(&spec, &RunHandle::new(), None).await;

        assert_eq!(outcome.status, RunStatus::Success);
        assert_eq!(outcome.exit_code, Some(0));
        assert_eq!(outcome.output, "hello\nworld\n");
        assert!(outcome.error.is_none());
    }

    #[tokio::test]
    async fn test_env_and_working_dir_are_applied() {
        let dir = tempfile::tempdir().unwrap();
        let runner = ProcessRunner::new();
        let spec = CommandSpec::new("echo $GREETING; pwd")
            .with_env("GREETING", "hi")
            .with_working_dir(dir.path());

        let outcome = runner.run(&spec, &RunHandle::new(), None).await;

        assert_eq!(outcome.status, RunStatus::Success);
        let mut lines = outcome.output.lines();
        assert_eq!(lines.next(), Some("hi"));
        let reported = std::fs::canonicalize(lines.next().unwrap()).unwrap();
        assert_eq!(reported, std::fs::canonicalize(dir.path()).unwrap());
    }

    #[tokio::test]
    async fn test_stderr_is_merged() {
        let runner = ProcessRunner::new();
        let spec = CommandSpec::new("echo out; echo err 1>&2");

        let outcome = runner.run(&spec, &RunHandle::new(), None).await;

        assert!(outcome.output.contains("out\n"));
        assert!(outcome.output.contains("err\n"));
    }

    #[tokio::test]
    async fn test_missing_working_dir_is_error() {
        let runner = ProcessRunner::new();
        let spec = CommandSpec::new("true").with_working_dir("/definitely/not/here");

        let outcome = runner.run(&spec, &RunHandle::new(), None).await;

        assert_eq!(outcome.status, RunStatus::Error);
        assert!(outcome.pid.is_none());
        assert!(outcome.error.unwrap().contains("does not exist"));
    }

    #[tokio::test]
    async fn test_cancel_after_finish_is_noop() {
        let runner = ProcessRunner::new();
        let handle = RunHandle::new();
        let outcome = runner.run(&CommandSpec::new("true"), &handle, None).await;

        runner.cancel(&handle);
        runner.cancel(&handle);

        assert_eq!(outcome.status, RunStatus::Success);
        assert!(handle.is_cancelled());
    }
}
