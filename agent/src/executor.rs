/// Suite and task execution on the agent host.
///
/// A suite run is: optional git checkout, the suite's command under the
/// process runner with output streamed as `test_suite_log`, per-case results
/// read back from a JSON-lines file the command writes, then one
/// `test_suite_completed`.
use crate::errors::{AgentError, AgentResult};
use crate::outbox::Outbox;
use crate::workspace::WorkDir;
use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Deserialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use testmesh_core::{
    AgentMessage, CancelAck, CaseOutcome, CommandSpec, ProcessRunner, RunHandle, RunOutcome,
    RunStatus, SuiteCaseResult, SuiteCompletion, SuiteExecutionRequest, SuiteLogChunk,
    SuiteRunStatus, TaskRequest, TaskResultPayload,
};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

pub const ENV_SUITE_ID: &str = "TESTMESH_SUITE_ID";
pub const ENV_EXECUTION_ID: &str = "TESTMESH_EXECUTION_ID";
pub const ENV_PLAN_ID: &str = "TESTMESH_PLAN_ID";
pub const ENV_CASE_IDS: &str = "TESTMESH_CASE_IDS";
pub const ENV_CASE_CODES: &str = "TESTMESH_CASE_CODES";
pub const ENV_EXECUTOR_ID: &str = "TESTMESH_EXECUTOR_ID";
pub const ENV_RESULTS_FILE: &str = "TESTMESH_RESULTS_FILE";

/// Each git step gets this long.
const GIT_STEP_TIMEOUT: Duration = Duration::from_secs(600);

/// One line of the results file.
#[derive(Debug, Deserialize)]
struct ResultLine {
    #[serde(default)]
    case_id: Option<String>,
    #[serde(default)]
    case_code: Option<String>,
    result: String,
    #[serde(default)]
    duration: Option<f64>,
    #[serde(default)]
    log_output: Option<String>,
    #[serde(default)]
    error_message: Option<String>,
}

/// Removes a run from the in-flight table when dropped.
struct InFlight<'a> {
    running: &'a DashMap<String, RunHandle>,
    id: String,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.running.remove(&self.id);
    }
}

pub struct Executor {
    runner: ProcessRunner,
    outbox: Outbox,
    work_dir: WorkDir,
    default_timeout: Duration,
    /// Execution ids and task ids currently running.
    running: DashMap<String, RunHandle>,
}

impl Executor {
    pub fn new(outbox: Outbox, work_dir: WorkDir, default_timeout: Duration) -> Self {
        Self {
            runner: ProcessRunner::new(),
            outbox,
            work_dir,
            default_timeout,
            running: DashMap::new(),
        }
    }

    pub fn with_runner(mut self, runner: ProcessRunner) -> Self {
        self.runner = runner;
        self
    }

    pub fn is_running(&self, id: &str) -> bool {
        self.running.contains_key(id)
    }

    pub fn running_count(&self) -> usize {
        self.running.len()
    }

    pub fn running_ids(&self) -> Vec<String> {
        self.running.iter().map(|entry| entry.key().clone()).collect()
    }

    pub fn spawn_suite(self: &Arc<Self>, request: SuiteExecutionRequest) {
        let executor = Arc::clone(self);
        tokio::spawn(async move {
            executor.execute_suite(request).await;
        });
    }

    pub fn spawn_task(self: &Arc<Self>, request: TaskRequest) {
        let executor = Arc::clone(self);
        tokio::spawn(async move {
            executor.execute_task(request).await;
        });
    }

    fn begin(&self, id: &str) -> Option<(RunHandle, InFlight<'_>)> {
        match self.running.entry(id.to_string()) {
            Entry::Occupied(_) => None,
            Entry::Vacant(slot) => {
                let handle = RunHandle::new();
                slot.insert(handle.clone());
                Some((
                    handle,
                    InFlight {
                        running: &self.running,
                        id: id.to_string(),
                    },
                ))
            }
        }
    }

    /// Run a suite execution end to end and report it.
    ///
    /// Returns the completion that was sent, or `None` when the execution id
    /// is already running here.
    pub async fn execute_suite(&self, request: SuiteExecutionRequest) -> Option<SuiteCompletion> {
        let Some((handle, _in_flight)) = self.begin(&request.execution_id) else {
            warn!(
                suite_id = %request.suite_id,
                execution_id = %request.execution_id,
                "Execution already running, ignoring duplicate request"
            );
            return None;
        };
        let started = Instant::now();
        info!(
            suite_id = %request.suite_id,
            execution_id = %request.execution_id,
            cases = request.case_ids.len(),
            "Starting suite execution"
        );

        let (log_tx, log_rx) = mpsc::unbounded_channel();
        let forwarder = tokio::spawn(forward_logs(
            self.outbox.clone(),
            request.suite_id.clone(),
            request.execution_id.clone(),
            log_rx,
        ));

        let root = self.work_dir.path();
        let results_file = results_path(&root, &request.execution_id);
        let outcome = self
            .run_suite_command(&request, &root, &results_file, &handle, log_tx)
            .await;
        // All log lines go out before any verdict.
        let _ = forwarder.await;

        let cancelled = outcome.status == RunStatus::Cancelled || handle.is_cancelled();
        let results = if cancelled {
            Vec::new()
        } else {
            collect_results(&request, &results_file, &outcome).await
        };
        if let Err(e) = tokio::fs::remove_file(&results_file).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                debug!(path = %results_file.display(), "Could not remove results file: {}", e);
            }
        }

        let status = if cancelled {
            SuiteRunStatus::Cancelled
        } else {
            suite_status(outcome.status)
        };
        let mut completion = SuiteCompletion {
            suite_id: request.suite_id.clone(),
            execution_id: request.execution_id.clone(),
            status,
            total: results.len() as u32,
            passed: 0,
            failed: 0,
            errors: 0,
            skipped: 0,
            duration: started.elapsed().as_secs_f64(),
        };
        for result in results {
            match result.result {
                CaseOutcome::Passed => completion.passed += 1,
                CaseOutcome::Failed => completion.failed += 1,
                CaseOutcome::Error => completion.errors += 1,
                CaseOutcome::Skipped => completion.skipped += 1,
            }
            self.outbox.send(AgentMessage::TestSuiteResult(result));
        }

        info!(
            suite_id = %completion.suite_id,
            execution_id = %completion.execution_id,
            status = ?completion.status,
            passed = completion.passed,
            failed = completion.failed,
            errors = completion.errors,
            "Suite execution finished"
        );
        self.outbox
            .send(AgentMessage::TestSuiteCompleted(completion.clone()));
        Some(completion)
    }

    async fn run_suite_command(
        &self,
        request: &SuiteExecutionRequest,
        root: &Path,
        results_file: &Path,
        handle: &RunHandle,
        log_tx: mpsc::UnboundedSender<String>,
    ) -> RunOutcome {
        let started = Instant::now();
        let dir = match self.checkout(request, root, handle, &log_tx).await {
            Ok(dir) => dir,
            Err(e) => {
                warn!(
                    suite_id = %request.suite_id,
                    execution_id = %request.execution_id,
                    "Suite preparation failed: {}", e
                );
                let _ = log_tx.send(format!("[testmesh] {}", e));
                let status = if handle.is_cancelled() {
                    RunStatus::Cancelled
                } else {
                    RunStatus::Error
                };
                return failed_outcome(status, e.to_string(), started);
            }
        };

        if let Some(parent) = results_file.parent() {
            if let Err(e) = tokio::fs::create_dir_all(parent).await {
                return failed_outcome(
                    RunStatus::Error,
                    format!("cannot create {}: {}", parent.display(), e),
                    started,
                );
            }
        }
        let _ = tokio::fs::remove_file(results_file).await;

        let timeout = request
            .timeout
            .map(Duration::from_secs)
            .unwrap_or(self.default_timeout);
        let mut spec = CommandSpec::new(request.execution_command.as_str())
            .with_working_dir(dir)
            .with_timeout(timeout)
            .with_env(ENV_SUITE_ID, request.suite_id.as_str())
            .with_env(ENV_EXECUTION_ID, request.execution_id.as_str())
            .with_env(ENV_CASE_IDS, request.case_ids.join(","))
            .with_env(ENV_CASE_CODES, request.case_codes.join(","))
            .with_env(ENV_RESULTS_FILE, results_file.display().to_string());
        if let Some(plan_id) = &request.plan_id {
            spec = spec.with_env(ENV_PLAN_ID, plan_id.as_str());
        }
        if let Some(executor_id) = &request.executor_id {
            spec = spec.with_env(ENV_EXECUTOR_ID, executor_id.as_str());
        }

        self.runner.run(&spec, handle, Some(log_tx)).await
    }

    /// Directory the suite command runs in, cloning or updating the
    /// repository first when the suite is git-backed.
    async fn checkout(
        &self,
        request: &SuiteExecutionRequest,
        root: &Path,
        handle: &RunHandle,
        log_tx: &mpsc::UnboundedSender<String>,
    ) -> AgentResult<PathBuf> {
        tokio::fs::create_dir_all(root).await?;
        let repo_url = match request.git_repo_url.as_deref() {
            Some(url) if request.git_enabled && !url.is_empty() => url,
            _ => return Ok(root.to_path_buf()),
        };

        let target = root.join("suites").join(path_safe(&request.suite_id));
        let steps = git_steps(repo_url, request.git_branch.as_deref(), &target);
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        for (command, cwd) in steps {
            info!(suite_id = %request.suite_id, command = %command, "Preparing sources");
            let spec = CommandSpec::new(command.as_str())
                .with_working_dir(cwd)
                .with_timeout(GIT_STEP_TIMEOUT);
            let outcome = self.runner.run(&spec, handle, Some(log_tx.clone())).await;
            if !outcome.is_success() {
                let detail = outcome
                    .error
                    .or_else(|| outcome.exit_code.map(|code| format!("exit code {}", code)))
                    .unwrap_or_else(|| outcome.status.as_str().to_string());
                return Err(AgentError::GitError(format!("`{}` failed: {}", command, detail)));
            }
        }
        Ok(target)
    }

    /// Run an ad-hoc command and report `task_result`.
    pub async fn execute_task(&self, request: TaskRequest) -> Option<TaskResultPayload> {
        let Some((handle, _in_flight)) = self.begin(&request.task_id) else {
            warn!(task_id = %request.task_id, "Task already running, ignoring duplicate request");
            return None;
        };

        let root = self.work_dir.path();
        if let Err(e) = tokio::fs::create_dir_all(&root).await {
            debug!(path = %root.display(), "Could not create work dir: {}", e);
        }
        let working_dir = match request.working_dir.as_deref() {
            Some(dir) if !dir.is_empty() => {
                let dir = Path::new(dir);
                if dir.is_absolute() {
                    dir.to_path_buf()
                } else {
                    root.join(dir)
                }
            }
            _ => root,
        };
        let timeout = request
            .timeout
            .map(Duration::from_secs)
            .unwrap_or(self.default_timeout);

        let mut spec = CommandSpec::new(request.command.as_str())
            .with_working_dir(working_dir)
            .with_timeout(timeout);
        for (key, value) in &request.env {
            spec = spec.with_env(key.as_str(), value.as_str());
        }

        debug!(task_id = %request.task_id, "Running task");
        let outcome = self.runner.run(&spec, &handle, None).await;
        let payload = TaskResultPayload {
            task_id: request.task_id,
            status: outcome.status,
            exit_code: outcome.exit_code,
            output: outcome.output,
            error: outcome.error,
            duration_ms: outcome.duration.as_millis() as u64,
        };
        info!(task_id = %payload.task_id, status = payload.status.as_str(), "Task finished");
        self.outbox.send(AgentMessage::TaskResult(payload.clone()));
        Some(payload)
    }

    pub fn cancel_suite(&self, execution_id: &str) -> CancelAck {
        self.cancel(execution_id)
    }

    pub fn cancel_task(&self, task_id: &str) -> CancelAck {
        self.cancel(task_id)
    }

    /// The final status follows in the run's own report.
    fn cancel(&self, id: &str) -> CancelAck {
        match self.running.get(id) {
            Some(handle) => {
                self.runner.cancel(handle.value());
                info!(target_id = %id, "Cancellation requested");
                CancelAck {
                    target_id: id.to_string(),
                    running: true,
                    message: "cancellation requested".to_string(),
                }
            }
            None => {
                debug!(target_id = %id, "Cancel for something not running");
                CancelAck {
                    target_id: id.to_string(),
                    running: false,
                    message: "not running on this agent".to_string(),
                }
            }
        }
    }
}

async fn forward_logs(
    outbox: Outbox,
    suite_id: String,
    execution_id: String,
    mut lines: mpsc::UnboundedReceiver<String>,
) {
    while let Some(line) = lines.recv().await {
        outbox.send(AgentMessage::TestSuiteLog(SuiteLogChunk {
            suite_id: suite_id.clone(),
            execution_id: execution_id.clone(),
            message: line,
            timestamp: Utc::now(),
        }));
    }
}

fn failed_outcome(status: RunStatus, error: String, started: Instant) -> RunOutcome {
    RunOutcome {
        status,
        exit_code: None,
        output: String::new(),
        error: Some(error),
        duration: started.elapsed(),
        pid: None,
    }
}

fn suite_status(status: RunStatus) -> SuiteRunStatus {
    match status {
        RunStatus::Success => SuiteRunStatus::Completed,
        RunStatus::Failure => SuiteRunStatus::Failed,
        RunStatus::Timeout => SuiteRunStatus::Timeout,
        RunStatus::Cancelled => SuiteRunStatus::Cancelled,
        RunStatus::Error => SuiteRunStatus::Error,
    }
}

/// Verdict for cases the results file does not mention.
fn inherited_outcome(outcome: &RunOutcome) -> (CaseOutcome, Option<String>) {
    match outcome.status {
        RunStatus::Success => (CaseOutcome::Passed, None),
        RunStatus::Failure => (
            CaseOutcome::Failed,
            Some(
                outcome
                    .error
                    .clone()
                    .or_else(|| outcome.exit_code.map(|code| format!("exit code {}", code)))
                    .unwrap_or_else(|| "execution failed".to_string()),
            ),
        ),
        RunStatus::Timeout | RunStatus::Error | RunStatus::Cancelled => (
            CaseOutcome::Error,
            Some(
                outcome
                    .error
                    .clone()
                    .unwrap_or_else(|| outcome.status.as_str().to_string()),
            ),
        ),
    }
}

fn results_path(root: &Path, execution_id: &str) -> PathBuf {
    root.join(".testmesh")
        .join(format!("results-{}.jsonl", path_safe(execution_id)))
}

fn path_safe(id: &str) -> String {
    id.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// Commands (with their working directory) that bring `target` up to date.
fn git_steps(repo_url: &str, branch: Option<&str>, target: &Path) -> Vec<(String, PathBuf)> {
    let branch = branch.filter(|b| !b.is_empty());
    if target.join(".git").is_dir() {
        let target = target.to_path_buf();
        match branch {
            Some(branch) => vec![
                ("git fetch origin".to_string(), target.clone()),
                (format!("git checkout {}", shell_quote(branch)), target.clone()),
                (format!("git pull origin {}", shell_quote(branch)), target),
            ],
            None => vec![
                ("git fetch origin".to_string(), target.clone()),
                ("git pull".to_string(), target),
            ],
        }
    } else {
        let parent = target
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        let branch_arg = branch
            .map(|b| format!("--branch {} ", shell_quote(b)))
            .unwrap_or_default();
        vec![(
            format!(
                "git clone {}{} {}",
                branch_arg,
                shell_quote(repo_url),
                shell_quote(&target.display().to_string())
            ),
            parent,
        )]
    }
}

/// Per-case verdicts: what the results file says, then the run outcome for
/// every expected case it left out. Ordered by the request's case list.
async fn collect_results(
    request: &SuiteExecutionRequest,
    results_file: &Path,
    outcome: &RunOutcome,
) -> Vec<SuiteCaseResult> {
    let content = match tokio::fs::read_to_string(results_file).await {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
        Err(e) => {
            warn!(
                execution_id = %request.execution_id,
                "Could not read results file: {}", e
            );
            String::new()
        }
    };

    let expected: HashSet<&str> = request.case_ids.iter().map(String::as_str).collect();
    let mut reported: Vec<SuiteCaseResult> = Vec::new();
    let mut seen: HashSet<String> = HashSet::new();

    for (number, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let parsed: ResultLine = match serde_json::from_str(line) {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!(execution_id = %request.execution_id, line = number + 1, "Bad results line: {}", e);
                continue;
            }
        };
        let result = match CaseOutcome::from_str(&parsed.result) {
            Ok(result) => result,
            Err(e) => {
                warn!(execution_id = %request.execution_id, line = number + 1, "{}", e);
                continue;
            }
        };
        let Some(case_id) = resolve_case(request, &parsed) else {
            warn!(
                execution_id = %request.execution_id,
                line = number + 1,
                "Result names no known case"
            );
            continue;
        };
        if !expected.is_empty() && !expected.contains(case_id.as_str()) {
            warn!(execution_id = %request.execution_id, case_id = %case_id, "Result for unexpected case");
            continue;
        }
        if !seen.insert(case_id.clone()) {
            continue;
        }
        reported.push(SuiteCaseResult {
            suite_id: request.suite_id.clone(),
            execution_id: Some(request.execution_id.clone()),
            case_id,
            result,
            duration: parsed.duration.unwrap_or(0.0),
            log_output: parsed.log_output,
            error_message: parsed.error_message,
            executor_id: request.executor_id.clone(),
        });
    }

    let (fallback, fallback_error) = inherited_outcome(outcome);
    let mut results = Vec::with_capacity(request.case_ids.len().max(reported.len()));
    for case_id in &request.case_ids {
        if let Some(index) = reported.iter().position(|r| &r.case_id == case_id) {
            results.push(reported.swap_remove(index));
        } else {
            results.push(SuiteCaseResult {
                suite_id: request.suite_id.clone(),
                execution_id: Some(request.execution_id.clone()),
                case_id: case_id.clone(),
                result: fallback,
                duration: 0.0,
                log_output: None,
                error_message: fallback_error.clone(),
                executor_id: request.executor_id.clone(),
            });
        }
    }
    // Suites without a declared case list keep whatever was reported.
    results.extend(reported);
    results
}

fn resolve_case(request: &SuiteExecutionRequest, line: &ResultLine) -> Option<String> {
    if let Some(case_id) = line.case_id.as_ref().filter(|id| !id.is_empty()) {
        return Some(case_id.clone());
    }
    let code = line.case_code.as_ref().filter(|code| !code.is_empty())?;
    match request.case_codes.iter().position(|c| c == code) {
        Some(index) => request.case_ids.get(index).cloned(),
        None if request.case_ids.is_empty() => Some(code.clone()),
        None => None,
    }
}
