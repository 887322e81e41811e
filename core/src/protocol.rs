/// Wire protocol spoken between the daemon and remote execution agents.
///
/// Every frame is a JSON object with a `type` discriminator; the remaining
/// fields are specific to that type. Two enums cover the two directions:
///
/// ```text
/// Agent                                   Daemon
///   |-- auth -------------------------------->|
///   |<------------------------------ welcome --|
///   |<------------------------- auth_success --|
///   |-- heartbeat --------------------------->|
///   |<------------------------ heartbeat_ack --|
///   |<--------------------- execute_test_suite --|
///   |-- test_suite_log (n) ------------------>|
///   |-- test_suite_result (per case) -------->|
///   |-- test_suite_completed ---------------->|
/// ```
///
/// Decoding distinguishes malformed frames from frames of an unknown type so
/// receivers can log and skip the latter without treating them as corrupt.
use crate::errors::{ProtocolError, ProtocolResult};
use crate::process_runner::RunStatus;
use crate::telemetry::SystemSnapshot;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

/// Protocol revision announced in `welcome`.
pub const PROTOCOL_VERSION: &str = "1";

/// Capability an agent declares when it always sends `test_suite_completed`.
pub const CAPABILITY_SUITE_COMPLETED: &str = "suite_completed";

// ============================================================================
// Shared status enums
// ============================================================================

/// Lifecycle of one queued suite execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TaskStatus::Pending),
            "running" => Ok(TaskStatus::Running),
            "completed" => Ok(TaskStatus::Completed),
            "failed" => Ok(TaskStatus::Failed),
            "cancelled" => Ok(TaskStatus::Cancelled),
            other => Err(ProtocolError::Malformed(format!(
                "unknown task status: {other}"
            ))),
        }
    }
}

/// Verdict for a single test case.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CaseOutcome {
    Passed,
    Failed,
    Error,
    Skipped,
}

impl CaseOutcome {
    /// Failed and errored cases both fail the execution.
    pub fn is_failure(self) -> bool {
        matches!(self, CaseOutcome::Failed | CaseOutcome::Error)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            CaseOutcome::Passed => "passed",
            CaseOutcome::Failed => "failed",
            CaseOutcome::Error => "error",
            CaseOutcome::Skipped => "skipped",
        }
    }
}

impl FromStr for CaseOutcome {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "passed" | "pass" | "ok" => Ok(CaseOutcome::Passed),
            "failed" | "fail" => Ok(CaseOutcome::Failed),
            "error" => Ok(CaseOutcome::Error),
            "skipped" | "skip" => Ok(CaseOutcome::Skipped),
            other => Err(ProtocolError::Malformed(format!(
                "unknown case outcome: {other}"
            ))),
        }
    }
}

/// Final status an agent reports for a whole suite run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SuiteRunStatus {
    Completed,
    Failed,
    Cancelled,
    Timeout,
    Error,
}

impl SuiteRunStatus {
    /// Terminal queue status for this report.
    pub fn to_task_status(self) -> TaskStatus {
        match self {
            SuiteRunStatus::Completed => TaskStatus::Completed,
            SuiteRunStatus::Cancelled => TaskStatus::Cancelled,
            SuiteRunStatus::Failed | SuiteRunStatus::Timeout | SuiteRunStatus::Error => {
                TaskStatus::Failed
            }
        }
    }
}

// ============================================================================
// Agent -> daemon payloads
// ============================================================================

/// Basic platform metadata sent with `auth`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlatformInfo {
    pub os: String,
    #[serde(default)]
    pub os_version: Option<String>,
    #[serde(default)]
    pub hostname: Option<String>,
    #[serde(default)]
    pub arch: Option<String>,
    #[serde(default)]
    pub agent_version: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthPayload {
    pub token: String,
    #[serde(default)]
    pub platform: PlatformInfo,
    #[serde(default)]
    pub capabilities: Vec<String>,
    /// Execution ids this agent is still working on, including finished
    /// runs whose completion has not been written to the daemon yet.
    /// Anything a previous connection was running that is missing here is
    /// treated as lost.
    #[serde(default)]
    pub running_executions: Vec<String>,
}

impl AuthPayload {
    pub fn has_capability(&self, capability: &str) -> bool {
        self.capabilities.iter().any(|c| c == capability)
    }
}

/// Outcome of an ad-hoc `execute_task` request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResultPayload {
    pub task_id: String,
    pub status: RunStatus,
    #[serde(default)]
    pub exit_code: Option<i32>,
    #[serde(default)]
    pub output: String,
    #[serde(default)]
    pub error: Option<String>,
    /// Wall-clock duration in milliseconds.
    #[serde(default)]
    pub duration_ms: u64,
}

/// One test case verdict for a suite execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SuiteCaseResult {
    pub suite_id: String,
    /// Older agents omit this; the daemon then resolves the running
    /// execution of the suite on the reporting environment.
    #[serde(default)]
    pub execution_id: Option<String>,
    pub case_id: String,
    pub result: CaseOutcome,
    /// Seconds.
    #[serde(default)]
    pub duration: f64,
    #[serde(default)]
    pub log_output: Option<String>,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub executor_id: Option<String>,
}

/// A chunk of streamed output for a suite execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SuiteLogChunk {
    pub suite_id: String,
    pub execution_id: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

/// Explicit end-of-run signal for a suite execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SuiteCompletion {
    pub suite_id: String,
    pub execution_id: String,
    pub status: SuiteRunStatus,
    #[serde(default)]
    pub total: u32,
    #[serde(default)]
    pub passed: u32,
    #[serde(default)]
    pub failed: u32,
    #[serde(default)]
    pub errors: u32,
    #[serde(default)]
    pub skipped: u32,
    /// Seconds.
    #[serde(default)]
    pub duration: f64,
}

/// Answer to a cancellation request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CancelAck {
    /// Execution id or task id that was targeted.
    pub target_id: String,
    /// Whether anything was running when the request arrived.
    pub running: bool,
    pub message: String,
}

/// A directory entry returned by `list_files`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileEntry {
    pub name: String,
    pub path: String,
    pub is_dir: bool,
    pub size: u64,
    #[serde(default)]
    pub modified: Option<DateTime<Utc>>,
}

/// Shared shape of every workspace `*_response`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkspaceResponse {
    pub request_id: String,
    pub success: bool,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub entries: Vec<FileEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

impl WorkspaceResponse {
    pub fn ok(request_id: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            success: true,
            ..Default::default()
        }
    }

    pub fn failed(request_id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            success: false,
            error: Some(error.into()),
            ..Default::default()
        }
    }
}

/// Messages sent by an agent to the daemon.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentMessage {
    Auth(AuthPayload),
    Heartbeat(SystemSnapshot),
    Pong { timestamp: DateTime<Utc> },
    TaskResult(TaskResultPayload),
    TestSuiteResult(SuiteCaseResult),
    TestSuiteLog(SuiteLogChunk),
    TestSuiteCompleted(SuiteCompletion),
    CancelAck(CancelAck),
    ListFilesResponse(WorkspaceResponse),
    ReadFileResponse(WorkspaceResponse),
    WriteFileResponse(WorkspaceResponse),
    DeleteFileResponse(WorkspaceResponse),
    MakeDirResponse(WorkspaceResponse),
}

/// Every `type` value an [`AgentMessage`] can carry.
pub const AGENT_MESSAGE_TYPES: &[&str] = &[
    "auth",
    "heartbeat",
    "pong",
    "task_result",
    "test_suite_result",
    "test_suite_log",
    "test_suite_completed",
    "cancel_ack",
    "list_files_response",
    "read_file_response",
    "write_file_response",
    "delete_file_response",
    "make_dir_response",
];

impl AgentMessage {
    pub fn message_type(&self) -> &'static str {
        match self {
            AgentMessage::Auth(_) => "auth",
            AgentMessage::Heartbeat(_) => "heartbeat",
            AgentMessage::Pong { .. } => "pong",
            AgentMessage::TaskResult(_) => "task_result",
            AgentMessage::TestSuiteResult(_) => "test_suite_result",
            AgentMessage::TestSuiteLog(_) => "test_suite_log",
            AgentMessage::TestSuiteCompleted(_) => "test_suite_completed",
            AgentMessage::CancelAck(_) => "cancel_ack",
            AgentMessage::ListFilesResponse(_) => "list_files_response",
            AgentMessage::ReadFileResponse(_) => "read_file_response",
            AgentMessage::WriteFileResponse(_) => "write_file_response",
            AgentMessage::DeleteFileResponse(_) => "delete_file_response",
            AgentMessage::MakeDirResponse(_) => "make_dir_response",
        }
    }

    /// Correlation id for messages that answer a daemon request.
    pub fn request_id(&self) -> Option<&str> {
        match self {
            AgentMessage::TaskResult(result) => Some(&result.task_id),
            AgentMessage::ListFilesResponse(r)
            | AgentMessage::ReadFileResponse(r)
            | AgentMessage::WriteFileResponse(r)
            | AgentMessage::DeleteFileResponse(r)
            | AgentMessage::MakeDirResponse(r) => Some(&r.request_id),
            _ => None,
        }
    }

    pub fn to_json(&self) -> ProtocolResult<String> {
        Ok(serde_json::to_string(self)?)
    }
}

// ============================================================================
// Daemon -> agent payloads
// ============================================================================

/// Sent on connect (`welcome`) and in reply to `auth` (`auth_success`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WelcomePayload {
    pub environment_id: String,
    #[serde(default)]
    pub work_dir: Option<String>,
    /// Seconds the agent waits after a disconnect before retrying.
    pub reconnect_delay: u64,
    #[serde(default)]
    pub protocol_version: Option<String>,
    #[serde(default)]
    pub server_version: Option<String>,
}

/// Ad-hoc shell command for an agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRequest {
    pub task_id: String,
    pub command: String,
    /// Seconds; the agent default applies when absent.
    #[serde(default)]
    pub timeout: Option<u64>,
    #[serde(default)]
    pub working_dir: Option<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
}

/// Everything an agent needs to run one suite execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SuiteExecutionRequest {
    pub suite_id: String,
    #[serde(default)]
    pub plan_id: Option<String>,
    pub execution_id: String,
    #[serde(default)]
    pub git_enabled: bool,
    #[serde(default)]
    pub git_repo_url: Option<String>,
    #[serde(default)]
    pub git_branch: Option<String>,
    pub execution_command: String,
    #[serde(default)]
    pub case_ids: Vec<String>,
    #[serde(default)]
    pub case_codes: Vec<String>,
    #[serde(default)]
    pub executor_id: Option<String>,
    /// Seconds; the agent default applies when absent.
    #[serde(default)]
    pub timeout: Option<u64>,
}

/// Messages sent by the daemon to an agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Welcome(WelcomePayload),
    AuthSuccess(WelcomePayload),
    HeartbeatAck { timestamp: DateTime<Utc> },
    Ping { timestamp: DateTime<Utc> },
    ExecuteTask(TaskRequest),
    CancelTask { task_id: String },
    ExecuteTestSuite(SuiteExecutionRequest),
    CancelTestSuite { suite_id: String, execution_id: String },
    /// Forced-disconnect notice; the connection is closed right after.
    TokenInvalid { reason: String },
    ListFiles { request_id: String, path: String },
    ReadFile { request_id: String, path: String },
    WriteFile {
        request_id: String,
        path: String,
        content: String,
    },
    DeleteFile { request_id: String, path: String },
    MakeDir { request_id: String, path: String },
}

/// Every `type` value a [`ServerMessage`] can carry.
pub const SERVER_MESSAGE_TYPES: &[&str] = &[
    "welcome",
    "auth_success",
    "heartbeat_ack",
    "ping",
    "execute_task",
    "cancel_task",
    "execute_test_suite",
    "cancel_test_suite",
    "token_invalid",
    "list_files",
    "read_file",
    "write_file",
    "delete_file",
    "make_dir",
];

impl ServerMessage {
    pub fn message_type(&self) -> &'static str {
        match self {
            ServerMessage::Welcome(_) => "welcome",
            ServerMessage::AuthSuccess(_) => "auth_success",
            ServerMessage::HeartbeatAck { .. } => "heartbeat_ack",
            ServerMessage::Ping { .. } => "ping",
            ServerMessage::ExecuteTask(_) => "execute_task",
            ServerMessage::CancelTask { .. } => "cancel_task",
            ServerMessage::ExecuteTestSuite(_) => "execute_test_suite",
            ServerMessage::CancelTestSuite { .. } => "cancel_test_suite",
            ServerMessage::TokenInvalid { .. } => "token_invalid",
            ServerMessage::ListFiles { .. } => "list_files",
            ServerMessage::ReadFile { .. } => "read_file",
            ServerMessage::WriteFile { .. } => "write_file",
            ServerMessage::DeleteFile { .. } => "delete_file",
            ServerMessage::MakeDir { .. } => "make_dir",
        }
    }

    pub fn to_json(&self) -> ProtocolResult<String> {
        Ok(serde_json::to_string(self)?)
    }
}

// ============================================================================
// Decoding
// ============================================================================

/// Decode a frame received from an agent.
pub fn decode_agent_message(text: &str) -> ProtocolResult<AgentMessage> {
    decode_tagged(text, AGENT_MESSAGE_TYPES)
}

/// Decode a frame received from the daemon.
pub fn decode_server_message(text: &str) -> ProtocolResult<ServerMessage> {
    decode_tagged(text, SERVER_MESSAGE_TYPES)
}

fn decode_tagged<T: DeserializeOwned>(text: &str, known: &[&str]) -> ProtocolResult<T> {
    let value: Value =
        serde_json::from_str(text).map_err(|e| ProtocolError::Malformed(e.to_string()))?;
    let kind = value
        .get("type")
        .and_then(Value::as_str)
        .ok_or(ProtocolError::MissingType)?
        .to_string();

    if !known.contains(&kind.as_str()) {
        return Err(ProtocolError::UnknownType(kind));
    }

    serde_json::from_value(value).map_err(|e| ProtocolError::Malformed(format!("{kind}: {e}")))
}
