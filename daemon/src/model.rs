/// Records exchanged with the persistence layer.
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use testmesh_core::{CaseOutcome, SystemSnapshot, TaskStatus};

/// A registered remote execution node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Environment {
    pub id: String,
    pub name: String,
    /// Credential the agent presents when connecting.
    #[serde(skip_serializing)]
    pub token: String,
    /// `None` falls back to the queue default.
    pub max_concurrent_tasks: Option<u32>,
    /// Work dir handed to the agent in `welcome`.
    pub work_dir: Option<String>,
    pub online: bool,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub last_snapshot: Option<SystemSnapshot>,
}

impl Environment {
    pub fn new(id: impl Into<String>, token: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            token: token.into(),
            max_concurrent_tasks: None,
            work_dir: None,
            online: false,
            last_heartbeat: None,
            last_snapshot: None,
        }
    }

    pub fn with_max_concurrent(mut self, max: u32) -> Self {
        self.max_concurrent_tasks = Some(max);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SuiteCase {
    pub id: String,
    pub code: String,
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GitSource {
    pub repo_url: String,
    #[serde(default)]
    pub branch: Option<String>,
}

/// Displayed status of a suite, derived from its tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SuiteStatus {
    /// No execution has reached a verdict.
    Idle,
    Pending,
    Running,
    Completed,
    Failed,
}

impl SuiteStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            SuiteStatus::Idle => "idle",
            SuiteStatus::Pending => "pending",
            SuiteStatus::Running => "running",
            SuiteStatus::Completed => "completed",
            SuiteStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for SuiteStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SuiteStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "idle" => Ok(SuiteStatus::Idle),
            "pending" => Ok(SuiteStatus::Pending),
            "running" => Ok(SuiteStatus::Running),
            "completed" => Ok(SuiteStatus::Completed),
            "failed" => Ok(SuiteStatus::Failed),
            other => Err(format!("unknown suite status: {}", other)),
        }
    }
}

/// A reusable set of test cases bound to one environment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SuiteDefinition {
    pub id: String,
    pub name: String,
    pub plan_id: Option<String>,
    pub environment_id: String,
    pub execution_command: String,
    pub cases: Vec<SuiteCase>,
    pub git: Option<GitSource>,
    pub status: SuiteStatus,
    pub last_execution_id: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl SuiteDefinition {
    pub fn new(
        id: impl Into<String>,
        environment_id: impl Into<String>,
        execution_command: impl Into<String>,
    ) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            plan_id: None,
            environment_id: environment_id.into(),
            execution_command: execution_command.into(),
            cases: Vec::new(),
            git: None,
            status: SuiteStatus::Idle,
            last_execution_id: None,
            updated_at: Utc::now(),
        }
    }

    pub fn with_case(mut self, id: impl Into<String>, code: impl Into<String>) -> Self {
        self.cases.push(SuiteCase {
            id: id.into(),
            code: code.into(),
            name: None,
        });
        self
    }

    pub fn case_ids(&self) -> Vec<String> {
        self.cases.iter().map(|c| c.id.clone()).collect()
    }

    pub fn case_codes(&self) -> Vec<String> {
        self.cases.iter().map(|c| c.code.clone()).collect()
    }
}

/// Queue entry for one suite execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub execution_id: String,
    pub environment_id: String,
    pub suite_id: String,
    pub requester_id: Option<String>,
    pub status: TaskStatus,
    /// Higher runs sooner.
    pub priority: i32,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Case ids dispatched with the execution, used to infer completion.
    pub expected_case_ids: Vec<String>,
    pub error: Option<String>,
}

/// Accumulated output of one execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionLog {
    pub execution_id: String,
    pub suite_id: String,
    /// Monotonic per suite, assigned when the first line arrives.
    pub sequence: u64,
    pub message: String,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// One reported test-case verdict.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaseResult {
    pub execution_id: String,
    pub suite_id: String,
    pub case_id: String,
    pub outcome: CaseOutcome,
    pub duration_secs: f64,
    pub log_output: Option<String>,
    pub error_message: Option<String>,
    pub executor_id: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

/// Milliseconds since the epoch, as stored in SQLite.
pub(crate) fn to_millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

pub(crate) fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp_millis(ms).unwrap_or_default()
}
