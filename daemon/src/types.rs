/// Type definitions for the dispatch daemon's JSON-RPC API
use crate::model::{CaseResult, Environment, ExecutionLog, SuiteDefinition, Task};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use testmesh_core::TaskStatus;

/// JSON-RPC 2.0 Request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcRequest {
    pub jsonrpc: String,
    pub method: String,
    pub params: Option<serde_json::Value>,
    pub id: Option<serde_json::Value>,
    #[serde(skip)]
    pub auth_token: Option<String>,
}

/// JSON-RPC 2.0 Response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcResponse {
    pub jsonrpc: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
    pub id: Option<serde_json::Value>,
}

/// JSON-RPC 2.0 Error
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl RpcResponse {
    /// Create a successful response
    pub fn success(result: serde_json::Value, id: Option<serde_json::Value>) -> Self {
        RpcResponse {
            jsonrpc: "2.0".to_string(),
            result: Some(result),
            error: None,
            id,
        }
    }

    /// Create an error response
    pub fn error(code: i64, message: String, id: Option<serde_json::Value>) -> Self {
        RpcResponse {
            jsonrpc: "2.0".to_string(),
            result: None,
            error: Some(RpcError {
                code,
                message,
                data: None,
            }),
            id,
        }
    }
}

// ============================================================================
// Suite execution
// ============================================================================

/// `suite.execute` parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuiteExecuteParams {
    pub suite_id: String,
    #[serde(default)]
    pub requester_id: Option<String>,
    #[serde(default)]
    pub priority: Option<i32>,
}

/// Result of a dispatch request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecuteResponse {
    pub execution_id: String,
    pub suite_id: String,
    pub environment_id: String,
    pub status: TaskStatus,
    /// True when the execution is waiting for a free slot.
    pub queued: bool,
    pub message: String,
}

/// `suite.cancel` parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuiteCancelParams {
    pub suite_id: String,
    pub execution_id: String,
}

/// Result of a cancellation request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CancelResponse {
    pub execution_id: String,
    pub suite_id: String,
    pub status: TaskStatus,
    /// Whether the agent was told to stop a running execution.
    pub agent_notified: bool,
    pub message: String,
}

/// `suite.status` parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuiteStatusParams {
    pub suite_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuiteStatusResponse {
    pub suite: SuiteDefinition,
    /// Newest first.
    pub executions: Vec<Task>,
}

/// `task.get` parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskGetParams {
    pub execution_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskDetail {
    pub task: Task,
    pub log: Option<ExecutionLog>,
    pub results: Vec<CaseResult>,
}

/// `queue.list` parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueListParams {
    pub environment_id: String,
}

// ============================================================================
// Environments
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvironmentInfo {
    #[serde(flatten)]
    pub environment: Environment,
    pub connected: bool,
    pub running: usize,
    pub pending: usize,
}

/// `environment.evict` parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvironmentEvictParams {
    pub environment_id: String,
    #[serde(default)]
    pub reason: Option<String>,
    /// Replace the environment's token before disconnecting.
    #[serde(default)]
    pub new_token: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvictResponse {
    pub environment_id: String,
    pub disconnected: bool,
    pub token_rotated: bool,
}

/// `environment.run_command` parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunCommandParams {
    pub environment_id: String,
    pub command: String,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub working_dir: Option<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
}

/// Parameters shared by the `workspace.*` methods
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkspaceParams {
    pub environment_id: String,
    #[serde(default)]
    pub path: String,
    /// Only used by `workspace.write`.
    #[serde(default)]
    pub content: Option<String>,
}

// ============================================================================
// System
// ============================================================================

/// Health check response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub uptime_secs: u64,
    pub connected_agents: usize,
    pub timestamp: DateTime<Utc>,
}

/// Metrics response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsResponse {
    pub agents: MetricsAgents,
    pub tasks: MetricsTasks,
    pub system: MetricsSystem,
    pub timestamp: DateTime<Utc>,
}

/// Agent connection metrics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsAgents {
    pub connected: usize,
    pub connections_total: u64,
    pub rejected: u64,
}

/// Task queue metrics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsTasks {
    pub enqueued: u64,
    pub dispatched: u64,
    pub dispatch_failures: u64,
    pub completed: HashMap<String, u64>,
}

/// System metrics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSystem {
    pub uptime_secs: u64,
    pub requests_total: u64,
    pub request_errors: u64,
}
