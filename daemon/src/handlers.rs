/// RPC method handlers
use crate::agent_socket::AgentGateway;
use crate::dispatch::SuiteDispatcher;
use crate::errors::{DaemonError, DaemonResult};
use crate::metrics::MetricsCollector;
use crate::registry::ConnectionRegistry;
use crate::remote::AgentClient;
use crate::store::DispatchStore;
use crate::types::*;
use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use testmesh_core::TaskStatus;

/// Reason recorded when an operator evicts without giving one.
const DEFAULT_EVICT_REASON: &str = "evicted by operator";

/// RPC handlers
pub struct RpcHandlers {
    store: Arc<dyn DispatchStore>,
    dispatcher: Arc<SuiteDispatcher>,
    registry: Arc<ConnectionRegistry>,
    gateway: Arc<AgentGateway>,
    agents: Arc<AgentClient>,
    metrics: Arc<MetricsCollector>,
}

fn parse<T: DeserializeOwned>(params: Value) -> DaemonResult<T> {
    serde_json::from_value(params)
        .map_err(|e| DaemonError::InvalidRequest(format!("Invalid params: {}", e)))
}

fn to_value<T: Serialize>(response: T) -> DaemonResult<Value> {
    serde_json::to_value(response).map_err(|e| DaemonError::SerializationError(e.to_string()))
}

impl RpcHandlers {
    pub fn new(
        store: Arc<dyn DispatchStore>,
        dispatcher: Arc<SuiteDispatcher>,
        registry: Arc<ConnectionRegistry>,
        gateway: Arc<AgentGateway>,
        agents: Arc<AgentClient>,
        metrics: Arc<MetricsCollector>,
    ) -> Self {
        RpcHandlers {
            store,
            dispatcher,
            registry,
            gateway,
            agents,
            metrics,
        }
    }

    /// Handle suite.execute RPC method
    pub async fn handle_suite_execute(&self, params: Value) -> DaemonResult<Value> {
        let request: SuiteExecuteParams = parse(params)?;
        let response = self
            .dispatcher
            .execute_suite(
                &request.suite_id,
                request.requester_id,
                request.priority.unwrap_or(0),
            )
            .await?;
        to_value(response)
    }

    /// Handle suite.cancel RPC method
    pub async fn handle_suite_cancel(&self, params: Value) -> DaemonResult<Value> {
        let request: SuiteCancelParams = parse(params)?;
        let response = self
            .dispatcher
            .cancel_suite_execution(&request.suite_id, &request.execution_id)
            .await?;
        to_value(response)
    }

    /// Handle suite.status RPC method
    pub async fn handle_suite_status(&self, params: Value) -> DaemonResult<Value> {
        let request: SuiteStatusParams = parse(params)?;
        let suite = self
            .store
            .get_suite(&request.suite_id)
            .await?
            .ok_or_else(|| DaemonError::SuiteNotFound(request.suite_id.clone()))?;

        let mut executions = self.store.tasks_for_suite(&suite.id).await?;
        executions.sort_by(|a, b| b.created_at.cmp(&a.created_at));

        to_value(SuiteStatusResponse { suite, executions })
    }

    /// Handle suite.list RPC method
    pub async fn handle_suite_list(&self, _params: Value) -> DaemonResult<Value> {
        to_value(self.store.list_suites().await?)
    }

    /// Handle task.get RPC method
    pub async fn handle_task_get(&self, params: Value) -> DaemonResult<Value> {
        let request: TaskGetParams = parse(params)?;
        let task = self
            .store
            .get_task(&request.execution_id)
            .await?
            .ok_or_else(|| DaemonError::TaskNotFound(request.execution_id.clone()))?;
        let log = self.store.get_log(&task.execution_id).await?;
        let results = self.store.results_for_execution(&task.execution_id).await?;

        to_value(TaskDetail { task, log, results })
    }

    /// Handle queue.list RPC method: running tasks first, then pending in
    /// the order they will be dispatched.
    pub async fn handle_queue_list(&self, params: Value) -> DaemonResult<Value> {
        let request: QueueListParams = parse(params)?;
        if self
            .store
            .get_environment(&request.environment_id)
            .await?
            .is_none()
        {
            return Err(DaemonError::EnvironmentNotFound(request.environment_id));
        }
        to_value(self.dispatcher.queue().active(&request.environment_id).await?)
    }

    /// Handle environment.list RPC method
    pub async fn handle_environment_list(&self, _params: Value) -> DaemonResult<Value> {
        let mut environments = Vec::new();
        for environment in self.store.list_environments().await? {
            let running = self
                .store
                .count_tasks(&environment.id, TaskStatus::Running)
                .await?;
            let pending = self
                .store
                .count_tasks(&environment.id, TaskStatus::Pending)
                .await?;
            environments.push(EnvironmentInfo {
                connected: self.registry.is_connected(&environment.id),
                environment,
                running,
                pending,
            });
        }
        to_value(environments)
    }

    /// Handle environment.evict RPC method
    pub async fn handle_environment_evict(&self, params: Value) -> DaemonResult<Value> {
        let request: EnvironmentEvictParams = parse(params)?;
        if matches!(request.new_token.as_deref(), Some("")) {
            return Err(DaemonError::InvalidRequest(
                "new_token must not be empty".to_string(),
            ));
        }
        let reason = request
            .reason
            .as_deref()
            .unwrap_or(DEFAULT_EVICT_REASON);
        let response = self
            .gateway
            .evict(&request.environment_id, reason, request.new_token.as_deref())
            .await?;
        to_value(response)
    }

    /// Handle environment.run_command RPC method
    pub async fn handle_run_command(&self, params: Value) -> DaemonResult<Value> {
        let request: RunCommandParams = parse(params)?;
        if request.command.trim().is_empty() {
            return Err(DaemonError::InvalidRequest("command is empty".to_string()));
        }
        let result = self
            .agents
            .run_command(
                &request.environment_id,
                &request.command,
                request.timeout_secs,
                request.working_dir,
                request.env,
            )
            .await?;
        to_value(result)
    }

    /// Handle workspace.list RPC method
    pub async fn handle_workspace_list(&self, params: Value) -> DaemonResult<Value> {
        let request: WorkspaceParams = parse(params)?;
        let path = if request.path.is_empty() {
            "."
        } else {
            request.path.as_str()
        };
        to_value(self.agents.list_files(&request.environment_id, path).await?)
    }

    /// Handle workspace.read RPC method
    pub async fn handle_workspace_read(&self, params: Value) -> DaemonResult<Value> {
        let request: WorkspaceParams = parse(params)?;
        require_path(&request)?;
        let content = self
            .agents
            .read_file(&request.environment_id, &request.path)
            .await?;
        Ok(serde_json::json!({ "path": request.path, "content": content }))
    }

    /// Handle workspace.write RPC method
    pub async fn handle_workspace_write(&self, params: Value) -> DaemonResult<Value> {
        let request: WorkspaceParams = parse(params)?;
        require_path(&request)?;
        let content = request
            .content
            .as_deref()
            .ok_or_else(|| DaemonError::InvalidRequest("Missing content".to_string()))?;
        self.agents
            .write_file(&request.environment_id, &request.path, content)
            .await?;
        Ok(serde_json::json!({ "path": request.path, "success": true }))
    }

    /// Handle workspace.delete RPC method
    pub async fn handle_workspace_delete(&self, params: Value) -> DaemonResult<Value> {
        let request: WorkspaceParams = parse(params)?;
        require_path(&request)?;
        self.agents
            .delete_file(&request.environment_id, &request.path)
            .await?;
        Ok(serde_json::json!({ "path": request.path, "success": true }))
    }

    /// Handle workspace.mkdir RPC method
    pub async fn handle_workspace_mkdir(&self, params: Value) -> DaemonResult<Value> {
        let request: WorkspaceParams = parse(params)?;
        require_path(&request)?;
        self.agents
            .make_dir(&request.environment_id, &request.path)
            .await?;
        Ok(serde_json::json!({ "path": request.path, "success": true }))
    }

    /// Handle system.health RPC method
    pub async fn handle_system_health(&self, _params: Value) -> DaemonResult<Value> {
        to_value(HealthResponse {
            status: "healthy".to_string(),
            version: crate::VERSION.to_string(),
            uptime_secs: self.metrics.uptime_secs(),
            connected_agents: self.registry.len(),
            timestamp: Utc::now(),
        })
    }

    /// Handle system.metrics RPC method
    pub async fn handle_system_metrics(&self, _params: Value) -> DaemonResult<Value> {
        to_value(self.metrics.get_metrics_response())
    }
}

fn require_path(request: &WorkspaceParams) -> DaemonResult<()> {
    if request.path.is_empty() {
        Err(DaemonError::InvalidRequest("Missing path".to_string()))
    } else {
        Ok(())
    }
}
