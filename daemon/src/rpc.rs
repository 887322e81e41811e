/// JSON-RPC 2.0 server implementation
use crate::errors::{DaemonError, DaemonResult};
use crate::handlers::RpcHandlers;
use crate::metrics::MetricsCollector;
use crate::types::*;
use serde_json::Value;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info};

/// Every method the server answers, in the order listed by `GET /`.
pub const METHODS: &[&str] = &[
    "suite.execute",
    "suite.cancel",
    "suite.status",
    "suite.list",
    "task.get",
    "queue.list",
    "environment.list",
    "environment.evict",
    "environment.run_command",
    "workspace.list",
    "workspace.read",
    "workspace.write",
    "workspace.delete",
    "workspace.mkdir",
    "system.health",
    "system.metrics",
];

/// JSON-RPC Server
pub struct JsonRpcServer {
    handlers: Arc<RpcHandlers>,
    api_key: Option<String>,
    metrics: Arc<MetricsCollector>,
}

impl JsonRpcServer {
    /// Create a new JSON-RPC server. With an `api_key`, every request must
    /// present it as its bearer token.
    pub fn new(
        handlers: Arc<RpcHandlers>,
        api_key: Option<String>,
        metrics: Arc<MetricsCollector>,
    ) -> Self {
        JsonRpcServer {
            handlers,
            api_key: api_key.filter(|key| !key.is_empty()),
            metrics,
        }
    }

    /// Process a JSON-RPC request
    pub async fn process_request(&self, request: RpcRequest) -> RpcResponse {
        let request_id = request.id.clone();
        let method = request.method.clone();
        let start = Instant::now();

        if let Err(e) = self.authenticate(&request) {
            error!("Authentication failed for {}: {}", method, e);
            self.metrics.record_error();
            return RpcResponse::error(e.code(), "Authentication failed".to_string(), request_id);
        }

        debug!("Processing RPC request: {} (id: {:?})", method, request_id);

        // Validate request
        if request.jsonrpc != "2.0" {
            return RpcResponse::error(-32600, "Invalid Request".to_string(), request_id);
        }

        let result = self.dispatch(&method, request.params).await;

        // Record metrics
        let duration = start.elapsed().as_secs_f64();
        self.metrics.record_request(duration);

        // Build response
        match result {
            Ok(data) => {
                info!(
                    "RPC request successful: {} (duration: {:.3}s)",
                    method, duration
                );
                RpcResponse::success(data, request_id)
            }
            Err(e) => {
                error!("RPC request failed: {} - {}", method, e);
                self.metrics.record_error();
                let error = e.to_rpc_error();
                RpcResponse::error(
                    error["code"].as_i64().unwrap_or(-32603),
                    error["message"]
                        .as_str()
                        .unwrap_or("Internal error")
                        .to_string(),
                    request_id,
                )
            }
        }
    }

    /// Process a batch of requests in order
    pub async fn process_batch(&self, requests: Vec<RpcRequest>) -> Vec<RpcResponse> {
        let mut responses = Vec::new();

        for request in requests {
            let response = self.process_request(request).await;
            responses.push(response);
        }

        responses
    }

    async fn dispatch(&self, method: &str, params: Option<Value>) -> DaemonResult<Value> {
        let handlers = &self.handlers;
        match method {
            "suite.execute" => handlers.handle_suite_execute(required(params)?).await,
            "suite.cancel" => handlers.handle_suite_cancel(required(params)?).await,
            "suite.status" => handlers.handle_suite_status(required(params)?).await,
            "suite.list" => handlers.handle_suite_list(optional(params)).await,
            "task.get" => handlers.handle_task_get(required(params)?).await,
            "queue.list" => handlers.handle_queue_list(required(params)?).await,
            "environment.list" => handlers.handle_environment_list(optional(params)).await,
            "environment.evict" => handlers.handle_environment_evict(required(params)?).await,
            "environment.run_command" => handlers.handle_run_command(required(params)?).await,
            "workspace.list" => handlers.handle_workspace_list(required(params)?).await,
            "workspace.read" => handlers.handle_workspace_read(required(params)?).await,
            "workspace.write" => handlers.handle_workspace_write(required(params)?).await,
            "workspace.delete" => handlers.handle_workspace_delete(required(params)?).await,
            "workspace.mkdir" => handlers.handle_workspace_mkdir(required(params)?).await,
            "system.health" => handlers.handle_system_health(optional(params)).await,
            "system.metrics" => handlers.handle_system_metrics(optional(params)).await,
            _ => Err(DaemonError::MethodNotFound(method.to_string())),
        }
    }

    fn authenticate(&self, request: &RpcRequest) -> DaemonResult<()> {
        let Some(expected) = &self.api_key else {
            return Ok(());
        };

        let token = Self::resolve_auth_token(request)
            .ok_or_else(|| DaemonError::AuthError("Missing authentication token".to_string()))?;

        if &token == expected {
            Ok(())
        } else {
            Err(DaemonError::AuthError(
                "Invalid authentication token".to_string(),
            ))
        }
    }

    fn resolve_auth_token(request: &RpcRequest) -> Option<String> {
        request.auth_token.clone().or_else(|| {
            request
                .params
                .as_ref()
                .and_then(|params| params.get("auth_token"))
                .and_then(|v| v.as_str())
                .map(str::to_string)
        })
    }
}

/// Missing params become an `InvalidRequest` error response.
fn required(params: Option<Value>) -> DaemonResult<Value> {
    params.ok_or_else(|| DaemonError::InvalidRequest("Missing params".to_string()))
}

fn optional(params: Option<Value>) -> Value {
    params.unwrap_or_else(|| Value::Object(Default::default()))
}
