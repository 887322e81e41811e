/// Daemon assembly plus the HTTP listeners for JSON-RPC and Prometheus.
use crate::agent_socket::{AgentGateway, GatewaySettings};
use crate::broker::PendingRequests;
use crate::config::DaemonConfig;
use crate::dispatch::SuiteDispatcher;
use crate::errors::{DaemonError, DaemonResult};
use crate::event_stream::serve_event_stream;
use crate::events::EventBus;
use crate::handlers::RpcHandlers;
use crate::metrics::MetricsCollector;
use crate::registry::ConnectionRegistry;
use crate::remote::AgentClient;
use crate::rpc::{JsonRpcServer, METHODS};
use crate::sqlite_store::SqliteStore;
use crate::store::{DispatchStore, MemoryStore};
use crate::task_queue::TaskQueue;
use crate::types::*;
use hyper::header::{AUTHORIZATION, CONTENT_TYPE};
use hyper::server::conn::AddrIncoming;
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, Server, StatusCode};
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Reason recorded on executions left running by a previous daemon process.
const REASON_RESTART: &str = "daemon restarted";

/// Fully wired dispatch daemon.
pub struct DispatchServer {
    config: DaemonConfig,
    store: Arc<dyn DispatchStore>,
    registry: Arc<ConnectionRegistry>,
    events: Arc<EventBus>,
    metrics: Arc<MetricsCollector>,
    dispatcher: Arc<SuiteDispatcher>,
    gateway: Arc<AgentGateway>,
    rpc: Arc<JsonRpcServer>,
}

/// Bound addresses and the shutdown switch of a started daemon.
pub struct DaemonHandle {
    pub http_addr: SocketAddr,
    pub agent_addr: SocketAddr,
    pub events_addr: SocketAddr,
    pub metrics_addr: Option<SocketAddr>,
    shutdown: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl DaemonHandle {
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Stop every listener and wait for them to finish.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        for task in self.tasks {
            if let Err(e) = task.await {
                warn!("Listener task ended abnormally: {}", e);
            }
        }
    }
}

impl DispatchServer {
    /// Open the configured store and build the daemon on top of it.
    pub async fn new(config: DaemonConfig) -> DaemonResult<Self> {
        let store: Arc<dyn DispatchStore> = match &config.storage.sqlite_path {
            Some(path) => {
                info!("Opening SQLite store at {}", path.display());
                let store = SqliteStore::new(path).await?;
                store.initialize().await?;
                Arc::new(store)
            }
            None => {
                info!("Using in-memory store");
                Arc::new(MemoryStore::new())
            }
        };
        Self::with_store(config, store).await
    }

    /// Build the daemon over an existing store, loading the configured seed
    /// data and failing executions a previous process left running.
    pub async fn with_store(config: DaemonConfig, store: Arc<dyn DispatchStore>) -> DaemonResult<Self> {
        config.validate()?;

        for env in &config.seed.environments {
            store.upsert_environment(env.to_environment()).await?;
        }
        for suite in &config.seed.suites {
            store.upsert_suite(suite.to_suite()).await?;
        }

        let metrics = Arc::new(MetricsCollector::new()?);
        let events = Arc::new(EventBus::new());
        let registry = Arc::new(ConnectionRegistry::new());
        let queue = Arc::new(TaskQueue::new(
            store.clone(),
            config.queue.default_max_concurrent_tasks,
        ));
        let dispatcher = Arc::new(SuiteDispatcher::new(
            store.clone(),
            queue,
            registry.clone(),
            events.clone(),
            metrics.clone(),
        ));

        for env in store.list_environments().await? {
            dispatcher.on_agent_disconnected(&env.id, REASON_RESTART).await?;
        }

        let broker = Arc::new(PendingRequests::new(registry.clone()));
        let agents = Arc::new(AgentClient::new(
            broker.clone(),
            registry.clone(),
            config.server.request_timeout(),
        ));
        let gateway = Arc::new(AgentGateway::new(
            store.clone(),
            registry.clone(),
            dispatcher.clone(),
            broker,
            events.clone(),
            metrics.clone(),
            GatewaySettings {
                ping_interval: config.server.ping_interval(),
                liveness_timeout: config.server.liveness_timeout(),
                reconnect_delay_secs: config.server.reconnect_delay_secs,
                default_work_dir: config.server.agent_work_dir.clone(),
            },
        ));
        let handlers = Arc::new(RpcHandlers::new(
            store.clone(),
            dispatcher.clone(),
            registry.clone(),
            gateway.clone(),
            agents,
            metrics.clone(),
        ));
        let rpc = Arc::new(JsonRpcServer::new(
            handlers,
            config.auth.api_key.clone(),
            metrics.clone(),
        ));

        Ok(DispatchServer {
            config,
            store,
            registry,
            events,
            metrics,
            dispatcher,
            gateway,
            rpc,
        })
    }

    pub fn store(&self) -> &Arc<dyn DispatchStore> {
        &self.store
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    pub fn dispatcher(&self) -> &Arc<SuiteDispatcher> {
        &self.dispatcher
    }

    pub fn rpc(&self) -> &Arc<JsonRpcServer> {
        &self.rpc
    }

    /// Bind every listener and serve in the background. Port 0 picks a free
    /// port; the chosen addresses are on the returned handle.
    pub async fn start(&self) -> DaemonResult<DaemonHandle> {
        let server = &self.config.server;
        let shutdown = CancellationToken::new();
        let mut tasks = Vec::new();

        let agent_listener = bind(&server.bind_addr, server.agent_port).await?;
        let agent_addr = agent_listener.local_addr()?;
        info!("Agent gateway listening on ws://{}", agent_addr);
        tasks.push(tokio::spawn(
            self.gateway.clone().serve(agent_listener, shutdown.clone()),
        ));

        let events_listener = bind(&server.bind_addr, server.events_port).await?;
        let events_addr = events_listener.local_addr()?;
        info!("Event stream listening on ws://{}", events_addr);
        tasks.push(tokio::spawn(serve_event_stream(
            events_listener,
            self.events.clone(),
            server.ping_interval(),
            shutdown.clone(),
        )));

        let http_listener = bind(&server.bind_addr, server.http_port).await?;
        let http_addr = http_listener.local_addr()?;
        info!("HTTP RPC server listening on http://{}", http_addr);
        tasks.push(spawn_http(
            http_listener,
            self.rpc.clone(),
            shutdown.clone(),
        )?);

        let metrics_addr = if self.config.metrics.enabled {
            let listener = bind(&server.bind_addr, self.config.metrics.port).await?;
            let addr = listener.local_addr()?;
            info!("Metrics endpoint listening on http://{}", addr);
            tasks.push(spawn_metrics(listener, self.metrics.clone(), shutdown.clone())?);
            Some(addr)
        } else {
            None
        };

        Ok(DaemonHandle {
            http_addr,
            agent_addr,
            events_addr,
            metrics_addr,
            shutdown,
            tasks,
        })
    }
}

async fn bind(host: &str, port: u16) -> DaemonResult<TcpListener> {
    let addr: SocketAddr = format!("{}:{}", host, port)
        .parse()
        .map_err(|e| DaemonError::ServerError(format!("Invalid address: {}", e)))?;
    TcpListener::bind(addr)
        .await
        .map_err(|e| DaemonError::ServerError(format!("Failed to bind {}: {}", addr, e)))
}

fn incoming(listener: TcpListener) -> DaemonResult<AddrIncoming> {
    AddrIncoming::from_listener(listener)
        .map_err(|e| DaemonError::ServerError(format!("Failed to accept on listener: {}", e)))
}

fn spawn_http(
    listener: TcpListener,
    rpc: Arc<JsonRpcServer>,
    shutdown: CancellationToken,
) -> DaemonResult<JoinHandle<()>> {
    let make_svc = make_service_fn(move |_conn| {
        let rpc = rpc.clone();
        async move {
            Ok::<_, hyper::Error>(service_fn(move |req| {
                let rpc = rpc.clone();
                handle_http_request(req, rpc)
            }))
        }
    });

    let server = Server::builder(incoming(listener)?)
        .serve(make_svc)
        .with_graceful_shutdown(async move { shutdown.cancelled().await });

    Ok(tokio::spawn(async move {
        if let Err(e) = server.await {
            error!("HTTP server error: {}", e);
        }
    }))
}

fn spawn_metrics(
    listener: TcpListener,
    metrics: Arc<MetricsCollector>,
    shutdown: CancellationToken,
) -> DaemonResult<JoinHandle<()>> {
    let make_svc = make_service_fn(move |_conn| {
        let metrics = metrics.clone();
        async move {
            Ok::<_, hyper::Error>(service_fn(move |_req| {
                let metrics = metrics.clone();
                handle_metrics_request(metrics)
            }))
        }
    });

    let server = Server::builder(incoming(listener)?)
        .serve(make_svc)
        .with_graceful_shutdown(async move { shutdown.cancelled().await });

    Ok(tokio::spawn(async move {
        if let Err(e) = server.await {
            error!("Metrics server error: {}", e);
        }
    }))
}

fn json_response(status: StatusCode, body: String) -> Response<Body> {
    let mut response = Response::new(Body::from(body));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, hyper::header::HeaderValue::from_static("application/json"));
    response
}

fn internal_error_body() -> String {
    json!({
        "jsonrpc": "2.0",
        "error": {
            "code": -32603,
            "message": "Internal server error"
        },
        "id": serde_json::Value::Null
    })
    .to_string()
}

/// Handle HTTP RPC requests
async fn handle_http_request(
    req: Request<Body>,
    rpc: Arc<JsonRpcServer>,
) -> Result<Response<Body>, hyper::Error> {
    match *req.method() {
        Method::POST => {
            let header_token = req
                .headers()
                .get(AUTHORIZATION)
                .and_then(|value| value.to_str().ok())
                .and_then(parse_bearer_token);

            let body_bytes = hyper::body::to_bytes(req.into_body()).await?;

            let result = match serde_json::from_slice::<RpcRequest>(&body_bytes) {
                Ok(mut request) => {
                    if request.auth_token.is_none() {
                        request.auth_token = header_token;
                    }
                    let response = rpc.process_request(request).await;
                    serde_json::to_string(&response).unwrap_or_else(|_| internal_error_body())
                }
                Err(_) => match serde_json::from_slice::<Vec<RpcRequest>>(&body_bytes) {
                    Ok(mut requests) => {
                        for request in requests.iter_mut() {
                            if request.auth_token.is_none() {
                                request.auth_token = header_token.clone();
                            }
                        }
                        let responses = rpc.process_batch(requests).await;
                        serde_json::to_string(&responses).unwrap_or_else(|_| internal_error_body())
                    }
                    Err(e) => json!({
                        "jsonrpc": "2.0",
                        "error": {
                            "code": -32700,
                            "message": format!("Parse error: {}", e)
                        },
                        "id": serde_json::Value::Null
                    })
                    .to_string(),
                },
            };

            Ok(json_response(StatusCode::OK, result))
        }
        Method::GET => {
            let response = json!({
                "name": "Testmesh dispatch daemon",
                "version": crate::VERSION,
                "methods": METHODS,
            });
            Ok(json_response(StatusCode::OK, response.to_string()))
        }
        _ => {
            let mut response = Response::new(Body::from("Method not allowed"));
            *response.status_mut() = StatusCode::METHOD_NOT_ALLOWED;
            Ok(response)
        }
    }
}

fn parse_bearer_token(header: &str) -> Option<String> {
    let trimmed = header.trim();
    let mut parts = trimmed.splitn(2, ' ');
    let scheme = parts.next()?.to_ascii_lowercase();
    if scheme != "bearer" {
        return Some(trimmed.to_string()).filter(|t| !t.is_empty());
    }
    let token = parts.next()?.trim();
    if token.is_empty() {
        None
    } else {
        Some(token.to_string())
    }
}

/// Handle metrics requests
async fn handle_metrics_request(
    metrics: Arc<MetricsCollector>,
) -> Result<Response<Body>, hyper::Error> {
    match metrics.gather_metrics() {
        Ok(body) => {
            let mut response = Response::new(Body::from(body));
            response.headers_mut().insert(
                CONTENT_TYPE,
                hyper::header::HeaderValue::from_static("text/plain; version=0.0.4"),
            );
            Ok(response)
        }
        Err(e) => {
            error!("Failed to gather metrics: {:?}", e);
            let mut response = Response::new(Body::from("Failed to gather metrics"));
            *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
            Ok(response)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{SeedEnvironment, SeedSuite};
    use serde_json::Value;
    use testmesh_core::TaskStatus;

    fn seeded_config() -> DaemonConfig {
        let mut config = DaemonConfig::default();
        config.seed.environments.push(SeedEnvironment {
            id: "env-1".to_string(),
            name: None,
            token: "secret".to_string(),
            max_concurrent_tasks: None,
            work_dir: None,
        });
        config.seed.suites.push(SeedSuite {
            id: "smoke".to_string(),
            name: None,
            plan_id: None,
            environment_id: "env-1".to_string(),
            execution_command: "true".to_string(),
            cases: Vec::new(),
            git: None,
        });
        config
    }

    fn request(method: &str, params: Option<Value>) -> RpcRequest {
        RpcRequest {
            jsonrpc: "2.0".to_string(),
            method: method.to_string(),
            params,
            id: Some(json!(1)),
            auth_token: None,
        }
    }

    #[test]
    fn test_parse_bearer_token() {
        assert_eq!(parse_bearer_token("Bearer abc").as_deref(), Some("abc"));
        assert_eq!(parse_bearer_token("bearer  abc ").as_deref(), Some("abc"));
        assert_eq!(parse_bearer_token("raw-key").as_deref(), Some("raw-key"));
        assert_eq!(parse_bearer_token("Bearer "), None);
    }

    #[tokio::test]
    async fn test_seed_is_loaded() {
        let server = DispatchServer::with_store(seeded_config(), Arc::new(MemoryStore::new()))
            .await
            .unwrap();
        assert!(server.store().get_environment("env-1").await.unwrap().is_some());
        assert!(server.store().get_suite("smoke").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_restart_fails_orphaned_running_tasks() {
        let store: Arc<dyn DispatchStore> = Arc::new(MemoryStore::new());
        let config = seeded_config();
        store
            .upsert_environment(config.seed.environments[0].to_environment())
            .await
            .unwrap();
        store.upsert_suite(config.seed.suites[0].to_suite()).await.unwrap();
        let queue = TaskQueue::new(store.clone(), 1);
        let task = queue
            .enqueue(crate::task_queue::EnqueueRequest {
                execution_id: "exec-1".to_string(),
                environment_id: "env-1".to_string(),
                suite_id: "smoke".to_string(),
                requester_id: None,
                priority: 0,
                expected_case_ids: Vec::new(),
            })
            .await
            .unwrap();
        queue.start(&task.execution_id).await.unwrap();

        let server = DispatchServer::with_store(config, store).await.unwrap();
        let task = server.store().get_task("exec-1").await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert!(task.error.unwrap().contains(REASON_RESTART));
    }

    #[tokio::test]
    async fn test_start_binds_ephemeral_ports() {
        let mut config = seeded_config();
        config.server.http_port = 0;
        config.server.agent_port = 0;
        config.server.events_port = 0;
        config.metrics.port = 0;
        let server = DispatchServer::with_store(config, Arc::new(MemoryStore::new()))
            .await
            .unwrap();

        let handle = server.start().await.unwrap();
        assert_ne!(handle.http_addr.port(), 0);
        assert_ne!(handle.agent_addr.port(), handle.events_addr.port());
        assert!(handle.metrics_addr.is_some());
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_rpc_rejects_bad_version_and_unknown_method() {
        let server = DispatchServer::with_store(seeded_config(), Arc::new(MemoryStore::new()))
            .await
            .unwrap();

        let mut bad = request("system.health", None);
        bad.jsonrpc = "1.0".to_string();
        let response = server.rpc().process_request(bad).await;
        assert_eq!(response.error.unwrap().code, -32600);

        let response = server
            .rpc()
            .process_request(request("unknown.method", None))
            .await;
        assert_eq!(response.error.unwrap().code, -32601);
    }

    #[tokio::test]
    async fn test_rpc_api_key() {
        let mut config = seeded_config();
        config.auth.api_key = Some("api-test-key".to_string());
        let server = DispatchServer::with_store(config, Arc::new(MemoryStore::new()))
            .await
            .unwrap();

        let response = server
            .rpc()
            .process_request(request("system.health", None))
            .await;
        assert_eq!(response.error.unwrap().code, -32001);

        let mut authed = request("system.health", None);
        authed.auth_token = Some("api-test-key".to_string());
        let response = server.rpc().process_request(authed).await;
        assert!(response.error.is_none());
        assert_eq!(response.result.unwrap()["status"], "healthy");
    }

    #[tokio::test]
    async fn test_rpc_execute_on_offline_environment() {
        let server = DispatchServer::with_store(seeded_config(), Arc::new(MemoryStore::new()))
            .await
            .unwrap();

        let response = server
            .rpc()
            .process_request(request("suite.execute", Some(json!({ "suite_id": "smoke" }))))
            .await;
        assert_eq!(response.error.unwrap().code, -32003);

        let response = server
            .rpc()
            .process_request(request("suite.execute", Some(json!({ "suite_id": "ghost" }))))
            .await;
        assert_eq!(response.error.unwrap().code, -32005);

        let response = server
            .rpc()
            .process_request(request("suite.execute", None))
            .await;
        assert_eq!(response.error.unwrap().code, -32602);
    }

    #[tokio::test]
    async fn test_rpc_batch_and_listing() {
        let server = DispatchServer::with_store(seeded_config(), Arc::new(MemoryStore::new()))
            .await
            .unwrap();

        let responses = server
            .rpc()
            .process_batch(vec![
                request("environment.list", None),
                request("suite.status", Some(json!({ "suite_id": "smoke" }))),
                request("queue.list", Some(json!({ "environment_id": "env-1" }))),
            ])
            .await;
        assert_eq!(responses.len(), 3);

        let environments = responses[0].result.as_ref().unwrap();
        assert_eq!(environments[0]["id"], "env-1");
        assert_eq!(environments[0]["connected"], false);
        assert!(environments[0].get("token").is_none());

        let status = responses[1].result.as_ref().unwrap();
        assert_eq!(status["suite"]["status"], "idle");
        assert_eq!(status["executions"].as_array().unwrap().len(), 0);

        assert!(responses[2].result.as_ref().unwrap().as_array().unwrap().is_empty());
    }
}
