//! A real agent against a real daemon: suite execution with a results file,
//! ad-hoc commands, workspace requests, cancellation and reconnection.
#![cfg(unix)]

use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use testmesh_agent::{Agent, AgentConfig, ConnectionState, Executor};
use testmesh_daemon::config::{SeedEnvironment, SeedSuite};
use testmesh_daemon::model::SuiteCase;
use testmesh_daemon::{DaemonConfig, DaemonHandle, DispatchServer, RpcRequest};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const TOKEN: &str = "lab-token";
const WAIT: Duration = Duration::from_secs(10);

/// Reports TC-1 through the results file and leaves TC-2 to the exit code.
const SMOKE_COMMAND: &str = r#"echo "hello from $TESTMESH_SUITE_ID"
printf '%s\n' '{"case_code":"TC-1","result":"passed","duration":0.25}' > "$TESTMESH_RESULTS_FILE""#;

fn case(id: &str, code: &str) -> SuiteCase {
    SuiteCase {
        id: id.to_string(),
        code: code.to_string(),
        name: None,
    }
}

fn daemon_config() -> DaemonConfig {
    let mut config = DaemonConfig::default();
    config.server.http_port = 0;
    config.server.agent_port = 0;
    config.server.events_port = 0;
    config.server.reconnect_delay_secs = 0;
    config.metrics.enabled = false;
    config.seed.environments.push(SeedEnvironment {
        id: "lab".to_string(),
        name: None,
        token: TOKEN.to_string(),
        max_concurrent_tasks: None,
        work_dir: None,
    });
    for (id, command) in [("smoke", SMOKE_COMMAND), ("slow", "sleep 30")] {
        config.seed.suites.push(SeedSuite {
            id: id.to_string(),
            name: None,
            plan_id: None,
            environment_id: "lab".to_string(),
            execution_command: command.to_string(),
            cases: vec![case("case-1", "TC-1"), case("case-2", "TC-2")],
            git: None,
        });
    }
    config
}

struct Harness {
    server: DispatchServer,
    daemon: DaemonHandle,
    executor: Arc<Executor>,
    state: tokio::sync::watch::Receiver<ConnectionState>,
    shutdown: CancellationToken,
    agent: JoinHandle<testmesh_agent::AgentResult<()>>,
    _work_dir: TempDir,
}

impl Harness {
    async fn start() -> Self {
        let server = DispatchServer::new(daemon_config()).await.unwrap();
        let daemon = server.start().await.unwrap();

        let work_dir = TempDir::new().unwrap();
        let agent = Agent::new(AgentConfig {
            server_url: format!("ws://{}/agent", daemon.agent_addr),
            token: TOKEN.to_string(),
            work_dir: Some(work_dir.path().to_path_buf()),
            heartbeat_interval_secs: 1,
            ..AgentConfig::default()
        })
        .unwrap();
        let executor = agent.executor();
        let state = agent.connection().subscribe();
        let shutdown = CancellationToken::new();
        let agent = tokio::spawn(agent.run(shutdown.clone()));

        let harness = Harness {
            server,
            daemon,
            executor,
            state,
            shutdown,
            agent,
            _work_dir: work_dir,
        };
        harness.wait_connected().await;
        harness
    }

    async fn wait_connected(&self) {
        let deadline = tokio::time::Instant::now() + WAIT;
        while !self.server.registry().is_connected("lab") {
            assert!(tokio::time::Instant::now() < deadline, "agent never connected");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    async fn rpc(&self, method: &str, params: Value) -> Result<Value, i64> {
        let response = self
            .server
            .rpc()
            .process_request(RpcRequest {
                jsonrpc: "2.0".to_string(),
                method: method.to_string(),
                params: Some(params),
                id: Some(json!(1)),
                auth_token: None,
            })
            .await;
        match response.error {
            Some(error) => Err(error.code),
            None => Ok(response.result.unwrap_or(Value::Null)),
        }
    }

    async fn wait_for_status(&self, execution_id: &str, expected: &str) -> Value {
        let deadline = tokio::time::Instant::now() + WAIT;
        loop {
            let detail = self
                .rpc("task.get", json!({ "execution_id": execution_id }))
                .await
                .unwrap();
            if detail["task"]["status"] == expected {
                return detail;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "execution {} stuck at {}",
                execution_id,
                detail["task"]["status"]
            );
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    async fn stop(self) {
        self.shutdown.cancel();
        tokio::time::timeout(WAIT, self.agent)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        self.daemon.shutdown().await;
    }
}

#[tokio::test]
async fn test_suite_runs_on_real_agent() {
    let harness = Harness::start().await;
    assert_eq!(*harness.state.borrow(), ConnectionState::Connected);

    let response = harness
        .rpc("suite.execute", json!({ "suite_id": "smoke", "requester_id": "alice" }))
        .await
        .unwrap();
    let execution_id = response["execution_id"].as_str().unwrap().to_string();

    let detail = harness.wait_for_status(&execution_id, "completed").await;
    let results = detail["results"].as_array().unwrap();
    assert_eq!(results.len(), 2);
    for result in results {
        assert_eq!(result["outcome"], "passed");
    }
    assert!(detail["log"]["message"]
        .as_str()
        .unwrap()
        .contains("hello from smoke"));

    let status = harness
        .rpc("suite.status", json!({ "suite_id": "smoke" }))
        .await
        .unwrap();
    assert_eq!(status["suite"]["status"], "completed");

    harness.stop().await;
}

#[tokio::test]
async fn test_queued_executions_drain_through_agent() {
    let harness = Harness::start().await;

    let first = harness
        .rpc("suite.execute", json!({ "suite_id": "smoke" }))
        .await
        .unwrap();
    let second = harness
        .rpc("suite.execute", json!({ "suite_id": "smoke" }))
        .await
        .unwrap();
    assert_eq!(second["queued"], true);

    for response in [first, second] {
        let execution_id = response["execution_id"].as_str().unwrap();
        harness.wait_for_status(execution_id, "completed").await;
    }

    harness.stop().await;
}

#[tokio::test]
async fn test_cancel_stops_agent_process() {
    let harness = Harness::start().await;

    let response = harness
        .rpc("suite.execute", json!({ "suite_id": "slow" }))
        .await
        .unwrap();
    let execution_id = response["execution_id"].as_str().unwrap().to_string();

    let deadline = tokio::time::Instant::now() + WAIT;
    while !harness.executor.is_running(&execution_id) {
        assert!(tokio::time::Instant::now() < deadline, "agent never started the suite");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    let cancel = harness
        .rpc(
            "suite.cancel",
            json!({ "suite_id": "slow", "execution_id": execution_id }),
        )
        .await
        .unwrap();
    assert_eq!(cancel["status"], "cancelled");
    assert_eq!(cancel["agent_notified"], true);

    while harness.executor.is_running(&execution_id) {
        assert!(tokio::time::Instant::now() < deadline, "agent kept running");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    // The late completion report does not revive the task.
    tokio::time::sleep(Duration::from_millis(200)).await;
    let detail = harness.wait_for_status(&execution_id, "cancelled").await;
    assert!(detail["results"].as_array().unwrap().is_empty());

    harness.stop().await;
}

#[tokio::test]
async fn test_run_command_and_workspace() {
    let harness = Harness::start().await;

    let result = harness
        .rpc(
            "environment.run_command",
            json!({
                "environment_id": "lab",
                "command": "echo $WHO",
                "timeout_secs": 10,
                "env": { "WHO": "agent" }
            }),
        )
        .await
        .unwrap();
    assert_eq!(result["status"], "success");
    assert_eq!(result["output"], "agent\n");

    harness
        .rpc(
            "workspace.write",
            json!({ "environment_id": "lab", "path": "notes/todo.txt", "content": "ship it" }),
        )
        .await
        .unwrap();
    let read = harness
        .rpc(
            "workspace.read",
            json!({ "environment_id": "lab", "path": "notes/todo.txt" }),
        )
        .await
        .unwrap();
    assert_eq!(read["content"], "ship it");

    let listing = harness
        .rpc("workspace.list", json!({ "environment_id": "lab", "path": "notes" }))
        .await
        .unwrap();
    assert_eq!(listing[0]["name"], "todo.txt");

    // Escapes are refused by the agent and surface as a rejection.
    assert!(harness
        .rpc(
            "workspace.read",
            json!({ "environment_id": "lab", "path": "../../etc/passwd" }),
        )
        .await
        .is_err());

    harness.stop().await;
}

#[tokio::test]
async fn test_agent_reconnects_after_eviction() {
    let mut harness = Harness::start().await;

    harness.state.borrow_and_update();
    let evicted = harness
        .rpc("environment.evict", json!({ "environment_id": "lab" }))
        .await
        .unwrap();
    assert_eq!(evicted["disconnected"], true);

    // The drop is the first state change; then the agent comes back on its own.
    tokio::time::timeout(WAIT, harness.state.changed())
        .await
        .unwrap()
        .unwrap();
    let deadline = tokio::time::Instant::now() + WAIT;
    while *harness.state.borrow_and_update() != ConnectionState::Connected {
        assert!(tokio::time::Instant::now() < deadline, "agent never reconnected");
        let _ = tokio::time::timeout(Duration::from_millis(100), harness.state.changed()).await;
    }
    harness.wait_connected().await;

    let response = harness
        .rpc("suite.execute", json!({ "suite_id": "smoke" }))
        .await
        .unwrap();
    let execution_id = response["execution_id"].as_str().unwrap().to_string();
    harness.wait_for_status(&execution_id, "completed").await;

    harness.stop().await;
}
