/// Typed wrappers over [`PendingRequests`] for ad-hoc commands and the
/// agent's workspace file service.
use crate::broker::PendingRequests;
use crate::errors::{DaemonError, DaemonResult};
use crate::registry::ConnectionRegistry;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use testmesh_core::{
    AgentMessage, FileEntry, ServerMessage, TaskRequest, TaskResultPayload, WorkspaceResponse,
};
use tracing::info;
use uuid::Uuid;

/// Command timeout when the caller gives none.
pub const DEFAULT_COMMAND_TIMEOUT_SECS: u64 = 300;

pub struct AgentClient {
    broker: Arc<PendingRequests>,
    registry: Arc<ConnectionRegistry>,
    request_timeout: Duration,
}

impl AgentClient {
    pub fn new(
        broker: Arc<PendingRequests>,
        registry: Arc<ConnectionRegistry>,
        request_timeout: Duration,
    ) -> Self {
        Self {
            broker,
            registry,
            request_timeout,
        }
    }

    fn ensure_connected(&self, environment_id: &str) -> DaemonResult<()> {
        if self.registry.is_connected(environment_id) {
            Ok(())
        } else {
            Err(DaemonError::EnvironmentOffline(environment_id.to_string()))
        }
    }

    /// Run a shell command on the agent and wait for its outcome.
    pub async fn run_command(
        &self,
        environment_id: &str,
        command: &str,
        timeout_secs: Option<u64>,
        working_dir: Option<String>,
        env: HashMap<String, String>,
    ) -> DaemonResult<TaskResultPayload> {
        self.ensure_connected(environment_id)?;

        let task_id = Uuid::new_v4().to_string();
        let timeout_secs = timeout_secs.unwrap_or(DEFAULT_COMMAND_TIMEOUT_SECS);
        let message = ServerMessage::ExecuteTask(TaskRequest {
            task_id: task_id.clone(),
            command: command.to_string(),
            timeout: Some(timeout_secs),
            working_dir,
            env,
        });

        info!(environment_id, task_id = %task_id, "Running ad-hoc command");
        // The agent needs the full command timeout plus its grace period.
        let wait = Duration::from_secs(timeout_secs) + self.request_timeout;
        match self
            .broker
            .request(environment_id, &task_id, message, wait)
            .await?
        {
            AgentMessage::TaskResult(result) => Ok(result),
            other => Err(unexpected(other)),
        }
    }

    pub async fn list_files(&self, environment_id: &str, path: &str) -> DaemonResult<Vec<FileEntry>> {
        let response = self
            .workspace(environment_id, |request_id| ServerMessage::ListFiles {
                request_id,
                path: path.to_string(),
            })
            .await?;
        Ok(response.entries)
    }

    pub async fn read_file(&self, environment_id: &str, path: &str) -> DaemonResult<String> {
        let response = self
            .workspace(environment_id, |request_id| ServerMessage::ReadFile {
                request_id,
                path: path.to_string(),
            })
            .await?;
        Ok(response.content.unwrap_or_default())
    }

    pub async fn write_file(
        &self,
        environment_id: &str,
        path: &str,
        content: &str,
    ) -> DaemonResult<()> {
        self.workspace(environment_id, |request_id| ServerMessage::WriteFile {
            request_id,
            path: path.to_string(),
            content: content.to_string(),
        })
        .await
        .map(|_| ())
    }

    pub async fn delete_file(&self, environment_id: &str, path: &str) -> DaemonResult<()> {
        self.workspace(environment_id, |request_id| ServerMessage::DeleteFile {
            request_id,
            path: path.to_string(),
        })
        .await
        .map(|_| ())
    }

    pub async fn make_dir(&self, environment_id: &str, path: &str) -> DaemonResult<()> {
        self.workspace(environment_id, |request_id| ServerMessage::MakeDir {
            request_id,
            path: path.to_string(),
        })
        .await
        .map(|_| ())
    }

    async fn workspace<F>(&self, environment_id: &str, build: F) -> DaemonResult<WorkspaceResponse>
    where
        F: FnOnce(String) -> ServerMessage,
    {
        self.ensure_connected(environment_id)?;

        let request_id = Uuid::new_v4().to_string();
        let message = build(request_id.clone());
        let reply = self
            .broker
            .request(environment_id, &request_id, message, self.request_timeout)
            .await?;

        let response = match reply {
            AgentMessage::ListFilesResponse(r)
            | AgentMessage::ReadFileResponse(r)
            | AgentMessage::WriteFileResponse(r)
            | AgentMessage::DeleteFileResponse(r)
            | AgentMessage::MakeDirResponse(r) => r,
            other => return Err(unexpected(other)),
        };

        if response.success {
            Ok(response)
        } else {
            Err(DaemonError::AgentRejected(
                response
                    .error
                    .unwrap_or_else(|| "workspace operation failed".to_string()),
            ))
        }
    }
}

fn unexpected(message: AgentMessage) -> DaemonError {
    DaemonError::ServerError(format!(
        "unexpected reply type {}",
        message.message_type()
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::tests::RecordingLink;
    use crate::registry::ConnectionHandle;

    struct Harness {
        link: Arc<RecordingLink>,
        broker: Arc<PendingRequests>,
        client: Arc<AgentClient>,
    }

    fn harness() -> Harness {
        let link = Arc::new(RecordingLink::default());
        let registry = Arc::new(ConnectionRegistry::new());
        registry.register(Arc::new(ConnectionHandle::new("c1", "env-1", link.clone())));
        let broker = Arc::new(PendingRequests::new(registry.clone()));
        let client = Arc::new(AgentClient::new(
            broker.clone(),
            registry,
            Duration::from_secs(5),
        ));
        Harness {
            link,
            broker,
            client,
        }
    }

    /// Wait for the outbound message at index `seen`.
    async fn next_request(link: &RecordingLink, seen: usize) -> serde_json::Value {
        loop {
            if let Some(text) = link.sent.lock().get(seen) {
                return serde_json::from_str(text).unwrap();
            }
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_offline_environment() {
        let h = harness();
        assert!(matches!(
            h.client.list_files("env-2", ".").await,
            Err(DaemonError::EnvironmentOffline(_))
        ));
    }

    #[tokio::test]
    async fn test_read_file_round_trip() {
        let h = harness();
        let call = {
            let client = h.client.clone();
            tokio::spawn(async move { client.read_file("env-1", "notes.txt").await })
        };

        let request = next_request(&h.link, 0).await;
        assert_eq!(request["type"], "read_file");
        assert_eq!(request["path"], "notes.txt");
        let request_id = request["request_id"].as_str().unwrap().to_string();

        let mut response = WorkspaceResponse::ok(request_id);
        response.content = Some("hello".to_string());
        assert!(h.broker.resolve(AgentMessage::ReadFileResponse(response)));

        assert_eq!(call.await.unwrap().unwrap(), "hello");
    }

    #[tokio::test]
    async fn test_agent_rejection_surfaces() {
        let h = harness();
        let call = {
            let client = h.client.clone();
            tokio::spawn(async move { client.delete_file("env-1", "../etc/passwd").await })
        };

        let request = next_request(&h.link, 0).await;
        let request_id = request["request_id"].as_str().unwrap().to_string();
        h.broker.resolve(AgentMessage::DeleteFileResponse(WorkspaceResponse::failed(
            request_id,
            "path escapes work dir",
        )));

        match call.await.unwrap() {
            Err(DaemonError::AgentRejected(reason)) => assert!(reason.contains("escapes")),
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_run_command_returns_result() {
        let h = harness();
        let call = {
            let client = h.client.clone();
            tokio::spawn(async move {
                client
                    .run_command("env-1", "echo hi", Some(10), None, HashMap::new())
                    .await
            })
        };

        let request = next_request(&h.link, 0).await;
        assert_eq!(request["type"], "execute_task");
        assert_eq!(request["timeout"], 10);
        let task_id = request["task_id"].as_str().unwrap().to_string();

        h.broker.resolve(AgentMessage::TaskResult(TaskResultPayload {
            task_id,
            status: testmesh_core::RunStatus::Success,
            exit_code: Some(0),
            output: "hi\n".to_string(),
            error: None,
            duration_ms: 12,
        }));

        let result = call.await.unwrap().unwrap();
        assert_eq!(result.output, "hi\n");
        assert_eq!(result.exit_code, Some(0));
    }
}
