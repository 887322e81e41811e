/// Request/response correlation for daemon-initiated agent calls.
///
/// Ad-hoc commands and workspace file operations are answered by a message
/// carrying the same request id. The map lives on the daemon, so every test
/// gets its own.
use crate::errors::{DaemonError, DaemonResult};
use crate::registry::ConnectionRegistry;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use testmesh_core::{AgentMessage, ServerMessage};
use tokio::sync::oneshot;
use tracing::{debug, warn};

pub struct PendingRequests {
    registry: Arc<ConnectionRegistry>,
    waiting: DashMap<String, oneshot::Sender<AgentMessage>>,
}

/// Removes the waiter however `request` exits.
struct WaiterGuard<'a> {
    waiting: &'a DashMap<String, oneshot::Sender<AgentMessage>>,
    request_id: &'a str,
}

impl Drop for WaiterGuard<'_> {
    fn drop(&mut self) {
        self.waiting.remove(self.request_id);
    }
}

impl PendingRequests {
    pub fn new(registry: Arc<ConnectionRegistry>) -> Self {
        Self {
            registry,
            waiting: DashMap::new(),
        }
    }

    /// Send `message` and wait for the reply correlated by `request_id`.
    pub async fn request(
        &self,
        environment_id: &str,
        request_id: &str,
        message: ServerMessage,
        timeout: Duration,
    ) -> DaemonResult<AgentMessage> {
        let (tx, rx) = oneshot::channel();
        if self.waiting.insert(request_id.to_string(), tx).is_some() {
            warn!(request_id, "Replaced an outstanding request with the same id");
        }
        let _guard = WaiterGuard {
            waiting: &self.waiting,
            request_id,
        };

        if !self.registry.send(environment_id, &message).await {
            return Err(DaemonError::AgentUnreachable(environment_id.to_string()));
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(DaemonError::ConnectionError(format!(
                "request {} abandoned",
                request_id
            ))),
            Err(_) => {
                debug!(request_id, environment_id, "Agent request timed out");
                Err(DaemonError::Timeout)
            }
        }
    }

    /// Hand a reply to its waiter. False if nobody is waiting for it.
    pub fn resolve(&self, message: AgentMessage) -> bool {
        let Some(request_id) = message.request_id().map(str::to_string) else {
            return false;
        };
        match self.waiting.remove(&request_id) {
            Some((_, tx)) => tx.send(message).is_ok(),
            None => {
                debug!(request_id = %request_id, "Reply for unknown or expired request");
                false
            }
        }
    }

    pub fn outstanding(&self) -> usize {
        self.waiting.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::tests::RecordingLink;
    use crate::registry::ConnectionHandle;
    use testmesh_core::WorkspaceResponse;

    fn broker_with_agent(link: Arc<RecordingLink>) -> Arc<PendingRequests> {
        let registry = Arc::new(ConnectionRegistry::new());
        registry.register(Arc::new(ConnectionHandle::new("c1", "env-1", link)));
        Arc::new(PendingRequests::new(registry))
    }

    fn list(request_id: &str) -> ServerMessage {
        ServerMessage::ListFiles {
            request_id: request_id.to_string(),
            path: ".".to_string(),
        }
    }

    #[tokio::test]
    async fn test_reply_is_routed_to_waiter() {
        let link = Arc::new(RecordingLink::default());
        let broker = broker_with_agent(link.clone());

        let waiter = {
            let broker = broker.clone();
            tokio::spawn(async move {
                broker
                    .request("env-1", "req-1", list("req-1"), Duration::from_secs(5))
                    .await
            })
        };

        while link.sent.lock().is_empty() {
            tokio::task::yield_now().await;
        }
        assert!(broker.resolve(AgentMessage::ListFilesResponse(WorkspaceResponse::ok(
            "req-1"
        ))));

        let reply = waiter.await.unwrap().unwrap();
        assert_eq!(reply.request_id(), Some("req-1"));
        assert_eq!(broker.outstanding(), 0);
    }

    #[tokio::test]
    async fn test_timeout_clears_entry() {
        let broker = broker_with_agent(Arc::new(RecordingLink::default()));
        let result = broker
            .request("env-1", "req-2", list("req-2"), Duration::from_millis(50))
            .await;
        assert!(matches!(result, Err(DaemonError::Timeout)));
        assert_eq!(broker.outstanding(), 0);
    }

    #[tokio::test]
    async fn test_unreachable_agent() {
        let broker = broker_with_agent(Arc::new(RecordingLink::failing()));
        let result = broker
            .request("env-1", "req-3", list("req-3"), Duration::from_secs(1))
            .await;
        assert!(matches!(result, Err(DaemonError::AgentUnreachable(_))));
        assert_eq!(broker.outstanding(), 0);
    }

    #[test]
    fn test_unsolicited_reply_ignored() {
        let broker = broker_with_agent(Arc::new(RecordingLink::default()));
        assert!(!broker.resolve(AgentMessage::ReadFileResponse(WorkspaceResponse::ok("nope"))));
    }
}
