/// Live agent connections, keyed by environment id.
///
/// At most one connection is registered per environment. A newer connection
/// replaces the older one; the caller decides what to do with the handle that
/// was displaced. Transport failures detected while sending remove the
/// connection so callers never see a half-dead entry twice.
use crate::errors::DaemonResult;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use testmesh_core::ServerMessage;
use tracing::{debug, warn};

/// Outbound half of an agent connection.
#[async_trait]
pub trait AgentLink: Send + Sync {
    async fn send_text(&self, text: String) -> DaemonResult<()>;
    async fn close(&self, reason: &str) -> DaemonResult<()>;
}

/// One registered agent connection.
pub struct ConnectionHandle {
    pub connection_id: String,
    pub environment_id: String,
    pub connected_at: DateTime<Utc>,
    link: Arc<dyn AgentLink>,
    capabilities: RwLock<Vec<String>>,
    /// Set once the daemon has decided to drop this connection.
    closing: AtomicBool,
}

impl ConnectionHandle {
    pub fn new(
        connection_id: impl Into<String>,
        environment_id: impl Into<String>,
        link: Arc<dyn AgentLink>,
    ) -> Self {
        Self {
            connection_id: connection_id.into(),
            environment_id: environment_id.into(),
            connected_at: Utc::now(),
            link,
            capabilities: RwLock::new(Vec::new()),
            closing: AtomicBool::new(false),
        }
    }

    pub fn set_capabilities(&self, capabilities: Vec<String>) {
        *self.capabilities.write() = capabilities;
    }

    pub fn has_capability(&self, capability: &str) -> bool {
        self.capabilities.read().iter().any(|c| c == capability)
    }

    /// True after an eviction, a rejected re-auth or being superseded.
    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }

    /// Serialize and send. False if the message could not be encoded or the
    /// transport rejected it.
    pub async fn send(&self, message: &ServerMessage) -> bool {
        match self.encode(message) {
            Some(text) => self.send_text(text).await,
            None => false,
        }
    }

    fn encode(&self, message: &ServerMessage) -> Option<String> {
        match message.to_json() {
            Ok(text) => Some(text),
            Err(e) => {
                warn!(
                    environment_id = %self.environment_id,
                    message_type = message.message_type(),
                    "Failed to encode message: {}",
                    e
                );
                None
            }
        }
    }

    async fn send_text(&self, text: String) -> bool {
        match self.link.send_text(text).await {
            Ok(()) => true,
            Err(e) => {
                warn!(
                    environment_id = %self.environment_id,
                    connection_id = %self.connection_id,
                    "Send failed: {}",
                    e
                );
                false
            }
        }
    }

    pub async fn close(&self, reason: &str) {
        if let Err(e) = self.link.close(reason).await {
            debug!(connection_id = %self.connection_id, "Close failed: {}", e);
        }
    }
}

/// Map of environment id to its live connection.
#[derive(Default)]
pub struct ConnectionRegistry {
    connections: RwLock<HashMap<String, Arc<ConnectionHandle>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handle`, returning the connection it replaced.
    pub fn register(&self, handle: Arc<ConnectionHandle>) -> Option<Arc<ConnectionHandle>> {
        let previous = self
            .connections
            .write()
            .insert(handle.environment_id.clone(), handle.clone());
        debug!(
            environment_id = %handle.environment_id,
            connection_id = %handle.connection_id,
            replaced = previous.is_some(),
            "Connection registered"
        );
        previous
    }

    pub fn unregister(&self, environment_id: &str) -> Option<Arc<ConnectionHandle>> {
        self.connections.write().remove(environment_id)
    }

    /// Remove the entry only if it is still `connection_id`. A superseded
    /// connection shutting down must not evict its replacement.
    pub fn unregister_connection(&self, environment_id: &str, connection_id: &str) -> bool {
        let mut connections = self.connections.write();
        match connections.get(environment_id) {
            Some(current) if current.connection_id == connection_id => {
                connections.remove(environment_id);
                true
            }
            _ => false,
        }
    }

    pub fn get(&self, environment_id: &str) -> Option<Arc<ConnectionHandle>> {
        self.connections.read().get(environment_id).cloned()
    }

    pub fn is_connected(&self, environment_id: &str) -> bool {
        self.connections.read().contains_key(environment_id)
    }

    pub fn connected_environments(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.connections.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.connections.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.read().is_empty()
    }

    /// Send to the environment's connection. False if nothing is registered
    /// or the send failed; a transport failure also unregisters it.
    pub async fn send(&self, environment_id: &str, message: &ServerMessage) -> bool {
        let Some(handle) = self.get(environment_id) else {
            debug!(
                environment_id,
                message_type = message.message_type(),
                "No connection registered"
            );
            return false;
        };

        // Encoding problems say nothing about the transport.
        let Some(text) = handle.encode(message) else {
            return false;
        };
        if handle.send_text(text).await {
            return true;
        }
        self.unregister_connection(environment_id, &handle.connection_id);
        false
    }

    /// Send to every connection; returns how many accepted the message.
    pub async fn broadcast(&self, message: &ServerMessage) -> usize {
        let handles: Vec<Arc<ConnectionHandle>> =
            self.connections.read().values().cloned().collect();

        let mut delivered = 0;
        for handle in handles {
            if handle.send(message).await {
                delivered += 1;
            } else {
                self.unregister_connection(&handle.environment_id, &handle.connection_id);
            }
        }
        delivered
    }

    /// Tell a displaced connection why it is going away, then close it.
    pub async fn notify_and_close(&self, handle: &ConnectionHandle, reason: &str) {
        handle.closing.store(true, Ordering::SeqCst);
        let notice = ServerMessage::TokenInvalid {
            reason: reason.to_string(),
        };
        let _ = handle.send(&notice).await;
        handle.close(reason).await;
    }

    /// Force-disconnect the environment's agent. Returns whether a connection
    /// was registered.
    pub async fn evict_with_notice(&self, environment_id: &str, reason: &str) -> bool {
        let Some(handle) = self.unregister(environment_id) else {
            return false;
        };
        self.notify_and_close(&handle, reason).await;
        debug!(environment_id, reason, "Connection evicted");
        true
    }
}
