/// Agent-facing WebSocket gateway.
///
/// Each accepted socket is authenticated from its handshake credential,
/// registered as the environment's connection and then serviced by one
/// receive loop, so messages from one agent are handled strictly in order.
use crate::broker::PendingRequests;
use crate::dispatch::SuiteDispatcher;
use crate::errors::{DaemonError, DaemonResult};
use crate::events::{DispatchEvent, EventBus};
use crate::metrics::MetricsCollector;
use crate::model::Environment;
use crate::registry::{AgentLink, ConnectionHandle, ConnectionRegistry};
use crate::store::DispatchStore;
use crate::types::EvictResponse;
use async_trait::async_trait;
use chrono::Utc;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::{Duration, Instant};
use testmesh_core::{
    decode_agent_message, AgentMessage, AuthPayload, ServerMessage, WelcomePayload,
    PROTOCOL_VERSION,
};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{accept_hdr_async, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Upper bound on a single outbound frame write.
const SEND_TIMEOUT: Duration = Duration::from_secs(10);

pub const REASON_SUPERSEDED: &str = "superseded by a newer connection";

type WsSink = SplitSink<WebSocketStream<TcpStream>, WsMessage>;
type WsSource = SplitStream<WebSocketStream<TcpStream>>;

/// [`AgentLink`] over the write half of a WebSocket.
pub struct WsLink {
    sink: Mutex<WsSink>,
}

impl WsLink {
    pub fn new(sink: WsSink) -> Self {
        Self {
            sink: Mutex::new(sink),
        }
    }
}

#[async_trait]
impl AgentLink for WsLink {
    async fn send_text(&self, text: String) -> DaemonResult<()> {
        let mut sink = self.sink.lock().await;
        match tokio::time::timeout(SEND_TIMEOUT, sink.send(WsMessage::Text(text))).await {
            Ok(result) => result.map_err(DaemonError::from),
            Err(_) => Err(DaemonError::Timeout),
        }
    }

    async fn close(&self, reason: &str) -> DaemonResult<()> {
        let frame = CloseFrame {
            code: CloseCode::Policy,
            reason: reason.to_string().into(),
        };
        let mut sink = self.sink.lock().await;
        match tokio::time::timeout(SEND_TIMEOUT, sink.send(WsMessage::Close(Some(frame)))).await {
            Ok(result) => result.map_err(DaemonError::from),
            Err(_) => Err(DaemonError::Timeout),
        }
    }
}

/// Connection settings handed to the gateway.
#[derive(Debug, Clone)]
pub struct GatewaySettings {
    pub ping_interval: Duration,
    pub liveness_timeout: Duration,
    pub reconnect_delay_secs: u64,
    pub default_work_dir: Option<String>,
}

pub struct AgentGateway {
    store: Arc<dyn DispatchStore>,
    registry: Arc<ConnectionRegistry>,
    dispatcher: Arc<SuiteDispatcher>,
    broker: Arc<PendingRequests>,
    events: Arc<EventBus>,
    metrics: Arc<MetricsCollector>,
    settings: GatewaySettings,
}

/// Credential from `Authorization: Bearer` or the `token` query parameter.
pub fn extract_token(request: &Request) -> Option<String> {
    if let Some(value) = request.headers().get(AUTHORIZATION) {
        if let Ok(value) = value.to_str() {
            if let Some(token) = value.strip_prefix("Bearer ") {
                return Some(token.trim().to_string());
            }
        }
    }

    request.uri().query().and_then(|query| {
        query.split('&').find_map(|pair| {
            let (key, value) = pair.split_once('=')?;
            (key == "token" && !value.is_empty()).then(|| value.to_string())
        })
    })
}

impl AgentGateway {
    pub fn new(
        store: Arc<dyn DispatchStore>,
        registry: Arc<ConnectionRegistry>,
        dispatcher: Arc<SuiteDispatcher>,
        broker: Arc<PendingRequests>,
        events: Arc<EventBus>,
        metrics: Arc<MetricsCollector>,
        settings: GatewaySettings,
    ) -> Self {
        Self {
            store,
            registry,
            dispatcher,
            broker,
            events,
            metrics,
            settings,
        }
    }

    /// Accept agent connections until `shutdown` fires.
    pub async fn serve(self: Arc<Self>, listener: TcpListener, shutdown: CancellationToken) {
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            debug!(%peer, "Agent socket accepted");
                            let gateway = self.clone();
                            let shutdown = shutdown.clone();
                            tokio::spawn(async move {
                                if let Err(e) = gateway.handle_connection(stream, shutdown).await {
                                    warn!(%peer, "Agent connection ended with error: {}", e);
                                }
                            });
                        }
                        Err(e) => error!("Failed to accept agent connection: {}", e),
                    }
                }
                _ = shutdown.cancelled() => {
                    info!("Agent gateway stopped");
                    break;
                }
            }
        }
    }

    pub async fn handle_connection(
        &self,
        stream: TcpStream,
        shutdown: CancellationToken,
    ) -> DaemonResult<()> {
        let mut presented: Option<String> = None;
        let callback = |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
            presented = extract_token(request);
            Ok(response)
        };
        let ws = accept_hdr_async(stream, callback).await?;
        let (sink, mut source) = ws.split();
        let link: Arc<dyn AgentLink> = Arc::new(WsLink::new(sink));

        let environment = match &presented {
            Some(token) => self.store.find_environment_by_token(token).await?,
            None => None,
        };
        let Some(environment) = environment else {
            let reason = if presented.is_some() {
                "invalid credential"
            } else {
                "missing credential"
            };
            warn!(reason, "Rejected agent connection");
            self.metrics.record_agent_rejected();
            let notice = ServerMessage::TokenInvalid {
                reason: reason.to_string(),
            };
            let _ = link.send_text(notice.to_json()?).await;
            let _ = link.close(reason).await;
            return Ok(());
        };

        let handle = Arc::new(ConnectionHandle::new(
            Uuid::new_v4().to_string(),
            environment.id.clone(),
            link,
        ));
        if let Some(previous) = self.registry.register(handle.clone()) {
            info!(
                environment_id = %environment.id,
                previous = %previous.connection_id,
                "Replacing existing agent connection"
            );
            self.registry
                .notify_and_close(&previous, REASON_SUPERSEDED)
                .await;
        }
        self.metrics.record_agent_connected();
        info!(
            environment_id = %environment.id,
            connection_id = %handle.connection_id,
            "Agent connected"
        );

        handle
            .send(&ServerMessage::Welcome(self.welcome(&environment)))
            .await;
        self.events
            .publish(DispatchEvent::environment_online(&environment.id));
        if let Err(e) = self.dispatcher.on_agent_connected(&environment.id).await {
            error!(environment_id = %environment.id, "Queue drain on connect failed: {}", e);
        }

        let reason = self.receive_loop(&handle, &mut source, &shutdown).await;
        self.metrics.record_agent_disconnected();
        info!(
            environment_id = %environment.id,
            connection_id = %handle.connection_id,
            reason = %reason,
            "Agent disconnected"
        );

        // Evictions and replacements are reconciled by whoever closed us.
        if handle.is_closing() {
            return Ok(());
        }
        self.registry
            .unregister_connection(&environment.id, &handle.connection_id);
        if !self.registry.is_connected(&environment.id) {
            self.connection_lost(&environment.id, &reason).await;
        }
        Ok(())
    }

    async fn receive_loop(
        &self,
        handle: &Arc<ConnectionHandle>,
        source: &mut WsSource,
        shutdown: &CancellationToken,
    ) -> String {
        let mut last_seen = Instant::now();
        let mut ping = tokio::time::interval(self.settings.ping_interval);
        ping.tick().await;

        loop {
            tokio::select! {
                frame = source.next() => {
                    match frame {
                        Some(Ok(WsMessage::Text(text))) => {
                            last_seen = Instant::now();
                            self.route(handle, &text).await;
                        }
                        Some(Ok(WsMessage::Ping(_))) | Some(Ok(WsMessage::Pong(_))) => {
                            last_seen = Instant::now();
                        }
                        Some(Ok(WsMessage::Binary(_))) => {
                            last_seen = Instant::now();
                            warn!(environment_id = %handle.environment_id, "Ignoring binary frame");
                        }
                        Some(Ok(WsMessage::Close(_))) => return "closed by agent".to_string(),
                        Some(Ok(WsMessage::Frame(_))) => {}
                        Some(Err(e)) => return format!("transport error: {}", e),
                        None => return "connection closed".to_string(),
                    }
                }
                _ = ping.tick() => {
                    if last_seen.elapsed() > self.settings.liveness_timeout {
                        handle.close("liveness timeout").await;
                        return "liveness timeout".to_string();
                    }
                    let ping = ServerMessage::Ping { timestamp: Utc::now() };
                    if !handle.send(&ping).await {
                        return "ping failed".to_string();
                    }
                }
                _ = shutdown.cancelled() => {
                    handle.close("daemon shutting down").await;
                    return "daemon shutting down".to_string();
                }
            }
        }
    }

    /// Handle one inbound text frame. Never fails the connection.
    async fn route(&self, handle: &Arc<ConnectionHandle>, text: &str) {
        let message = match decode_agent_message(text) {
            Ok(message) => message,
            Err(e) => {
                warn!(environment_id = %handle.environment_id, "Discarding agent message: {}", e);
                return;
            }
        };

        let environment_id = handle.environment_id.as_str();
        let message_type = message.message_type();
        debug!(environment_id, message_type, "Agent message");

        let result = match message {
            AgentMessage::Auth(auth) => self.on_auth(handle, auth).await,
            AgentMessage::Heartbeat(snapshot) => {
                let recorded = self.store.record_heartbeat(environment_id, &snapshot).await;
                self.events.publish(DispatchEvent::AgentHeartbeat {
                    environment_id: environment_id.to_string(),
                    snapshot,
                });
                handle
                    .send(&ServerMessage::HeartbeatAck {
                        timestamp: Utc::now(),
                    })
                    .await;
                recorded
            }
            AgentMessage::Pong { .. } => Ok(()),
            AgentMessage::TestSuiteResult(report) => {
                self.dispatcher.on_suite_result(environment_id, report).await
            }
            AgentMessage::TestSuiteLog(chunk) => {
                self.dispatcher.on_suite_log(environment_id, chunk).await
            }
            AgentMessage::TestSuiteCompleted(completion) => {
                self.dispatcher
                    .on_suite_completed(environment_id, completion)
                    .await
            }
            AgentMessage::CancelAck(ack) => {
                info!(
                    environment_id,
                    target_id = %ack.target_id,
                    running = ack.running,
                    "{}",
                    ack.message
                );
                Ok(())
            }
            reply => {
                if !self.broker.resolve(reply) {
                    debug!(environment_id, message_type, "Unsolicited reply dropped");
                }
                Ok(())
            }
        };

        if let Err(e) = result {
            error!(environment_id, message_type, "Agent message handler failed: {}", e);
        }
    }

    async fn on_auth(&self, handle: &Arc<ConnectionHandle>, auth: AuthPayload) -> DaemonResult<()> {
        let environment = self
            .store
            .get_environment(&handle.environment_id)
            .await?
            .ok_or_else(|| DaemonError::EnvironmentNotFound(handle.environment_id.clone()))?;

        if auth.token != environment.token {
            warn!(
                environment_id = %environment.id,
                "Auth message carries a different credential, disconnecting"
            );
            self.metrics.record_agent_rejected();
            self.registry
                .unregister_connection(&environment.id, &handle.connection_id);
            self.registry
                .notify_and_close(handle, "credential mismatch")
                .await;
            if !self.registry.is_connected(&environment.id) {
                self.connection_lost(&environment.id, "credential mismatch")
                    .await;
            }
            return Ok(());
        }

        handle.set_capabilities(auth.capabilities.clone());
        info!(
            environment_id = %environment.id,
            os = %auth.platform.os,
            hostname = ?auth.platform.hostname,
            agent_version = ?auth.platform.agent_version,
            capabilities = ?auth.capabilities,
            running = auth.running_executions.len(),
            "Agent authenticated"
        );
        handle
            .send(&ServerMessage::AuthSuccess(self.welcome(&environment)))
            .await;
        self.dispatcher
            .on_agent_authenticated(
                &environment.id,
                &handle.connection_id,
                &auth.running_executions,
            )
            .await?;
        Ok(())
    }

    /// Force an environment's agent off, optionally rotating its credential
    /// first so it cannot come straight back with the old one.
    pub async fn evict(
        &self,
        environment_id: &str,
        reason: &str,
        new_token: Option<&str>,
    ) -> DaemonResult<EvictResponse> {
        if self.store.get_environment(environment_id).await?.is_none() {
            return Err(DaemonError::EnvironmentNotFound(environment_id.to_string()));
        }
        if let Some(token) = new_token {
            self.store.set_environment_token(environment_id, token).await?;
        }

        let disconnected = self.registry.evict_with_notice(environment_id, reason).await;
        if disconnected {
            self.connection_lost(environment_id, reason).await;
        }
        info!(environment_id, reason, disconnected, "Environment evicted");

        Ok(EvictResponse {
            environment_id: environment_id.to_string(),
            disconnected,
            token_rotated: new_token.is_some(),
        })
    }

    async fn connection_lost(&self, environment_id: &str, reason: &str) {
        if let Err(e) = self
            .dispatcher
            .on_agent_disconnected(environment_id, reason)
            .await
        {
            error!(environment_id, "Disconnect reconciliation failed: {}", e);
        }
        self.events
            .publish(DispatchEvent::environment_offline(environment_id, reason));
    }

    fn welcome(&self, environment: &Environment) -> WelcomePayload {
        WelcomePayload {
            environment_id: environment.id.clone(),
            work_dir: environment
                .work_dir
                .clone()
                .or_else(|| self.settings.default_work_dir.clone()),
            reconnect_delay: self.settings.reconnect_delay_secs,
            protocol_version: Some(PROTOCOL_VERSION.to_string()),
            server_version: Some(crate::VERSION.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(uri: &str, auth: Option<&str>) -> Request {
        let mut builder = Request::builder().uri(uri);
        if let Some(auth) = auth {
            builder = builder.header(AUTHORIZATION, auth);
        }
        builder.body(()).unwrap()
    }

    #[test]
    fn test_token_from_bearer_header() {
        let req = request("/agent", Some("Bearer abc123"));
        assert_eq!(extract_token(&req).as_deref(), Some("abc123"));
    }

    #[test]
    fn test_token_from_query() {
        let req = request("/agent?version=1&token=xyz", None);
        assert_eq!(extract_token(&req).as_deref(), Some("xyz"));
    }

    #[test]
    fn test_missing_token() {
        assert!(extract_token(&request("/agent", None)).is_none());
        assert!(extract_token(&request("/agent?token=", None)).is_none());
        assert!(extract_token(&request("/agent", Some("Basic Zm9v"))).is_none());
    }
}
