/// Persistent connection from the agent to the daemon
///
/// One logical connection with automatic reconnection: the agent opens the
/// WebSocket with its bearer credential, sends `auth`, and from then on
/// heartbeats, answers pings, runs what the daemon asks for and drains the
/// outbox. After a drop it waits the daemon-provided delay, then retries
/// with exponential backoff until it gets back in.
///
/// A message whose write fails is held and sent first in the next session,
/// and `auth` lists every execution still running or not yet reported so
/// the daemon can tell which of its running executions are really gone.
use crate::backoff::Backoff;
use crate::config::AgentConfig;
use crate::errors::{AgentError, AgentResult};
use crate::executor::Executor;
use crate::outbox::{Outbox, OutboxReceiver};
use crate::workspace::{WorkDir, WorkspaceService};
use chrono::Utc;
use futures::{Sink, SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use testmesh_core::{
    decode_server_message, AgentMessage, AuthPayload, PlatformInfo, ProtocolError, ServerMessage,
    SystemSnapshot, TelemetryCollector, WelcomePayload, CAPABILITY_SUITE_COMPLETED,
};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Error as WsError;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Handshaking,
    Connected,
}

/// Why a session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
enum SessionEnd {
    Shutdown,
    Lost(String),
}

type DisconnectCallback = Box<dyn Fn(&str) + Send + Sync>;

pub struct AgentConnection {
    config: AgentConfig,
    executor: Arc<Executor>,
    workspace: Arc<WorkspaceService>,
    work_dir: WorkDir,
    outbox: Outbox,
    state: watch::Sender<ConnectionState>,
    /// Seconds to wait after a disconnect; the daemon may change it.
    reconnect_delay_secs: AtomicU64,
    environment_id: RwLock<Option<String>>,
    /// Outbound message whose write failed; goes out first next session.
    held: Mutex<Option<AgentMessage>>,
    on_disconnect: Option<DisconnectCallback>,
}

impl AgentConnection {
    pub fn new(
        config: AgentConfig,
        executor: Arc<Executor>,
        workspace: Arc<WorkspaceService>,
        work_dir: WorkDir,
        outbox: Outbox,
    ) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let reconnect_delay_secs = AtomicU64::new(config.reconnect.server_delay_secs);
        Self {
            config,
            executor,
            workspace,
            work_dir,
            outbox,
            state,
            reconnect_delay_secs,
            environment_id: RwLock::new(None),
            held: Mutex::new(None),
            on_disconnect: None,
        }
    }

    /// Called with the reason every time an established session ends.
    pub fn with_disconnect_callback<F>(mut self, callback: F) -> Self
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.on_disconnect = Some(Box::new(callback));
        self
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Identity the daemon resolved our credential to.
    pub fn environment_id(&self) -> Option<String> {
        self.environment_id.read().clone()
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.reconnect_delay_secs.load(Ordering::Relaxed))
    }

    fn set_state(&self, state: ConnectionState) {
        self.state.send_replace(state);
    }

    /// Keep a session up until `shutdown` fires.
    pub async fn run(
        &self,
        mut outbox_rx: OutboxReceiver,
        shutdown: CancellationToken,
    ) -> AgentResult<()> {
        let mut backoff = Backoff::new(
            Duration::from_secs(self.config.reconnect.initial_delay_secs),
            Duration::from_secs(self.config.reconnect.max_delay_secs),
        );

        loop {
            self.set_state(ConnectionState::Connecting);
            let attempt = tokio::select! {
                _ = shutdown.cancelled() => break,
                attempt = self.connect() => attempt,
            };

            let delay = match attempt {
                Ok(ws) => {
                    backoff.reset();
                    let end = self.session(ws, &mut outbox_rx, &shutdown).await;
                    self.set_state(ConnectionState::Disconnected);
                    match end {
                        SessionEnd::Shutdown => break,
                        SessionEnd::Lost(reason) => {
                            if let Some(callback) = &self.on_disconnect {
                                callback(&reason);
                            }
                            let delay = self.reconnect_delay();
                            info!(reason = %reason, "Disconnected from daemon, reconnecting in {:?}", delay);
                            delay
                        }
                    }
                }
                Err(e) => {
                    self.set_state(ConnectionState::Disconnected);
                    let delay = backoff.next_delay();
                    warn!("Connection to {} failed: {}, retrying in {:?}", self.config.server_url, e, delay);
                    delay
                }
            };

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        self.set_state(ConnectionState::Disconnected);
        info!("Agent connection stopped");
        Ok(())
    }

    async fn connect(&self) -> AgentResult<WsStream> {
        let mut request = self.config.server_url.as_str().into_client_request()?;
        let bearer = HeaderValue::from_str(&format!("Bearer {}", self.config.token))
            .map_err(|e| AgentError::ConfigError(format!("token is not a valid header: {}", e)))?;
        request.headers_mut().insert(AUTHORIZATION, bearer);

        debug!("Connecting to {}", self.config.server_url);
        let (ws, _) = tokio::time::timeout(self.config.connect_timeout(), connect_async(request))
            .await
            .map_err(|_| AgentError::Timeout)??;
        Ok(ws)
    }

    fn auth_payload(&self) -> AuthPayload {
        let os = SystemSnapshot::minimal().os;
        AuthPayload {
            token: self.config.token.clone(),
            platform: PlatformInfo {
                os: os.name,
                os_version: Some(os.version),
                hostname: Some(os.hostname),
                arch: Some(os.arch),
                agent_version: Some(crate::VERSION.to_string()),
            },
            capabilities: vec![CAPABILITY_SUITE_COMPLETED.to_string()],
            running_executions: self.unfinished_executions(),
        }
    }

    /// Runs in flight plus finished runs the daemon has not heard about.
    /// Running ids are read first: a run leaves that table only after its
    /// completion is already queued.
    fn unfinished_executions(&self) -> Vec<String> {
        let mut ids = self.executor.running_ids();
        for id in self.outbox.unsent_completions() {
            if !ids.contains(&id) {
                ids.push(id);
            }
        }
        ids.sort();
        ids
    }

    async fn session(
        &self,
        ws: WsStream,
        outbox_rx: &mut OutboxReceiver,
        shutdown: &CancellationToken,
    ) -> SessionEnd {
        self.set_state(ConnectionState::Handshaking);
        let (mut sink, mut source) = ws.split();
        if let Err(e) = send(&mut sink, &AgentMessage::Auth(self.auth_payload())).await {
            return SessionEnd::Lost(format!("auth failed: {}", e));
        }
        self.set_state(ConnectionState::Connected);
        info!(server = %self.config.server_url, "Connected to daemon");
        if let Err(e) = self.flush_held(&mut sink, outbox_rx).await {
            return SessionEnd::Lost(e.to_string());
        }

        let mut telemetry = TelemetryCollector::new();
        let mut heartbeat = tokio::time::interval(self.config.heartbeat_interval());
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    let _ = sink.send(WsMessage::Close(None)).await;
                    return SessionEnd::Shutdown;
                }
                frame = source.next() => {
                    if let Some(end) = self.on_frame(frame, &mut sink).await {
                        return end;
                    }
                }
                Some(message) = outbox_rx.recv() => {
                    if let Err(e) = self.deliver(&mut sink, message, outbox_rx).await {
                        return SessionEnd::Lost(e.to_string());
                    }
                }
                _ = heartbeat.tick() => {
                    let snapshot = telemetry.snapshot();
                    if let Err(e) = send(&mut sink, &AgentMessage::Heartbeat(snapshot)).await {
                        return SessionEnd::Lost(e.to_string());
                    }
                }
            }
        }
    }

    /// Write one outbox message; on failure keep it for the next session.
    async fn deliver<S>(
        &self,
        sink: &mut S,
        message: AgentMessage,
        outbox_rx: &OutboxReceiver,
    ) -> AgentResult<()>
    where
        S: Sink<WsMessage, Error = WsError> + Unpin,
    {
        match send(sink, &message).await {
            Ok(()) => {
                outbox_rx.delivered(&message);
                Ok(())
            }
            Err(e) => {
                warn!(kind = message.message_type(), "Holding outbound message for next session: {}", e);
                *self.held.lock() = Some(message);
                Err(e)
            }
        }
    }

    async fn flush_held<S>(&self, sink: &mut S, outbox_rx: &OutboxReceiver) -> AgentResult<()>
    where
        S: Sink<WsMessage, Error = WsError> + Unpin,
    {
        let held = self.held.lock().take();
        match held {
            Some(message) => {
                debug!(kind = message.message_type(), "Resending held message");
                self.deliver(sink, message, outbox_rx).await
            }
            None => Ok(()),
        }
    }

    async fn on_frame<S>(
        &self,
        frame: Option<Result<WsMessage, WsError>>,
        sink: &mut S,
    ) -> Option<SessionEnd>
    where
        S: Sink<WsMessage, Error = WsError> + Unpin,
    {
        match frame {
            Some(Ok(WsMessage::Text(text))) => {
                if let Some(reply) = self.handle_text(&text).await {
                    if let Err(e) = send(sink, &reply).await {
                        return Some(SessionEnd::Lost(e.to_string()));
                    }
                }
                None
            }
            Some(Ok(WsMessage::Close(frame))) => {
                let reason = frame
                    .map(|f| f.reason.to_string())
                    .filter(|r| !r.is_empty())
                    .unwrap_or_else(|| "closed by daemon".to_string());
                Some(SessionEnd::Lost(reason))
            }
            Some(Ok(_)) => None,
            Some(Err(e)) => Some(SessionEnd::Lost(e.to_string())),
            None => Some(SessionEnd::Lost("connection closed".to_string())),
        }
    }

    /// Route one text frame; the result is sent back right away.
    pub async fn handle_text(&self, text: &str) -> Option<AgentMessage> {
        match decode_server_message(text) {
            Ok(message) => self.handle_message(message).await,
            Err(ProtocolError::UnknownType(kind)) => {
                warn!(kind = %kind, "Ignoring unknown message type");
                None
            }
            Err(e) => {
                warn!("Discarding undecodable message: {}", e);
                None
            }
        }
    }

    pub async fn handle_message(&self, message: ServerMessage) -> Option<AgentMessage> {
        match message {
            ServerMessage::Welcome(welcome) => {
                self.apply_welcome(welcome);
                None
            }
            ServerMessage::AuthSuccess(welcome) => {
                info!(environment_id = %welcome.environment_id, "Authenticated");
                self.apply_welcome(welcome);
                None
            }
            ServerMessage::HeartbeatAck { .. } => {
                debug!("Heartbeat acknowledged");
                None
            }
            ServerMessage::Ping { .. } => Some(AgentMessage::Pong {
                timestamp: Utc::now(),
            }),
            ServerMessage::ExecuteTask(request) => {
                info!(task_id = %request.task_id, "Received task");
                self.executor.spawn_task(request);
                None
            }
            ServerMessage::CancelTask { task_id } => {
                Some(AgentMessage::CancelAck(self.executor.cancel_task(&task_id)))
            }
            ServerMessage::ExecuteTestSuite(request) => {
                info!(
                    suite_id = %request.suite_id,
                    execution_id = %request.execution_id,
                    "Received suite execution"
                );
                self.executor.spawn_suite(request);
                None
            }
            ServerMessage::CancelTestSuite {
                suite_id,
                execution_id,
            } => {
                info!(suite_id = %suite_id, execution_id = %execution_id, "Cancel requested");
                Some(AgentMessage::CancelAck(
                    self.executor.cancel_suite(&execution_id),
                ))
            }
            ServerMessage::TokenInvalid { reason } => {
                error!(reason = %reason, "Daemon rejected this agent");
                None
            }
            request @ (ServerMessage::ListFiles { .. }
            | ServerMessage::ReadFile { .. }
            | ServerMessage::WriteFile { .. }
            | ServerMessage::DeleteFile { .. }
            | ServerMessage::MakeDir { .. }) => {
                let workspace = Arc::clone(&self.workspace);
                let outbox = self.outbox.clone();
                tokio::spawn(async move {
                    if let Some(response) = workspace.handle(&request).await {
                        outbox.send(response);
                    }
                });
                None
            }
        }
    }

    fn apply_welcome(&self, welcome: WelcomePayload) {
        self.reconnect_delay_secs
            .store(welcome.reconnect_delay, Ordering::Relaxed);
        *self.environment_id.write() = Some(welcome.environment_id);

        if self.config.work_dir.is_none() {
            if let Some(dir) = welcome.work_dir.filter(|d| !d.is_empty()) {
                let dir = PathBuf::from(dir);
                if self.work_dir.path() != dir {
                    info!(work_dir = %dir.display(), "Using daemon-provided work dir");
                    self.work_dir.set(dir);
                }
            }
        }
    }
}

async fn send<S>(sink: &mut S, message: &AgentMessage) -> AgentResult<()>
where
    S: Sink<WsMessage, Error = WsError> + Unpin,
{
    let text = message.to_json()?;
    sink.send(WsMessage::Text(text)).await?;
    Ok(())
}
