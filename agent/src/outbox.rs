/// Outbound message queue
///
/// Producers (executor tasks, request handlers) push here without caring
/// whether the daemon is currently reachable; the connection drains the
/// queue whenever a session is up.
///
/// Suite log lines are capped while they wait: past `MAX_QUEUED_LOG_LINES`
/// further lines are counted and dropped, and a single notice line with the
/// count goes out ahead of the next line that fits. Results and completions
/// are never dropped. Completions stay listed as unsent until the connection
/// confirms they were written to the daemon.
use dashmap::DashSet;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use testmesh_core::{AgentMessage, SuiteLogChunk};
use tokio::sync::mpsc;
use tracing::{debug, warn};

pub const MAX_QUEUED_LOG_LINES: usize = 10_000;

#[derive(Debug, Default)]
struct Backlog {
    queued_logs: AtomicUsize,
    dropped_logs: AtomicU64,
    unsent_completions: DashSet<String>,
}

#[derive(Debug, Clone)]
pub struct Outbox {
    tx: mpsc::UnboundedSender<AgentMessage>,
    backlog: Arc<Backlog>,
    max_queued_logs: usize,
}

/// Receiving half, owned by the connection.
#[derive(Debug)]
pub struct OutboxReceiver {
    rx: mpsc::UnboundedReceiver<AgentMessage>,
    backlog: Arc<Backlog>,
}

impl Outbox {
    pub fn channel() -> (Self, OutboxReceiver) {
        Self::with_log_limit(MAX_QUEUED_LOG_LINES)
    }

    pub fn with_log_limit(max_queued_logs: usize) -> (Self, OutboxReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        let backlog = Arc::new(Backlog::default());
        (
            Self {
                tx,
                backlog: backlog.clone(),
                max_queued_logs,
            },
            OutboxReceiver { rx, backlog },
        )
    }

    pub fn send(&self, message: AgentMessage) {
        match &message {
            AgentMessage::TestSuiteLog(chunk) => {
                if !self.admit_log(chunk) {
                    return;
                }
            }
            AgentMessage::TestSuiteCompleted(completion) => {
                self.backlog
                    .unsent_completions
                    .insert(completion.execution_id.clone());
            }
            _ => {}
        }
        self.enqueue(message);
    }

    /// Execution ids whose completion has not reached the daemon yet.
    pub fn unsent_completions(&self) -> Vec<String> {
        self.backlog
            .unsent_completions
            .iter()
            .map(|id| id.key().clone())
            .collect()
    }

    pub fn queued_log_lines(&self) -> usize {
        self.backlog.queued_logs.load(Ordering::Relaxed)
    }

    fn admit_log(&self, chunk: &SuiteLogChunk) -> bool {
        let backlog = &self.backlog;
        // Room for the line plus a possible drop notice.
        if backlog.queued_logs.load(Ordering::Relaxed) + 1 >= self.max_queued_logs {
            if backlog.dropped_logs.fetch_add(1, Ordering::Relaxed) == 0 {
                warn!(
                    execution_id = %chunk.execution_id,
                    limit = self.max_queued_logs,
                    "Outbound log queue full, dropping suite log lines"
                );
            }
            return false;
        }

        let dropped = backlog.dropped_logs.swap(0, Ordering::Relaxed);
        if dropped > 0 {
            backlog.queued_logs.fetch_add(1, Ordering::Relaxed);
            self.enqueue(AgentMessage::TestSuiteLog(SuiteLogChunk {
                message: format!("[testmesh] {} log lines dropped, outbound queue was full", dropped),
                ..chunk.clone()
            }));
        }
        backlog.queued_logs.fetch_add(1, Ordering::Relaxed);
        true
    }

    fn enqueue(&self, message: AgentMessage) {
        let kind = message.message_type();
        if self.tx.send(message).is_err() {
            debug!(kind, "Outbox closed, dropping message");
        }
    }
}

impl OutboxReceiver {
    pub async fn recv(&mut self) -> Option<AgentMessage> {
        let message = self.rx.recv().await?;
        Some(self.dequeued(message))
    }

    pub fn try_recv(&mut self) -> Option<AgentMessage> {
        let message = self.rx.try_recv().ok()?;
        Some(self.dequeued(message))
    }

    fn dequeued(&self, message: AgentMessage) -> AgentMessage {
        if matches!(message, AgentMessage::TestSuiteLog(_)) {
            self.backlog.queued_logs.fetch_sub(1, Ordering::Relaxed);
        }
        message
    }

    /// Record that `message` was written to the daemon.
    pub fn delivered(&self, message: &AgentMessage) {
        if let AgentMessage::TestSuiteCompleted(completion) = message {
            self.backlog
                .unsent_completions
                .remove(&completion.execution_id);
        }
    }
}
