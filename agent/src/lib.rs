// Testmesh execution agent
// Keeps one connection to the dispatch daemon and runs the suites, commands
// and workspace requests it sends.

pub mod backoff;
pub mod config;
pub mod connection;
pub mod errors;
pub mod executor;
pub mod outbox;
pub mod workspace;

pub use config::{AgentConfig, ReconnectConfig};
pub use connection::{AgentConnection, ConnectionState};
pub use errors::{AgentError, AgentResult};
pub use executor::Executor;
pub use outbox::{Outbox, OutboxReceiver};
pub use workspace::{WorkDir, WorkspaceService};

use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Agent version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// A fully wired agent: connection, executor and workspace service sharing
/// one work dir and one outbox.
pub struct Agent {
    connection: Arc<AgentConnection>,
    executor: Arc<Executor>,
    outbox_rx: OutboxReceiver,
}

impl Agent {
    pub fn new(config: AgentConfig) -> AgentResult<Self> {
        config.validate()?;

        let (outbox, outbox_rx) = Outbox::channel();
        let work_dir = WorkDir::new(config.initial_work_dir());
        let executor = Arc::new(Executor::new(
            outbox.clone(),
            work_dir.clone(),
            config.default_timeout(),
        ));
        let workspace = Arc::new(WorkspaceService::new(work_dir.clone()));
        let connection = Arc::new(AgentConnection::new(
            config,
            executor.clone(),
            workspace,
            work_dir,
            outbox,
        ));

        Ok(Agent {
            connection,
            executor,
            outbox_rx,
        })
    }

    pub fn connection(&self) -> Arc<AgentConnection> {
        self.connection.clone()
    }

    pub fn executor(&self) -> Arc<Executor> {
        self.executor.clone()
    }

    /// Run until `shutdown` fires.
    pub async fn run(self, shutdown: CancellationToken) -> AgentResult<()> {
        self.connection.run(self.outbox_rx, shutdown).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }

    #[test]
    fn test_new_validates_config() {
        assert!(Agent::new(AgentConfig::default()).is_err());

        let agent = Agent::new(AgentConfig {
            token: "secret".to_string(),
            ..AgentConfig::default()
        })
        .unwrap();
        assert_eq!(agent.connection().state(), ConnectionState::Disconnected);
        assert_eq!(agent.executor().running_count(), 0);
    }
}
