/// Error types for the execution agent
use thiserror::Error;

/// Result type for agent operations
pub type AgentResult<T> = Result<T, AgentError>;

#[derive(Debug, Error)]
pub enum AgentError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Transport failure talking to the daemon
    #[error("Connection error: {0}")]
    ConnectionError(String),

    /// The daemon refused our credential
    #[error("Credential rejected: {0}")]
    TokenRejected(String),

    /// Frame could not be encoded or decoded
    #[error("Protocol error: {0}")]
    ProtocolError(#[from] testmesh_core::ProtocolError),

    /// Requested path is outside the work dir
    #[error("Path escapes work dir: {0}")]
    PathEscape(String),

    /// Source checkout failed
    #[error("Git error: {0}")]
    GitError(String),

    /// IO error
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    /// Connect attempt exceeded its deadline
    #[error("Operation timed out")]
    Timeout,
}

impl From<tokio_tungstenite::tungstenite::Error> for AgentError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        AgentError::ConnectionError(e.to_string())
    }
}
