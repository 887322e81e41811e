/// Error types for the dispatch daemon

use serde_json::json;
use thiserror::Error;

/// Result type for daemon operations
pub type DaemonResult<T> = Result<T, DaemonError>;

/// Daemon error types
#[derive(Debug, Error)]
pub enum DaemonError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Authentication/authorization error
    #[error("Authentication error: {0}")]
    AuthError(String),

    /// RPC method not found
    #[error("Method not found: {0}")]
    MethodNotFound(String),

    /// Invalid RPC request or parameters
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Server error
    #[error("Server error: {0}")]
    ServerError(String),

    /// Persistence error
    #[error("Storage error: {0}")]
    StorageError(String),

    /// Unknown environment identity
    #[error("Environment not found: {0}")]
    EnvironmentNotFound(String),

    /// Environment has no live agent connection
    #[error("Environment offline: {0}")]
    EnvironmentOffline(String),

    /// The agent connection failed while sending
    #[error("Agent unreachable: {0}")]
    AgentUnreachable(String),

    /// The agent answered but reported a failure
    #[error("Agent rejected request: {0}")]
    AgentRejected(String),

    /// Unknown suite
    #[error("Suite not found: {0}")]
    SuiteNotFound(String),

    /// Unknown execution id
    #[error("Task not found: {0}")]
    TaskNotFound(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Metrics error
    #[error("Metrics error: {0}")]
    MetricsError(String),

    /// IO error
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    /// Timeout error
    #[error("Operation timed out")]
    Timeout,

    /// Connection error
    #[error("Connection error: {0}")]
    ConnectionError(String),

    /// Other errors
    #[error("{0}")]
    Other(String),
}

impl DaemonError {
    /// Convert to JSON-RPC error object
    pub fn to_rpc_error(&self) -> serde_json::Value {
        json!({
            "code": self.code(),
            "message": self.to_string()
        })
    }

    /// Get the error code for this error
    pub fn code(&self) -> i64 {
        match self {
            DaemonError::ConfigError(_) => -32600,
            DaemonError::AuthError(_) => -32001,
            DaemonError::MethodNotFound(_) => -32601,
            DaemonError::InvalidRequest(_) => -32602,
            DaemonError::ServerError(_) => -32603,
            DaemonError::StorageError(_) => -32006,
            DaemonError::EnvironmentNotFound(_) => -32002,
            DaemonError::EnvironmentOffline(_) => -32003,
            DaemonError::AgentUnreachable(_) => -32004,
            DaemonError::AgentRejected(_) => -32011,
            DaemonError::SuiteNotFound(_) => -32005,
            DaemonError::TaskNotFound(_) => -32007,
            DaemonError::SerializationError(_) => -32700,
            DaemonError::MetricsError(_) => -32008,
            DaemonError::IoError(_) => -32603,
            DaemonError::Timeout => -32009,
            DaemonError::ConnectionError(_) => -32010,
            DaemonError::Other(_) => -32000,
        }
    }
}

impl From<serde_json::error::Error> for DaemonError {
    fn from(e: serde_json::error::Error) -> Self {
        DaemonError::SerializationError(e.to_string())
    }
}

impl From<sqlx::Error> for DaemonError {
    fn from(e: sqlx::Error) -> Self {
        DaemonError::StorageError(e.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for DaemonError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        DaemonError::ConnectionError(e.to_string())
    }
}

impl From<testmesh_core::ProtocolError> for DaemonError {
    fn from(e: testmesh_core::ProtocolError) -> Self {
        DaemonError::SerializationError(e.to_string())
    }
}

impl From<String> for DaemonError {
    fn from(e: String) -> Self {
        DaemonError::Other(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_causes_have_distinct_codes() {
        let offline = DaemonError::EnvironmentOffline("env-1".to_string());
        let unreachable = DaemonError::AgentUnreachable("env-1".to_string());
        assert_ne!(offline.code(), unreachable.code());
        assert_ne!(offline.code(), DaemonError::ServerError(String::new()).code());

        let rpc = offline.to_rpc_error();
        assert_eq!(rpc["code"], -32003);
        assert!(rpc["message"].as_str().unwrap().contains("env-1"));
    }
}
