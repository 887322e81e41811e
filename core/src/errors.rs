/// Error types shared by the daemon and the agent.
use thiserror::Error;

/// Errors raised while encoding or decoding wire messages.
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Malformed message: {0}")]
    Malformed(String),

    #[error("Message has no `type` field")]
    MissingType,

    #[error("Unknown message type: {0}")]
    UnknownType(String),

    #[error("JSON serialization error: {0}")]
    JsonError(#[from] serde_json::Error),
}

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Errors raised by the process runner outside of a run outcome.
///
/// A failed *execution* is never an error; it is reported as a
/// [`crate::process_runner::RunStatus`]. These cover the plumbing around it.
#[derive(Error, Debug)]
pub enum RunnerError {
    #[error("Failed to spawn process: {0}")]
    SpawnFailed(String),

    #[error("Failed to signal process {pid}: {reason}")]
    SignalFailed { pid: u32, reason: String },

    #[error("Output stream error: {0}")]
    StreamError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Result type for process runner operations.
pub type RunnerResult<T> = Result<T, RunnerError>;
