// Testmesh: remote test execution dispatch
// Core library shared by the daemon and the agent: wire protocol, process
// supervision, host telemetry and logging bootstrap.

pub mod errors;
pub mod logging;
pub mod process_runner;
pub mod protocol;
pub mod telemetry;

// Re-export commonly used types
pub use errors::{ProtocolError, ProtocolResult, RunnerError, RunnerResult};

pub use logging::{init_logging, LogFormat, LoggingConfig};

pub use process_runner::{CommandSpec, ProcessRunner, RunHandle, RunOutcome, RunStatus};

pub use protocol::{
    decode_agent_message, decode_server_message, AgentMessage, AuthPayload, CancelAck,
    CaseOutcome, FileEntry, PlatformInfo, ServerMessage, SuiteCaseResult, SuiteCompletion,
    SuiteExecutionRequest, SuiteLogChunk, SuiteRunStatus, TaskRequest, TaskResultPayload,
    TaskStatus, WelcomePayload, WorkspaceResponse, CAPABILITY_SUITE_COMPLETED, PROTOCOL_VERSION,
};

pub use telemetry::{SystemSnapshot, TelemetryCollector};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
