/// Testmesh dispatch daemon: accepts agent connections over WebSocket,
/// queues suite executions per environment and exposes a JSON-RPC API and a
/// live event stream for frontends.
pub mod agent_socket;
pub mod broker;
pub mod config;
pub mod dispatch;
pub mod errors;
pub mod event_stream;
pub mod events;
pub mod handlers;
pub mod metrics;
pub mod model;
pub mod registry;
pub mod remote;
pub mod rpc;
pub mod server;
pub mod sqlite_store;
pub mod store;
pub mod task_queue;
pub mod types;

// Re-export commonly used types
pub use agent_socket::{AgentGateway, GatewaySettings};
pub use config::DaemonConfig;
pub use dispatch::SuiteDispatcher;
pub use errors::{DaemonError, DaemonResult};
pub use events::{DispatchEvent, EventBus, EventFilter};
pub use model::{CaseResult, Environment, ExecutionLog, SuiteDefinition, SuiteStatus, Task};
pub use registry::{AgentLink, ConnectionHandle, ConnectionRegistry};
pub use server::{DaemonHandle, DispatchServer};
pub use sqlite_store::SqliteStore;
pub use store::{DispatchStore, MemoryStore};
pub use task_queue::TaskQueue;
pub use types::{RpcRequest, RpcResponse};

/// Daemon version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }
}
