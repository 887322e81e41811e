/// Daemon configuration
use crate::errors::{DaemonError, DaemonResult};
use crate::model::{Environment, GitSource, SuiteCase, SuiteDefinition};
use crate::task_queue::DEFAULT_MAX_CONCURRENT_TASKS;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use testmesh_core::LoggingConfig;

/// Daemon configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    pub server: ServerConfig,
    pub queue: QueueConfig,
    pub storage: StorageConfig,
    pub auth: AuthConfig,
    pub metrics: MetricsConfig,
    pub logging: LoggingConfig,
    pub seed: SeedConfig,
}

/// Listener and connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Bind address shared by every listener
    pub bind_addr: String,
    /// JSON-RPC HTTP port
    pub http_port: u16,
    /// Agent WebSocket port
    pub agent_port: u16,
    /// Frontend event-stream WebSocket port
    pub events_port: u16,
    /// Seconds between pings sent to each agent
    pub ping_interval_secs: u64,
    /// Drop an agent that has been silent this long
    pub liveness_timeout_secs: u64,
    /// Delay agents wait before reconnecting, sent in `welcome`
    pub reconnect_delay_secs: u64,
    /// Work dir handed to agents whose environment sets none
    pub agent_work_dir: Option<String>,
    /// Timeout for request/response calls to agents
    pub request_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            bind_addr: "127.0.0.1".to_string(),
            http_port: 8080,
            agent_port: 8765,
            events_port: 8081,
            ping_interval_secs: 20,
            liveness_timeout_secs: 60,
            reconnect_delay_secs: 30,
            agent_work_dir: None,
            request_timeout_secs: 30,
        }
    }
}

impl ServerConfig {
    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs)
    }

    pub fn liveness_timeout(&self) -> Duration {
        Duration::from_secs(self.liveness_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Used for environments that do not set their own limit
    pub default_max_concurrent_tasks: u32,
}

impl Default for QueueConfig {
    fn default() -> Self {
        QueueConfig {
            default_max_concurrent_tasks: DEFAULT_MAX_CONCURRENT_TASKS,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// SQLite database file; in-memory storage when unset
    pub sqlite_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Bearer key required by the JSON-RPC API, if set
    pub api_key: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub port: u16,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        MetricsConfig {
            enabled: true,
            port: 9090,
        }
    }
}

/// Fixtures loaded into the store at startup
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SeedConfig {
    pub environments: Vec<SeedEnvironment>,
    pub suites: Vec<SeedSuite>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeedEnvironment {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    pub token: String,
    #[serde(default)]
    pub max_concurrent_tasks: Option<u32>,
    #[serde(default)]
    pub work_dir: Option<String>,
}

impl SeedEnvironment {
    pub fn to_environment(&self) -> Environment {
        let mut env = Environment::new(self.id.clone(), self.token.clone());
        if let Some(name) = &self.name {
            env.name = name.clone();
        }
        env.max_concurrent_tasks = self.max_concurrent_tasks;
        env.work_dir = self.work_dir.clone();
        env
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeedSuite {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub plan_id: Option<String>,
    pub environment_id: String,
    pub execution_command: String,
    #[serde(default)]
    pub cases: Vec<SuiteCase>,
    #[serde(default)]
    pub git: Option<GitSource>,
}

impl SeedSuite {
    pub fn to_suite(&self) -> SuiteDefinition {
        let mut suite = SuiteDefinition::new(
            self.id.clone(),
            self.environment_id.clone(),
            self.execution_command.clone(),
        );
        if let Some(name) = &self.name {
            suite.name = name.clone();
        }
        suite.plan_id = self.plan_id.clone();
        suite.cases = self.cases.clone();
        suite.git = self.git.clone();
        suite
    }
}

impl DaemonConfig {
    /// Load configuration from file
    pub fn load(path: &Path) -> DaemonResult<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| DaemonError::ConfigError(format!("Failed to read config file: {}", e)))?;

        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> DaemonResult<Self> {
        toml::from_str(content)
            .map_err(|e| DaemonError::ConfigError(format!("Failed to parse config: {}", e)))
    }

    /// Load from TOML file or use defaults
    pub fn load_or_default(path: Option<&Path>) -> DaemonResult<Self> {
        match path {
            Some(p) => Self::load(p),
            None => Ok(Self::default()),
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> DaemonResult<()> {
        if self.server.ping_interval_secs == 0 {
            return Err(DaemonError::ConfigError(
                "server.ping_interval_secs must be greater than 0".to_string(),
            ));
        }

        if self.server.liveness_timeout_secs <= self.server.ping_interval_secs {
            return Err(DaemonError::ConfigError(
                "server.liveness_timeout_secs must exceed ping_interval_secs".to_string(),
            ));
        }

        if self.queue.default_max_concurrent_tasks == 0 {
            return Err(DaemonError::ConfigError(
                "queue.default_max_concurrent_tasks must be greater than 0".to_string(),
            ));
        }

        self.logging.validate().map_err(DaemonError::ConfigError)?;

        let mut tokens = HashSet::new();
        let mut env_ids = HashSet::new();
        for env in &self.seed.environments {
            if env.token.is_empty() {
                return Err(DaemonError::ConfigError(format!(
                    "environment {} has an empty token",
                    env.id
                )));
            }
            if !env_ids.insert(env.id.as_str()) {
                return Err(DaemonError::ConfigError(format!(
                    "duplicate environment id {}",
                    env.id
                )));
            }
            if !tokens.insert(env.token.as_str()) {
                return Err(DaemonError::ConfigError(format!(
                    "environment {} reuses another environment's token",
                    env.id
                )));
            }
        }

        for suite in &self.seed.suites {
            if !env_ids.contains(suite.environment_id.as_str()) {
                return Err(DaemonError::ConfigError(format!(
                    "suite {} references unknown environment {}",
                    suite.id, suite.environment_id
                )));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = DaemonConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.queue.default_max_concurrent_tasks, 1);
        assert!(config.storage.sqlite_path.is_none());
    }

    #[test]
    fn test_liveness_must_exceed_ping() {
        let mut config = DaemonConfig::default();
        config.server.liveness_timeout_secs = config.server.ping_interval_secs;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_parse_with_seed() {
        let config = DaemonConfig::from_toml(
            r#"
            [server]
            agent_port = 9000

            [queue]
            default_max_concurrent_tasks = 2

            [[seed.environments]]
            id = "env-1"
            token = "secret"
            max_concurrent_tasks = 3

            [[seed.suites]]
            id = "smoke"
            environment_id = "env-1"
            execution_command = "pytest -q"
            cases = [{ id = "c1", code = "TC-1" }]
            git = { repo_url = "https://example.com/repo.git", branch = "main" }
            "#,
        )
        .unwrap();

        assert!(config.validate().is_ok());
        assert_eq!(config.server.agent_port, 9000);
        assert_eq!(config.server.http_port, 8080);
        let env = config.seed.environments[0].to_environment();
        assert_eq!(env.max_concurrent_tasks, Some(3));
        let suite = config.seed.suites[0].to_suite();
        assert_eq!(suite.case_codes(), vec!["TC-1"]);
        assert_eq!(suite.git.unwrap().branch.as_deref(), Some("main"));
    }

    #[test]
    fn test_duplicate_tokens_rejected() {
        let config = DaemonConfig::from_toml(
            r#"
            [[seed.environments]]
            id = "a"
            token = "same"

            [[seed.environments]]
            id = "b"
            token = "same"
            "#,
        )
        .unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_suite_with_unknown_environment_rejected() {
        let config = DaemonConfig::from_toml(
            r#"
            [[seed.suites]]
            id = "smoke"
            environment_id = "ghost"
            execution_command = "true"
            "#,
        )
        .unwrap();
        assert!(config.validate().is_err());
    }
}
