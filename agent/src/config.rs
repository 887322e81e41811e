/// Agent configuration
use crate::errors::{AgentError, AgentResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use testmesh_core::LoggingConfig;

/// Overrides `server_url` from the file.
pub const ENV_SERVER_URL: &str = "TESTMESH_SERVER_URL";
/// Overrides `token` from the file.
pub const ENV_AGENT_TOKEN: &str = "TESTMESH_AGENT_TOKEN";

/// Agent configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Daemon agent endpoint, e.g. `ws://127.0.0.1:8765/agent`
    pub server_url: String,
    /// Credential presented on connect and in `auth`
    pub token: String,
    /// Root for suite checkouts and workspace requests. When unset the
    /// daemon-provided directory is used, then `~/.testmesh/work`.
    pub work_dir: Option<PathBuf>,
    pub heartbeat_interval_secs: u64,
    /// Applies when a request carries no timeout of its own
    pub default_timeout_secs: u64,
    pub connect_timeout_secs: u64,
    pub reconnect: ReconnectConfig,
    pub logging: LoggingConfig,
}

impl Default for AgentConfig {
    fn default() -> Self {
        AgentConfig {
            server_url: "ws://127.0.0.1:8765/agent".to_string(),
            token: String::new(),
            work_dir: None,
            heartbeat_interval_secs: 5,
            default_timeout_secs: 3600,
            connect_timeout_secs: 10,
            reconnect: ReconnectConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

/// Reconnect timing
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    /// First backoff step after a failed attempt
    pub initial_delay_secs: u64,
    /// Backoff cap
    pub max_delay_secs: u64,
    /// Wait after a disconnect until the daemon tells us otherwise
    pub server_delay_secs: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        ReconnectConfig {
            initial_delay_secs: 1,
            max_delay_secs: 60,
            server_delay_secs: 30,
        }
    }
}

impl AgentConfig {
    /// Load configuration from file
    pub fn load(path: &Path) -> AgentResult<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| AgentError::ConfigError(format!("Failed to read config file: {}", e)))?;

        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> AgentResult<Self> {
        toml::from_str(content)
            .map_err(|e| AgentError::ConfigError(format!("Failed to parse config: {}", e)))
    }

    /// Load from TOML file or use defaults, then apply environment overrides
    pub fn load_or_default(path: Option<&Path>) -> AgentResult<Self> {
        let mut config = match path {
            Some(p) => Self::load(p)?,
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Apply `TESTMESH_*` overrides; empty values are ignored.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup(ENV_SERVER_URL).filter(|v| !v.is_empty()) {
            self.server_url = url;
        }
        if let Some(token) = lookup(ENV_AGENT_TOKEN).filter(|v| !v.is_empty()) {
            self.token = token;
        }
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn default_timeout(&self) -> Duration {
        Duration::from_secs(self.default_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// Work dir used before the daemon has sent one.
    pub fn initial_work_dir(&self) -> PathBuf {
        self.work_dir.clone().unwrap_or_else(|| {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".testmesh")
                .join("work")
        })
    }

    /// Validate configuration
    pub fn validate(&self) -> AgentResult<()> {
        if !(self.server_url.starts_with("ws://") || self.server_url.starts_with("wss://")) {
            return Err(AgentError::ConfigError(format!(
                "server_url must be a ws:// or wss:// URL, got {}",
                self.server_url
            )));
        }

        if self.token.is_empty() {
            return Err(AgentError::ConfigError(format!(
                "token is required (set it in the config file or {})",
                ENV_AGENT_TOKEN
            )));
        }

        if self.heartbeat_interval_secs == 0 {
            return Err(AgentError::ConfigError(
                "heartbeat_interval_secs must be greater than 0".to_string(),
            ));
        }

        if self.default_timeout_secs == 0 {
            return Err(AgentError::ConfigError(
                "default_timeout_secs must be greater than 0".to_string(),
            ));
        }

        if self.reconnect.initial_delay_secs == 0
            || self.reconnect.max_delay_secs < self.reconnect.initial_delay_secs
        {
            return Err(AgentError::ConfigError(
                "reconnect.max_delay_secs must be at least initial_delay_secs (> 0)".to_string(),
            ));
        }

        self.logging.validate().map_err(AgentError::ConfigError)?;

        Ok(())
    }
}
