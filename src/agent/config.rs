//! Agent configuration types.

use std::time::Duration;

use anyhow::{Context, Result};
use config::{Config, Environment, File};
use ogent_exec::RemoteShellConfig;
use serde::{Deserialize, Serialize};

/// Agent process configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(default = "default_controller_url")]
    pub controller_url: String,
    pub username: String,
    pub password: String,
    /// Base reconnect delay in seconds (grows with backoff).
    #[serde(default = "default_reconnect_delay")]
    pub reconnect_delay: u64,
    /// Consecutive failed connection attempts before giving up; 0 retries
    /// forever.
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,
    /// Parallel command workers. 1 serializes executions.
    #[serde(default = "default_concurrency_limit")]
    pub concurrency_limit: usize,
    /// Stable agent id to propose at registration.
    #[serde(default)]
    pub agent_id_override: Option<String>,
    #[serde(default)]
    pub remote: RemoteConfig,
}

fn default_controller_url() -> String {
    "http://127.0.0.1:8000".to_string()
}

fn default_reconnect_delay() -> u64 {
    5
}

fn default_max_reconnect_attempts() -> u32 {
    10
}

fn default_concurrency_limit() -> usize {
    1
}

/// Remote-shell target configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RemoteConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub host: String,
    #[serde(default = "default_remote_port")]
    pub port: u16,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub key_path: Option<String>,
    #[serde(default = "default_remote_timeout")]
    pub timeout: u64,
}

fn default_remote_port() -> u16 {
    22
}

fn default_remote_timeout() -> u64 {
    10
}

impl AgentConfig {
    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.reconnect_delay.max(1))
    }

    pub fn remote_shell_config(&self) -> RemoteShellConfig {
        RemoteShellConfig {
            enabled: self.remote.enabled,
            host: self.remote.host.clone(),
            port: self.remote.port,
            username: self.remote.username.clone(),
            password: self.remote.password.clone(),
            key_path: self.remote.key_path.clone(),
            connect_timeout: Duration::from_secs(self.remote.timeout.max(1)),
        }
    }
}

/// Load agent configuration: `config/agent.toml`, then `OGENT_AGENT__`
/// environment variables.
pub fn load_agent_config() -> Result<AgentConfig> {
    let config = Config::builder()
        .add_source(File::with_name("config/agent").required(false))
        .add_source(
            Environment::with_prefix("OGENT_AGENT")
                .separator("__")
                .try_parsing(true),
        )
        .build()
        .context("failed to build agent configuration")?;

    config
        .try_deserialize()
        .context("failed to deserialize agent configuration (username and password are mandatory)")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_config_fills_defaults() {
        let config: AgentConfig = serde_json::from_value(serde_json::json!({
            "username": "agent",
            "password": "pw",
        }))
        .unwrap();

        assert_eq!(config.controller_url, "http://127.0.0.1:8000");
        assert_eq!(config.reconnect_delay, 5);
        assert_eq!(config.max_reconnect_attempts, 10);
        assert_eq!(config.concurrency_limit, 1);
        assert!(config.agent_id_override.is_none());
        assert!(!config.remote.enabled);
        assert_eq!(config.remote.port, 22);
    }

    #[test]
    fn test_remote_shell_config_mapping() {
        let config: AgentConfig = serde_json::from_value(serde_json::json!({
            "username": "agent",
            "password": "pw",
            "remote": {
                "enabled": true,
                "host": "db-1",
                "username": "ops",
                "key_path": "/home/agent/.ssh/id_ed25519",
                "timeout": 7,
            },
        }))
        .unwrap();

        let remote = config.remote_shell_config();
        assert!(remote.enabled);
        assert_eq!(remote.host, "db-1");
        assert_eq!(remote.port, 22);
        assert_eq!(remote.connect_timeout, Duration::from_secs(7));
    }

    #[test]
    fn test_missing_credentials_are_an_error() {
        let result: Result<AgentConfig, _> =
            serde_json::from_value(serde_json::json!({"username": "agent"}));
        assert!(result.is_err());
    }
}
