//! Controller configuration types.

use std::time::Duration;

use anyhow::{Context, Result};
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};

/// Controller process configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerConfig {
    pub server: ServerConfig,
    pub auth: AuthConfig,
    #[serde(default)]
    pub ai: AiConfig,
    #[serde(default)]
    pub messaging: MessagingConfig,
    #[serde(default)]
    pub commands: CommandsConfig,
}

/// Listen address.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_listen_host")]
    pub listen_host: String,
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_host: default_listen_host(),
            listen_port: default_listen_port(),
        }
    }
}

fn default_listen_host() -> String {
    "127.0.0.1".to_string()
}

fn default_listen_port() -> u16 {
    8000
}

/// Token minting and the bootstrap credential pair. `token_secret` and
/// `admin_password` have no defaults: missing values are a fatal startup
/// error.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    pub token_secret: String,
    #[serde(default = "default_token_ttl")]
    pub token_ttl_minutes: i64,
    #[serde(default = "default_admin_username")]
    pub admin_username: String,
    pub admin_password: String,
}

fn default_token_ttl() -> i64 {
    60
}

fn default_admin_username() -> String {
    "admin".to_string()
}

/// AI pre-processing stage.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AiConfig {
    /// API key for the OpenAI-compatible backend. Absent key falls back to
    /// the built-in rule-based analyzer.
    #[serde(default)]
    pub backend_key: Option<String>,
    /// Transition unsafe commands straight to failed without dispatch.
    #[serde(default = "default_true")]
    pub reject_unsafe: bool,
    /// Fail commands when the stage itself fails instead of degrading.
    #[serde(default)]
    pub mandatory: bool,
}

/// Shared messaging backend for multi-replica deployments.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MessagingConfig {
    /// Redis URL; absent runs single-replica with the in-process bus.
    #[serde(default)]
    pub url: Option<String>,
}

/// Command lifecycle knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandsConfig {
    /// Terminal commands retained for late queries.
    #[serde(default = "default_retention")]
    pub retention: usize,
    /// Overall per-command deadline in seconds.
    #[serde(default = "default_deadline_secs")]
    pub deadline_default_secs: u64,
    /// Grace interval after a session drop in seconds.
    #[serde(default = "default_grace_secs")]
    pub grace_interval_secs: u64,
}

impl Default for CommandsConfig {
    fn default() -> Self {
        Self {
            retention: default_retention(),
            deadline_default_secs: default_deadline_secs(),
            grace_interval_secs: default_grace_secs(),
        }
    }
}

impl CommandsConfig {
    pub fn deadline(&self) -> Duration {
        Duration::from_secs(self.deadline_default_secs)
    }

    pub fn grace_interval(&self) -> Duration {
        Duration::from_secs(self.grace_interval_secs)
    }
}

fn default_retention() -> usize {
    ogent_core::DEFAULT_RETENTION
}

fn default_deadline_secs() -> u64 {
    300
}

fn default_grace_secs() -> u64 {
    30
}

fn default_true() -> bool {
    true
}

/// Load controller configuration: `config/default.toml`, then
/// `config/local.toml`, then `OGENT__`-prefixed environment variables.
pub fn load_controller_config() -> Result<ControllerConfig> {
    let config = Config::builder()
        .add_source(File::with_name("config/default").required(false))
        .add_source(File::with_name("config/local").required(false))
        .add_source(
            Environment::with_prefix("OGENT")
                .separator("__")
                .try_parsing(true),
        )
        .build()
        .context("failed to build configuration")?;

    config
        .try_deserialize()
        .context("failed to deserialize controller configuration (token_secret and admin_password are mandatory)")
}
