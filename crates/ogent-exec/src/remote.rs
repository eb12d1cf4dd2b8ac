//! Remote-shell executor.
//!
//! Runs commands on a configured target through an outbound ssh session in
//! batch mode. Connection setup failures are reported as command outcomes
//! (nonzero exit, diagnostic stderr) — they never crash the agent.

use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::executor::{CommandExecutor, ExecutionOutcome, ExecutionType};
use crate::progress::{ProgressSender, ProgressUpdate};
use crate::stream::run_streaming;

/// Configuration for the remote-shell target.
#[derive(Debug, Clone)]
pub struct RemoteShellConfig {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
    pub username: String,
    /// Accepted for compatibility; batch-mode ssh cannot use it. A warning
    /// is logged when set and key auth is used instead.
    pub password: Option<String>,
    pub key_path: Option<String>,
    pub connect_timeout: Duration,
}

impl Default for RemoteShellConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            host: String::new(),
            port: 22,
            username: String::new(),
            password: None,
            key_path: None,
            connect_timeout: Duration::from_secs(10),
        }
    }
}

/// Executor that runs commands on a remote host over ssh.
pub struct RemoteExecutor {
    config: RemoteShellConfig,
}

impl RemoteExecutor {
    /// Build a remote executor. A config without host or username disables
    /// remote execution rather than failing construction.
    pub fn new(mut config: RemoteShellConfig) -> Self {
        if config.enabled && (config.host.is_empty() || config.username.is_empty()) {
            warn!("remote host or username not configured, disabling remote execution");
            config.enabled = false;
        }
        if config.password.is_some() {
            warn!("remote_password is not usable with batch-mode ssh; using key authentication");
        }
        Self { config }
    }

    fn ssh_command(&self, remote_command: &str) -> Command {
        let mut cmd = Command::new("ssh");
        cmd.arg("-p")
            .arg(self.config.port.to_string())
            .arg("-o")
            .arg("BatchMode=yes")
            .arg("-o")
            .arg("StrictHostKeyChecking=accept-new")
            .arg("-o")
            .arg(format!(
                "ConnectTimeout={}",
                self.config.connect_timeout.as_secs().max(1)
            ));
        if let Some(key) = &self.config.key_path {
            cmd.arg("-i").arg(key);
        }
        cmd.arg(self.target()).arg("--").arg(remote_command);
        cmd
    }

    /// Probe the target with a trivial command. Used at agent startup to
    /// report remote availability in the registration info.
    pub async fn test_connection(&self) -> Result<()> {
        if !self.config.enabled {
            return Err(Error::Unavailable(
                "remote execution is disabled".to_string(),
            ));
        }
        let output = self.ssh_command("true").output().await?;
        if output.status.success() {
            Ok(())
        } else {
            Err(Error::ConnectFailed(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ))
        }
    }
}

#[async_trait]
impl CommandExecutor for RemoteExecutor {
    fn kind(&self) -> ExecutionType {
        ExecutionType::Remote
    }

    fn available(&self) -> bool {
        self.config.enabled
    }

    fn target(&self) -> String {
        format!("{}@{}", self.config.username, self.config.host)
    }

    async fn run(
        &self,
        command: &str,
        progress: ProgressSender,
        cancel: CancellationToken,
    ) -> Result<ExecutionOutcome> {
        if !self.available() {
            return Err(Error::Unavailable(
                "remote execution is disabled".to_string(),
            ));
        }

        info!(target = %self.target(), command = %command, "executing command via remote shell");

        let _ = progress
            .send(ProgressUpdate::message(
                format!("connecting to {}", self.target()),
                Some(0),
            ))
            .await;

        // ssh exits 255 on connection/auth failure with the diagnostic on
        // stderr, which flows straight into the outcome.
        run_streaming(
            self.ssh_command(command),
            ExecutionType::Remote,
            self.target(),
            progress,
            cancel,
        )
        .await
    }
}
