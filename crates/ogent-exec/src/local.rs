//! Local subshell executor.

use async_trait::async_trait;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::error::Result;
use crate::executor::{CommandExecutor, ExecutionOutcome, ExecutionType};
use crate::progress::{ProgressSender, ProgressUpdate};
use crate::stream::run_streaming;

/// Runs commands in a subshell on the agent host.
pub struct LocalExecutor {
    shell: String,
    hostname: String,
}

impl LocalExecutor {
    pub fn new() -> Self {
        Self {
            shell: "bash".to_string(),
            hostname: detect_hostname(),
        }
    }

    /// Override the shell used to interpret commands.
    pub fn with_shell(mut self, shell: impl Into<String>) -> Self {
        self.shell = shell.into();
        self
    }
}

impl Default for LocalExecutor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CommandExecutor for LocalExecutor {
    fn kind(&self) -> ExecutionType {
        ExecutionType::Local
    }

    fn available(&self) -> bool {
        true
    }

    fn target(&self) -> String {
        self.hostname.clone()
    }

    async fn run(
        &self,
        command: &str,
        progress: ProgressSender,
        cancel: CancellationToken,
    ) -> Result<ExecutionOutcome> {
        info!(shell = %self.shell, command = %command, "executing command locally");

        let _ = progress
            .send(ProgressUpdate::message("command started", Some(0)))
            .await;

        let mut cmd = Command::new(&self.shell);
        cmd.arg("-c").arg(command);

        run_streaming(
            cmd,
            ExecutionType::Local,
            self.hostname.clone(),
            progress,
            cancel,
        )
        .await
    }
}

fn detect_hostname() -> String {
    if let Ok(name) = std::env::var("HOSTNAME") {
        if !name.is_empty() {
            return name;
        }
    }
    #[cfg(unix)]
    if let Ok(name) = std::fs::read_to_string("/proc/sys/kernel/hostname") {
        let name = name.trim();
        if !name.is_empty() {
            return name.to_string();
        }
    }
    "localhost".to_string()
}
