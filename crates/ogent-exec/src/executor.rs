//! The `CommandExecutor` trait and target selection.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::progress::ProgressSender;

/// Where a command actually ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionType {
    Local,
    Remote,
}

impl std::fmt::Display for ExecutionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Local => write!(f, "local"),
            Self::Remote => write!(f, "remote"),
        }
    }
}

/// Requested execution target. `Auto` prefers the remote executor when it
/// is available, otherwise runs locally. Forced targets never fall back.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionTarget {
    #[default]
    Auto,
    Local,
    Remote,
}

impl std::fmt::Display for ExecutionTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Auto => write!(f, "auto"),
            Self::Local => write!(f, "local"),
            Self::Remote => write!(f, "remote"),
        }
    }
}

/// Terminal result of a single command run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionOutcome {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub execution_type: ExecutionType,
    /// Opaque descriptor of where the command ran (hostname or user@host).
    pub target: String,
    /// Set when the run was interrupted by cancellation.
    #[serde(default)]
    pub cancelled: bool,
}

/// A strategy that can run a command string to completion.
///
/// `run` streams incremental output through `progress` in event order and
/// returns the terminal outcome. Cancelling `cancel` must produce a return
/// within bounded time with `cancelled` set on the outcome.
#[async_trait]
pub trait CommandExecutor: Send + Sync {
    /// Which kind of executor this is.
    fn kind(&self) -> ExecutionType;

    /// Whether the executor can run a command right now.
    fn available(&self) -> bool;

    /// Descriptor of the execution target.
    fn target(&self) -> String;

    /// Run `command` to completion.
    async fn run(
        &self,
        command: &str,
        progress: ProgressSender,
        cancel: CancellationToken,
    ) -> Result<ExecutionOutcome>;
}

/// Select the executor for a requested target.
///
/// `auto` prefers remote when available, else local. Forced targets fail
/// with [`Error::Unavailable`] when the executor is missing or disabled —
/// there is no silent fallback.
pub fn select_executor<'a>(
    target: ExecutionTarget,
    local: &'a dyn CommandExecutor,
    remote: Option<&'a dyn CommandExecutor>,
) -> Result<&'a dyn CommandExecutor> {
    match target {
        ExecutionTarget::Auto => match remote {
            Some(r) if r.available() => Ok(r),
            _ if local.available() => Ok(local),
            _ => Err(Error::Unavailable("no executor is available".to_string())),
        },
        ExecutionTarget::Local => {
            if local.available() {
                Ok(local)
            } else {
                Err(Error::Unavailable(
                    "local executor is not available".to_string(),
                ))
            }
        }
        ExecutionTarget::Remote => match remote {
            Some(r) if r.available() => Ok(r),
            Some(_) => Err(Error::Unavailable(
                "remote executor is not available".to_string(),
            )),
            None => Err(Error::Unavailable(
                "remote execution is not configured".to_string(),
            )),
        },
    }
}
