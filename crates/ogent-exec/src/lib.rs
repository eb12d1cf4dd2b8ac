//! Executor abstraction for ogent agents.
//!
//! An executor is anything that can run a command string and report a
//! terminal outcome: exit code, captured output, and where it ran. Two
//! variants are provided:
//!
//! - [`LocalExecutor`] — spawns a subshell on the agent host
//! - [`RemoteExecutor`] — runs the command on a configured remote host
//!   through an outbound ssh session
//!
//! While a command runs, incremental output is streamed through a
//! [`ProgressSender`] channel; the terminal state is only ever reported by
//! the `run` return value. Cancellation is cooperative via
//! `tokio_util::sync::CancellationToken` and returns within bounded time.

mod error;
mod executor;
mod local;
mod progress;
mod remote;
mod stream;

pub use error::{Error, Result};
pub use executor::{
    select_executor, CommandExecutor, ExecutionOutcome, ExecutionTarget, ExecutionType,
};
pub use local::LocalExecutor;
pub use progress::{ProgressSender, ProgressStatus, ProgressUpdate};
pub use remote::{RemoteExecutor, RemoteShellConfig};
