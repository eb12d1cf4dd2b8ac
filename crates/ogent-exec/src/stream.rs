//! Shared subprocess driver: spawn, stream output line-by-line, honor
//! cancellation, collect the terminal outcome.

use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::Result;
use crate::executor::{ExecutionOutcome, ExecutionType};
use crate::progress::{ProgressSender, ProgressUpdate};

/// How long to wait after SIGTERM before escalating to SIGKILL.
const KILL_GRACE: Duration = Duration::from_secs(5);

#[derive(Clone, Copy)]
enum StreamKind {
    Stdout,
    Stderr,
}

/// Spawn `cmd`, stream its output through `progress`, and wait for exit.
///
/// The child is placed in its own process group on Unix so cancellation can
/// take the whole subtree down. Output is consumed concurrently with the
/// wait so large outputs never deadlock the pipe buffers.
pub(crate) async fn run_streaming(
    mut cmd: Command,
    execution_type: ExecutionType,
    target: String,
    progress: ProgressSender,
    cancel: CancellationToken,
) -> Result<ExecutionOutcome> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    #[cfg(unix)]
    cmd.process_group(0);

    let mut child = cmd.spawn()?;
    let pid = child.id();

    let stdout_task = child
        .stdout
        .take()
        .map(|out| spawn_reader(out, StreamKind::Stdout, progress.clone()));
    let stderr_task = child
        .stderr
        .take()
        .map(|err| spawn_reader(err, StreamKind::Stderr, progress.clone()));

    let mut cancelled = false;
    let status = tokio::select! {
        status = child.wait() => status?,
        _ = cancel.cancelled() => {
            debug!(pid = ?pid, "cancellation requested, terminating process group");
            cancelled = true;
            terminate(&mut child, pid).await?
        }
    };

    let stdout = join_reader(stdout_task).await;
    let stderr = join_reader(stderr_task).await;
    let exit_code = status.code().unwrap_or(-1);

    Ok(ExecutionOutcome {
        exit_code,
        stdout,
        stderr,
        execution_type,
        target,
        cancelled,
    })
}

fn spawn_reader<R>(reader: R, kind: StreamKind, progress: ProgressSender) -> JoinHandle<String>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        let mut collected = String::new();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    let chunk = format!("{line}\n");
                    collected.push_str(&chunk);
                    let update = match kind {
                        StreamKind::Stdout => ProgressUpdate::stdout(chunk),
                        StreamKind::Stderr => ProgressUpdate::stderr(chunk),
                    };
                    // The receiver may be gone (caller stopped listening);
                    // keep collecting for the terminal buffers regardless.
                    let _ = progress.send(update).await;
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, "error reading subprocess output");
                    break;
                }
            }
        }
        collected
    })
}

async fn join_reader(task: Option<JoinHandle<String>>) -> String {
    match task {
        Some(handle) => handle.await.unwrap_or_default(),
        None => String::new(),
    }
}

/// Terminate the child's process group: SIGTERM first, SIGKILL after a
/// bounded grace period. Always reaps the child.
async fn terminate(child: &mut Child, pid: Option<u32>) -> std::io::Result<std::process::ExitStatus> {
    signal_group(pid, Signal::Term, child).await;
    match tokio::time::timeout(KILL_GRACE, child.wait()).await {
        Ok(status) => status,
        Err(_) => {
            warn!(pid = ?pid, "process ignored SIGTERM, escalating to SIGKILL");
            signal_group(pid, Signal::Kill, child).await;
            child.wait().await
        }
    }
}

enum Signal {
    Term,
    Kill,
}

#[cfg(unix)]
async fn signal_group(pid: Option<u32>, signal: Signal, child: &mut Child) {
    let sig = match signal {
        Signal::Term => libc::SIGTERM,
        Signal::Kill => libc::SIGKILL,
    };
    match pid {
        // Negative pid signals the whole process group.
        Some(pid) => unsafe {
            libc::kill(-(pid as i32), sig);
        },
        None => {
            let _ = child.kill().await;
        }
    }
}

#[cfg(not(unix))]
async fn signal_group(_pid: Option<u32>, _signal: Signal, child: &mut Child) {
    let _ = child.kill().await;
}
