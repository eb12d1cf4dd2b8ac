//! Command worker pool.
//!
//! Incoming `execute_command` frames become jobs on a FIFO queue; a pool of
//! workers (size `concurrency_limit`, default 1) pulls jobs and runs each
//! to completion through the selected executor. Progress frames stream out
//! as the executor produces them; exactly one `command_result` follows,
//! always after the last progress frame for that command.

use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use ogent_core::protocol::{events, CommandProgress, CommandResult, WireFrame};
use ogent_exec::{
    select_executor, CommandExecutor, ExecutionOutcome, ExecutionTarget, ExecutionType,
    LocalExecutor, ProgressUpdate, RemoteExecutor,
};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// The agent's executor set.
pub(crate) struct Executors {
    pub local: Arc<LocalExecutor>,
    pub remote: Option<Arc<RemoteExecutor>>,
}

impl Executors {
    fn select(&self, target: ExecutionTarget) -> ogent_exec::Result<&dyn CommandExecutor> {
        select_executor(
            target,
            self.local.as_ref(),
            self.remote.as_deref().map(|r| r as &dyn CommandExecutor),
        )
    }
}

/// One dispatched command waiting for a worker.
pub(crate) struct CommandJob {
    pub command_id: Uuid,
    pub command: String,
    pub execution_target: ExecutionTarget,
    pub cancel: CancellationToken,
}

pub(crate) type JobQueue = Arc<Mutex<mpsc::Receiver<CommandJob>>>;

/// Spawn the worker pool. Workers run for the life of the process; they
/// survive controller reconnects because the outbound channel buffers.
pub(crate) fn spawn_workers(
    concurrency: usize,
    executors: Arc<Executors>,
    jobs: JobQueue,
    out: mpsc::UnboundedSender<WireFrame>,
    cancels: Arc<DashMap<Uuid, CancellationToken>>,
) {
    for worker_id in 0..concurrency.max(1) {
        let executors = Arc::clone(&executors);
        let jobs = Arc::clone(&jobs);
        let out = out.clone();
        let cancels = Arc::clone(&cancels);
        tokio::spawn(async move {
            worker_loop(worker_id, executors, jobs, out, cancels).await;
        });
    }
}

async fn worker_loop(
    worker_id: usize,
    executors: Arc<Executors>,
    jobs: JobQueue,
    out: mpsc::UnboundedSender<WireFrame>,
    cancels: Arc<DashMap<Uuid, CancellationToken>>,
) {
    loop {
        // Holding the lock only while waiting keeps pickup FIFO while the
        // pool processes in parallel.
        let job = {
            let mut rx = jobs.lock().await;
            rx.recv().await
        };
        let Some(job) = job else {
            debug!(worker_id, "job queue closed, worker exiting");
            break;
        };

        let command_id = job.command_id;
        debug!(worker_id, command_id = %command_id, "worker picked up command");
        process_job(job, &executors, &out).await;
        cancels.remove(&command_id);
    }
}

/// Run one command: stream progress, then report the single result.
async fn process_job(
    job: CommandJob,
    executors: &Executors,
    out: &mpsc::UnboundedSender<WireFrame>,
) {
    let executor = match executors.select(job.execution_target) {
        Ok(executor) => executor,
        Err(e) => {
            // Forced executor missing: distinct error payload, no fallback.
            warn!(command_id = %job.command_id, error = %e, "no executor for requested target");
            let _ = out.send(result_frame(
                job.command_id,
                ExecutionOutcome {
                    exit_code: -1,
                    stdout: String::new(),
                    stderr: format!("executor unavailable: {e}"),
                    execution_type: unavailable_type(job.execution_target),
                    target: "unavailable".to_string(),
                    cancelled: false,
                },
            ));
            return;
        }
    };

    info!(
        command_id = %job.command_id,
        executor = %executor.kind(),
        target = %executor.target(),
        "executing command"
    );

    let (progress_tx, mut progress_rx) = mpsc::channel::<ProgressUpdate>(64);
    let forward_out = out.clone();
    let forward_id = job.command_id;
    let forwarder = tokio::spawn(async move {
        while let Some(update) = progress_rx.recv().await {
            let _ = forward_out.send(progress_frame(forward_id, update));
        }
    });

    let run = executor
        .run(&job.command, progress_tx, job.cancel.clone())
        .await;

    // The executor dropped its progress sender; drain the forwarder so the
    // result is the last frame for this command.
    let _ = forwarder.await;

    let outcome = match run {
        Ok(outcome) => outcome,
        Err(e) => {
            warn!(command_id = %job.command_id, error = %e, "executor error");
            ExecutionOutcome {
                exit_code: -1,
                stdout: String::new(),
                stderr: format!("execution error: {e}"),
                execution_type: executor.kind(),
                target: executor.target(),
                cancelled: false,
            }
        }
    };

    info!(
        command_id = %job.command_id,
        exit_code = outcome.exit_code,
        cancelled = outcome.cancelled,
        "command finished"
    );
    let _ = out.send(result_frame(job.command_id, outcome));
}

fn unavailable_type(target: ExecutionTarget) -> ExecutionType {
    match target {
        ExecutionTarget::Remote => ExecutionType::Remote,
        _ => ExecutionType::Local,
    }
}

fn progress_frame(command_id: Uuid, update: ProgressUpdate) -> WireFrame {
    let payload = CommandProgress {
        command_id,
        status: "running".to_string(),
        progress: update.progress,
        stdout_chunk: update.stdout_chunk,
        stderr_chunk: update.stderr_chunk,
        message: update.message,
        ts: update.ts,
    };
    WireFrame::event(
        events::COMMAND_PROGRESS,
        serde_json::to_value(payload).unwrap_or_default(),
    )
}

fn result_frame(command_id: Uuid, outcome: ExecutionOutcome) -> WireFrame {
    let payload = CommandResult {
        command_id,
        exit_code: outcome.exit_code,
        stdout: outcome.stdout,
        stderr: outcome.stderr,
        execution_type: outcome.execution_type,
        target: outcome.target,
        cancelled: outcome.cancelled,
        ts: Utc::now(),
    };
    WireFrame::event(
        events::COMMAND_RESULT,
        serde_json::to_value(payload).unwrap_or_default(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    struct Pool {
        job_tx: mpsc::Sender<CommandJob>,
        out_rx: mpsc::UnboundedReceiver<WireFrame>,
        cancels: Arc<DashMap<Uuid, CancellationToken>>,
    }

    fn start_pool(concurrency: usize) -> Pool {
        let executors = Arc::new(Executors {
            local: Arc::new(LocalExecutor::new()),
            remote: None,
        });
        let (job_tx, job_rx) = mpsc::channel(16);
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let cancels = Arc::new(DashMap::new());
        spawn_workers(
            concurrency,
            executors,
            Arc::new(Mutex::new(job_rx)),
            out_tx,
            Arc::clone(&cancels),
        );
        Pool {
            job_tx,
            out_rx,
            cancels,
        }
    }

    fn job(command: &str, target: ExecutionTarget) -> (CommandJob, Uuid) {
        let command_id = Uuid::new_v4();
        (
            CommandJob {
                command_id,
                command: command.to_string(),
                execution_target: target,
                cancel: CancellationToken::new(),
            },
            command_id,
        )
    }

    fn as_result(frame: &WireFrame) -> Option<CommandResult> {
        match frame {
            WireFrame::Event { event, data } if event == events::COMMAND_RESULT => {
                serde_json::from_value(data.clone()).ok()
            }
            _ => None,
        }
    }

    async fn collect_results(
        out_rx: &mut mpsc::UnboundedReceiver<WireFrame>,
        count: usize,
    ) -> Vec<CommandResult> {
        let mut results = Vec::new();
        while results.len() < count {
            let frame = tokio::time::timeout(Duration::from_secs(20), out_rx.recv())
                .await
                .expect("timed out waiting for frames")
                .expect("out channel closed");
            if let Some(result) = as_result(&frame) {
                results.push(result);
            }
        }
        results
    }

    #[tokio::test]
    async fn test_single_command_streams_then_reports_once() {
        let mut pool = start_pool(1);
        let (job, command_id) = job("echo hi", ExecutionTarget::Local);
        pool.job_tx.send(job).await.unwrap();

        let mut saw_progress_after_result = false;
        let mut results = 0;
        let mut progress_frames = 0;
        loop {
            let frame = tokio::time::timeout(Duration::from_secs(10), pool.out_rx.recv())
                .await
                .unwrap()
                .unwrap();
            match &frame {
                WireFrame::Event { event, .. } if event == events::COMMAND_PROGRESS => {
                    progress_frames += 1;
                    if results > 0 {
                        saw_progress_after_result = true;
                    }
                }
                WireFrame::Event { event, data } if event == events::COMMAND_RESULT => {
                    results += 1;
                    let result: CommandResult =
                        serde_json::from_value(data.clone()).unwrap();
                    assert_eq!(result.command_id, command_id);
                    assert_eq!(result.exit_code, 0);
                    assert_eq!(result.stdout, "hi\n");
                    break;
                }
                _ => {}
            }
        }
        assert_eq!(results, 1);
        assert!(progress_frames >= 1);
        assert!(!saw_progress_after_result, "terminal must be last");
    }

    #[tokio::test]
    async fn test_concurrent_workers_overlap_commands() {
        let mut pool = start_pool(2);
        let (slow, slow_id) = job("sleep 0.5; echo A", ExecutionTarget::Local);
        let (fast, fast_id) = job("echo B", ExecutionTarget::Local);
        pool.job_tx.send(slow).await.unwrap();
        pool.job_tx.send(fast).await.unwrap();

        let results = collect_results(&mut pool.out_rx, 2).await;
        // The fast command finishes first even though it was queued second.
        assert_eq!(results[0].command_id, fast_id);
        assert_eq!(results[0].stdout, "B\n");
        assert_eq!(results[1].command_id, slow_id);
        assert_eq!(results[1].stdout, "A\n");
    }

    #[tokio::test]
    async fn test_single_worker_serializes_commands() {
        let mut pool = start_pool(1);
        let (slow, slow_id) = job("sleep 0.3; echo A", ExecutionTarget::Local);
        let (fast, fast_id) = job("echo B", ExecutionTarget::Local);
        pool.job_tx.send(slow).await.unwrap();
        pool.job_tx.send(fast).await.unwrap();

        let results = collect_results(&mut pool.out_rx, 2).await;
        // FIFO: the first queued command completes first.
        assert_eq!(results[0].command_id, slow_id);
        assert_eq!(results[1].command_id, fast_id);
    }

    #[tokio::test]
    async fn test_forced_remote_without_executor_reports_distinct_failure() {
        let mut pool = start_pool(1);
        let (job, command_id) = job("echo hi", ExecutionTarget::Remote);
        pool.job_tx.send(job).await.unwrap();

        let results = collect_results(&mut pool.out_rx, 1).await;
        assert_eq!(results[0].command_id, command_id);
        assert_ne!(results[0].exit_code, 0);
        assert!(results[0].stderr.contains("executor unavailable"));
        assert_eq!(results[0].execution_type, ExecutionType::Remote);
    }

    #[tokio::test]
    async fn test_cancellation_reports_cancelled_result() {
        let mut pool = start_pool(1);
        let command_id = Uuid::new_v4();
        let cancel = CancellationToken::new();
        pool.cancels.insert(command_id, cancel.clone());
        pool.job_tx
            .send(CommandJob {
                command_id,
                command: "sleep 30".to_string(),
                execution_target: ExecutionTarget::Local,
                cancel: cancel.clone(),
            })
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(200)).await;
        cancel.cancel();

        let results = collect_results(&mut pool.out_rx, 1).await;
        assert!(results[0].cancelled);
        assert_ne!(results[0].exit_code, 0);
        // The cancel registry entry is cleaned up after processing.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!pool.cancels.contains_key(&command_id));
    }
}
