//! Command registry: in-flight and recently completed commands.
//!
//! The registry is the correlation store for a command across its lifetime.
//! Only the router mutates it; agent-origin events are inputs, never direct
//! writes. Status moves monotonically through the state machine:
//!
//! ```text
//! Pending ─dispatch→ Dispatched ─first_progress→ Running ─terminal→ Completed | Failed
//!    │                   │                           │
//!    │                   └────timeout / agent_loss→ Lost ←┘
//!    └─validation_fail / undeliverable→ Failed
//! ```
//!
//! Terminal records are retained up to a configured bound (evicted oldest
//! terminal first, O(1) per operation) so late arrivals can still be
//! correlated or reported missing.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use ogent_exec::{ExecutionOutcome, ExecutionTarget};
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::ai::CommandAnalysis;
use crate::error::{Error, Result};

/// Default retention bound for terminal commands.
pub const DEFAULT_RETENTION: usize = 1000;

/// Lifecycle states of a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandStatus {
    Pending,
    Dispatched,
    Running,
    Completed,
    Failed,
    Lost,
}

impl CommandStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Lost)
    }

    /// Whether the state machine allows the edge `self -> to`.
    fn allows(self, to: CommandStatus) -> bool {
        use CommandStatus::*;
        matches!(
            (self, to),
            (Pending, Dispatched)
                | (Pending, Failed)
                | (Dispatched, Running)
                | (Dispatched, Completed)
                | (Dispatched, Failed)
                | (Dispatched, Lost)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Lost)
        )
    }
}

impl std::fmt::Display for CommandStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Dispatched => write!(f, "dispatched"),
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Lost => write!(f, "lost"),
        }
    }
}

/// One command's correlation record.
#[derive(Debug, Clone, Serialize)]
pub struct CommandRecord {
    pub command_id: Uuid,
    pub agent_id: String,
    /// Identity the progress/result stream is routed back to. Immutable.
    pub requester_id: String,
    /// Command text as submitted by the requester.
    pub command_text: String,
    /// Command text after AI pre-processing, when it differs.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub processed_command: Option<String>,
    pub execution_target: ExecutionTarget,
    pub status: CommandStatus,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dispatched_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first_progress_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<ExecutionOutcome>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    /// AI pre-processing report, when the stage ran.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub analysis: Option<CommandAnalysis>,
    /// Progress frames that arrived after the terminal state.
    pub late_frames: u32,
}

struct Inner {
    commands: HashMap<Uuid, CommandRecord>,
    /// Terminal command ids ordered by terminal time (front = oldest).
    terminal_order: VecDeque<Uuid>,
}

/// In-memory command registry with bounded terminal retention.
pub struct CommandRegistry {
    inner: Mutex<Inner>,
    retention: usize,
}

impl CommandRegistry {
    pub fn new(retention: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                commands: HashMap::new(),
                terminal_order: VecDeque::new(),
            }),
            retention: retention.max(1),
        }
    }

    /// Create a new `Pending` command and return its id.
    pub fn create(
        &self,
        agent_id: &str,
        requester_id: &str,
        command_text: &str,
        execution_target: ExecutionTarget,
    ) -> Uuid {
        let command_id = Uuid::new_v4();
        let record = CommandRecord {
            command_id,
            agent_id: agent_id.to_string(),
            requester_id: requester_id.to_string(),
            command_text: command_text.to_string(),
            processed_command: None,
            execution_target,
            status: CommandStatus::Pending,
            created_at: Utc::now(),
            dispatched_at: None,
            first_progress_at: None,
            finished_at: None,
            result: None,
            failure_reason: None,
            analysis: None,
            late_frames: 0,
        };
        let mut inner = self.lock();
        inner.commands.insert(command_id, record);
        command_id
    }

    /// Attach the AI pre-processing report.
    pub fn attach_analysis(&self, command_id: Uuid, analysis: CommandAnalysis) -> Result<()> {
        let mut inner = self.lock();
        let record = Self::record_mut(&mut inner, command_id)?;
        if analysis.processed_command != record.command_text {
            record.processed_command = Some(analysis.processed_command.clone());
        }
        record.analysis = Some(analysis);
        Ok(())
    }

    /// `Pending -> Dispatched` after a successful emit.
    pub fn mark_dispatched(&self, command_id: Uuid) -> Result<CommandRecord> {
        let mut inner = self.lock();
        let record = Self::record_mut(&mut inner, command_id)?;
        Self::check_edge(record, CommandStatus::Dispatched)?;
        record.status = CommandStatus::Dispatched;
        record.dispatched_at = Some(Utc::now());
        Ok(record.clone())
    }

    /// `Dispatched -> Running` on the first progress frame.
    pub fn mark_running(&self, command_id: Uuid) -> Result<CommandRecord> {
        let mut inner = self.lock();
        let record = Self::record_mut(&mut inner, command_id)?;
        Self::check_edge(record, CommandStatus::Running)?;
        record.status = CommandStatus::Running;
        record.first_progress_at = Some(Utc::now());
        Ok(record.clone())
    }

    /// Terminal transition driven by an agent result. `Completed` when the
    /// command exited zero and was not cancelled, else `Failed`.
    pub fn complete(&self, command_id: Uuid, outcome: ExecutionOutcome) -> Result<CommandRecord> {
        let status = if outcome.cancelled {
            CommandStatus::Failed
        } else if outcome.exit_code == 0 {
            CommandStatus::Completed
        } else {
            CommandStatus::Failed
        };
        let reason = if outcome.cancelled {
            Some("cancelled".to_string())
        } else if outcome.exit_code != 0 {
            Some(format!("exit code {}", outcome.exit_code))
        } else {
            None
        };

        let mut inner = self.lock();
        let record = Self::record_mut(&mut inner, command_id)?;
        Self::check_edge(record, status)?;
        record.status = status;
        record.finished_at = Some(Utc::now());
        record.result = Some(outcome);
        record.failure_reason = reason;
        let snapshot = record.clone();
        self.retire(&mut inner, command_id);
        Ok(snapshot)
    }

    /// Terminal `Failed` with a reason (validation failure, undeliverable).
    pub fn fail(&self, command_id: Uuid, reason: &str) -> Result<CommandRecord> {
        let mut inner = self.lock();
        let record = Self::record_mut(&mut inner, command_id)?;
        Self::check_edge(record, CommandStatus::Failed)?;
        record.status = CommandStatus::Failed;
        record.finished_at = Some(Utc::now());
        record.failure_reason = Some(reason.to_string());
        let snapshot = record.clone();
        self.retire(&mut inner, command_id);
        Ok(snapshot)
    }

    /// Terminal `Lost`: the session dropped and the grace interval or the
    /// command deadline expired.
    pub fn mark_lost(&self, command_id: Uuid, reason: &str) -> Result<CommandRecord> {
        let mut inner = self.lock();
        let record = Self::record_mut(&mut inner, command_id)?;
        Self::check_edge(record, CommandStatus::Lost)?;
        record.status = CommandStatus::Lost;
        record.finished_at = Some(Utc::now());
        record.failure_reason = Some(reason.to_string());
        let snapshot = record.clone();
        self.retire(&mut inner, command_id);
        Ok(snapshot)
    }

    /// Count a progress frame that arrived after the terminal state. The
    /// record is otherwise untouched.
    pub fn note_late_frame(&self, command_id: Uuid) {
        let mut inner = self.lock();
        if let Some(record) = inner.commands.get_mut(&command_id) {
            record.late_frames += 1;
        }
    }

    /// Store a result that arrived after the command was already terminal
    /// (e.g. after `Lost`). Does not re-transition.
    pub fn record_late_result(&self, command_id: Uuid, outcome: ExecutionOutcome) {
        let mut inner = self.lock();
        if let Some(record) = inner.commands.get_mut(&command_id) {
            debug!(command_id = %command_id, status = %record.status, "recording late result");
            if record.result.is_none() {
                record.result = Some(outcome);
            }
        }
    }

    /// Snapshot of a command.
    pub fn get(&self, command_id: Uuid) -> Result<CommandRecord> {
        self.lock()
            .commands
            .get(&command_id)
            .cloned()
            .ok_or(Error::CommandNotFound(command_id))
    }

    /// Ids of non-terminal commands targeting `agent_id`.
    pub fn inflight_for_agent(&self, agent_id: &str) -> Vec<Uuid> {
        self.lock()
            .commands
            .values()
            .filter(|c| c.agent_id == agent_id && !c.status.is_terminal())
            .map(|c| c.command_id)
            .collect()
    }

    /// Recent commands for an agent, most recent first.
    pub fn list_by_agent(&self, agent_id: &str, limit: usize) -> Vec<CommandRecord> {
        self.list_filtered(|c| c.agent_id == agent_id, limit)
    }

    /// Recent commands for a requester, most recent first.
    pub fn list_by_requester(&self, requester_id: &str, limit: usize) -> Vec<CommandRecord> {
        self.list_filtered(|c| c.requester_id == requester_id, limit)
    }

    /// Remove a command unconditionally.
    pub fn delete(&self, command_id: Uuid) {
        let mut inner = self.lock();
        inner.commands.remove(&command_id);
        inner.terminal_order.retain(|id| *id != command_id);
    }

    pub fn len(&self) -> usize {
        self.lock().commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn list_filtered(
        &self,
        filter: impl Fn(&CommandRecord) -> bool,
        limit: usize,
    ) -> Vec<CommandRecord> {
        let inner = self.lock();
        let mut matches: Vec<_> = inner.commands.values().filter(|c| filter(c)).cloned().collect();
        // Most recent first; ties broken by id so the order is stable.
        matches.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| a.command_id.to_string().cmp(&b.command_id.to_string()))
        });
        matches.truncate(limit);
        matches
    }

    fn retire(&self, inner: &mut Inner, command_id: Uuid) {
        inner.terminal_order.push_back(command_id);
        while inner.terminal_order.len() > self.retention {
            if let Some(oldest) = inner.terminal_order.pop_front() {
                inner.commands.remove(&oldest);
            }
        }
    }

    fn record_mut(inner: &mut Inner, command_id: Uuid) -> Result<&mut CommandRecord> {
        inner
            .commands
            .get_mut(&command_id)
            .ok_or(Error::CommandNotFound(command_id))
    }

    fn check_edge(record: &CommandRecord, to: CommandStatus) -> Result<()> {
        if record.status.allows(to) {
            Ok(())
        } else {
            Err(Error::InvalidTransition {
                from: record.status,
                to,
            })
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for CommandRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_RETENTION)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ogent_exec::ExecutionType;

    fn outcome(exit_code: i32) -> ExecutionOutcome {
        ExecutionOutcome {
            exit_code,
            stdout: String::new(),
            stderr: String::new(),
            execution_type: ExecutionType::Local,
            target: "host-1".to_string(),
            cancelled: false,
        }
    }

    fn create(registry: &CommandRegistry) -> Uuid {
        registry.create("agent-1", "user-1", "echo hi", ExecutionTarget::Local)
    }

    #[test]
    fn test_happy_path_transitions() {
        let registry = CommandRegistry::default();
        let id = create(&registry);
        assert_eq!(registry.get(id).unwrap().status, CommandStatus::Pending);

        registry.mark_dispatched(id).unwrap();
        registry.mark_running(id).unwrap();
        let record = registry.complete(id, outcome(0)).unwrap();
        assert_eq!(record.status, CommandStatus::Completed);
        assert!(record.finished_at.is_some());
        assert!(record.failure_reason.is_none());
    }

    #[test]
    fn test_nonzero_exit_fails() {
        let registry = CommandRegistry::default();
        let id = create(&registry);
        registry.mark_dispatched(id).unwrap();
        let record = registry.complete(id, outcome(2)).unwrap();
        assert_eq!(record.status, CommandStatus::Failed);
        assert_eq!(record.failure_reason.as_deref(), Some("exit code 2"));
    }

    #[test]
    fn test_cancelled_outcome_fails_with_cancelled_reason() {
        let registry = CommandRegistry::default();
        let id = create(&registry);
        registry.mark_dispatched(id).unwrap();
        let mut cancelled = outcome(-1);
        cancelled.cancelled = true;
        let record = registry.complete(id, cancelled).unwrap();
        assert_eq!(record.status, CommandStatus::Failed);
        assert_eq!(record.failure_reason.as_deref(), Some("cancelled"));
    }

    #[test]
    fn test_result_before_any_progress_is_allowed() {
        let registry = CommandRegistry::default();
        let id = create(&registry);
        registry.mark_dispatched(id).unwrap();
        // No mark_running: Dispatched -> Completed directly.
        let record = registry.complete(id, outcome(0)).unwrap();
        assert_eq!(record.status, CommandStatus::Completed);
        assert!(record.first_progress_at.is_none());
    }

    #[test]
    fn test_status_never_regresses() {
        let registry = CommandRegistry::default();
        let id = create(&registry);
        registry.mark_dispatched(id).unwrap();
        registry.mark_running(id).unwrap();
        registry.complete(id, outcome(0)).unwrap();

        assert!(matches!(
            registry.mark_dispatched(id),
            Err(Error::InvalidTransition { .. })
        ));
        assert!(matches!(
            registry.mark_running(id),
            Err(Error::InvalidTransition { .. })
        ));
        assert!(matches!(
            registry.complete(id, outcome(0)),
            Err(Error::InvalidTransition { .. })
        ));
        assert!(matches!(
            registry.mark_lost(id, "late"),
            Err(Error::InvalidTransition { .. })
        ));
    }

    #[test]
    fn test_running_requires_dispatch() {
        let registry = CommandRegistry::default();
        let id = create(&registry);
        assert!(matches!(
            registry.mark_running(id),
            Err(Error::InvalidTransition { .. })
        ));
    }

    #[test]
    fn test_pending_can_fail_directly() {
        let registry = CommandRegistry::default();
        let id = create(&registry);
        let record = registry.fail(id, "undeliverable: agent not registered").unwrap();
        assert_eq!(record.status, CommandStatus::Failed);
        assert!(record
            .failure_reason
            .as_deref()
            .unwrap()
            .starts_with("undeliverable"));
    }

    #[test]
    fn test_lost_from_dispatched_and_running() {
        let registry = CommandRegistry::default();
        let a = create(&registry);
        registry.mark_dispatched(a).unwrap();
        assert_eq!(
            registry.mark_lost(a, "session dropped").unwrap().status,
            CommandStatus::Lost
        );

        let b = create(&registry);
        registry.mark_dispatched(b).unwrap();
        registry.mark_running(b).unwrap();
        assert_eq!(
            registry.mark_lost(b, "deadline").unwrap().status,
            CommandStatus::Lost
        );
    }

    #[test]
    fn test_late_frames_counted_without_mutation() {
        let registry = CommandRegistry::default();
        let id = create(&registry);
        registry.mark_dispatched(id).unwrap();
        registry.complete(id, outcome(0)).unwrap();

        registry.note_late_frame(id);
        registry.note_late_frame(id);
        let record = registry.get(id).unwrap();
        assert_eq!(record.late_frames, 2);
        assert_eq!(record.status, CommandStatus::Completed);
    }

    #[test]
    fn test_late_result_after_lost_does_not_retransition() {
        let registry = CommandRegistry::default();
        let id = create(&registry);
        registry.mark_dispatched(id).unwrap();
        registry.mark_lost(id, "grace expired").unwrap();

        registry.record_late_result(id, outcome(0));
        let record = registry.get(id).unwrap();
        assert_eq!(record.status, CommandStatus::Lost);
        assert!(record.result.is_some());
    }

    #[test]
    fn test_retention_evicts_oldest_terminal() {
        let registry = CommandRegistry::new(2);
        let ids: Vec<Uuid> = (0..3)
            .map(|_| {
                let id = create(&registry);
                registry.mark_dispatched(id).unwrap();
                registry.complete(id, outcome(0)).unwrap();
                id
            })
            .collect();

        assert!(matches!(
            registry.get(ids[0]),
            Err(Error::CommandNotFound(_))
        ));
        assert!(registry.get(ids[1]).is_ok());
        assert!(registry.get(ids[2]).is_ok());
    }

    #[test]
    fn test_retention_ignores_inflight_commands() {
        let registry = CommandRegistry::new(1);
        let inflight = create(&registry);
        registry.mark_dispatched(inflight).unwrap();

        for _ in 0..3 {
            let id = create(&registry);
            registry.mark_dispatched(id).unwrap();
            registry.complete(id, outcome(0)).unwrap();
        }
        // The in-flight command is never evicted by retention.
        assert!(registry.get(inflight).is_ok());
    }

    #[test]
    fn test_list_by_requester_most_recent_first() {
        let registry = CommandRegistry::default();
        let first = registry.create("agent-1", "user-1", "one", ExecutionTarget::Local);
        std::thread::sleep(std::time::Duration::from_millis(5));
        let second = registry.create("agent-2", "user-1", "two", ExecutionTarget::Local);
        registry.create("agent-1", "user-2", "other", ExecutionTarget::Local);

        let listed = registry.list_by_requester("user-1", 10);
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].command_id, second);
        assert_eq!(listed[1].command_id, first);

        let limited = registry.list_by_requester("user-1", 1);
        assert_eq!(limited.len(), 1);
        assert_eq!(limited[0].command_id, second);
    }

    #[test]
    fn test_inflight_for_agent_excludes_terminal() {
        let registry = CommandRegistry::default();
        let a = create(&registry);
        registry.mark_dispatched(a).unwrap();
        let b = create(&registry);
        registry.mark_dispatched(b).unwrap();
        registry.complete(b, outcome(0)).unwrap();

        let inflight = registry.inflight_for_agent("agent-1");
        assert_eq!(inflight, vec![a]);
    }

    #[test]
    fn test_delete_removes_record() {
        let registry = CommandRegistry::default();
        let id = create(&registry);
        registry.delete(id);
        assert!(registry.get(id).is_err());
    }
}
