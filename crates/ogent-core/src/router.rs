//! Command router: accepts requests, applies the optional AI stage,
//! resolves the target agent, dispatches over the event protocol, and fans
//! progress and the single terminal outcome back to the requester.
//!
//! The router is the only writer of the command state machine. Agent-origin
//! events are inputs; disconnects and deadlines drive the `Lost` path.
//! Every accepted command produces exactly one requester-visible terminal
//! event: `command_result`, `command_failed`, or `command_lost`.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use ogent_exec::{ExecutionOutcome, ExecutionTarget};
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::agents::{AgentRecord, AgentRegistry};
use crate::ai::{AiManager, Preprocessed};
use crate::commands::{CommandRecord, CommandRegistry, CommandStatus};
use crate::error::{Error, Result};
use crate::events::{CommandEvent, EventBus};
use crate::protocol::{
    events, AgentInfo, CancelCommand, CommandProgress, CommandResult, ExecuteCommand, WireFrame,
};
use crate::sessions::SessionManager;

/// Router timing knobs.
#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// Overall per-command deadline.
    pub command_deadline: Duration,
    /// How long to wait after a session drop (or a deadline cancel) before
    /// declaring bound commands lost.
    pub grace_interval: Duration,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            command_deadline: Duration::from_secs(300),
            grace_interval: Duration::from_secs(30),
        }
    }
}

/// A command execution request from a requester.
#[derive(Debug, Clone, Deserialize)]
pub struct ExecuteRequest {
    pub command: String,
    #[serde(default)]
    pub execution_target: ExecutionTarget,
    #[serde(default)]
    pub use_ai: bool,
    #[serde(default)]
    pub system: Option<String>,
    #[serde(default)]
    pub context: Option<String>,
}

/// The controller-side command router.
pub struct Router {
    agents: Arc<AgentRegistry>,
    commands: Arc<CommandRegistry>,
    sessions: Arc<SessionManager>,
    ai: Arc<AiManager>,
    bus: EventBus,
    config: RouterConfig,
}

impl Router {
    pub fn new(
        agents: Arc<AgentRegistry>,
        commands: Arc<CommandRegistry>,
        sessions: Arc<SessionManager>,
        ai: Arc<AiManager>,
        bus: EventBus,
        config: RouterConfig,
    ) -> Self {
        Self {
            agents,
            commands,
            sessions,
            ai,
            bus,
            config,
        }
    }

    pub fn agents(&self) -> &Arc<AgentRegistry> {
        &self.agents
    }

    pub fn commands(&self) -> &Arc<CommandRegistry> {
        &self.commands
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    pub fn ai(&self) -> &Arc<AiManager> {
        &self.ai
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    /// Bind an agent registration to a session. A stale session holding the
    /// same agent id is closed. Subscribers see `agent_connected`.
    pub fn register_agent(
        &self,
        session_id: Uuid,
        agent_id: Option<String>,
        info: AgentInfo,
    ) -> AgentRecord {
        let (record, evicted) = self.agents.register(session_id, agent_id, info);
        if let Some(stale) = evicted {
            self.sessions.close(stale);
        }
        self.bus.publish(CommandEvent::broadcast(WireFrame::event(
            events::AGENT_CONNECTED,
            json!({
                "agent_id": record.agent_id,
                "session_id": record.session_id,
                "connected_at": record.connected_at,
                "info": record.info,
            }),
        )));
        record
    }

    /// Merge an `agent_info` capability update.
    pub fn handle_agent_info(&self, session_id: Uuid, info: AgentInfo) {
        match self.agents.by_session(session_id) {
            Some(agent) => {
                let _ = self.agents.update_info(&agent.agent_id, info);
            }
            None => warn!(session_id = %session_id, "agent_info from unregistered session"),
        }
    }

    /// Accept and dispatch a command. The returned record is the accept
    /// envelope; when acceptance itself fails (unknown agent, unsafe
    /// command) the record is already terminal and the requester has been
    /// given its single terminal event.
    pub async fn execute(
        &self,
        requester_id: &str,
        agent_id: &str,
        request: ExecuteRequest,
    ) -> Result<CommandRecord> {
        let command_id = self.commands.create(
            agent_id,
            requester_id,
            &request.command,
            request.execution_target,
        );
        info!(
            command_id = %command_id,
            agent_id = %agent_id,
            requester = %requester_id,
            use_ai = request.use_ai,
            "command accepted"
        );

        // Optional AI stage.
        let mut dispatch_text = request.command.clone();
        if request.use_ai {
            let system = request.system.as_deref().unwrap_or("Linux");
            let context = request
                .context
                .as_deref()
                .unwrap_or("server administration");
            match self.ai.preprocess(&request.command, system, context).await {
                Preprocessed::Dispatch { command, analysis } => {
                    if let Some(analysis) = analysis {
                        self.commands.attach_analysis(command_id, analysis)?;
                    }
                    dispatch_text = command;
                }
                Preprocessed::Reject { analysis } => {
                    self.commands.attach_analysis(command_id, analysis)?;
                    return self.fail_command(command_id, "rejected by command validation");
                }
                Preprocessed::Fail { reason } => {
                    return self.fail_command(command_id, &reason);
                }
            }
        }

        // Resolve the target agent's live session.
        let agent = match self.agents.get(agent_id) {
            Ok(agent) => agent,
            Err(_) => {
                return self.fail_command(
                    command_id,
                    &format!("undeliverable: agent {agent_id} is not registered"),
                );
            }
        };

        // At-most-once dispatch: one emit per command id.
        let frame = WireFrame::event(
            events::EXECUTE_COMMAND,
            serde_json::to_value(ExecuteCommand {
                command_id,
                command: dispatch_text,
                execution_target: request.execution_target,
                requester_sid: requester_id.to_string(),
            })
            .map_err(|e| Error::Internal(e.to_string()))?,
        );
        if let Err(e) = self.sessions.send(agent.session_id, frame) {
            warn!(command_id = %command_id, agent_id = %agent_id, error = %e, "emit failed");
            return self.fail_command(command_id, "undeliverable: send to agent session failed");
        }

        let record = self.commands.mark_dispatched(command_id)?;
        self.spawn_deadline(command_id);
        Ok(record)
    }

    /// Agent-origin progress frame.
    pub fn handle_progress(&self, session_id: Uuid, progress: CommandProgress) {
        let record = match self.commands.get(progress.command_id) {
            Ok(record) => record,
            Err(_) => {
                debug!(command_id = %progress.command_id, "progress for unknown command, dropping");
                return;
            }
        };
        if !self.session_owns_command(session_id, &record) {
            debug!(
                command_id = %record.command_id,
                session_id = %session_id,
                "progress from a session not bound to the command's agent, dropping"
            );
            return;
        }
        if record.status.is_terminal() {
            self.commands.note_late_frame(record.command_id);
            return;
        }
        if record.status == CommandStatus::Dispatched {
            // A result may have raced us; the failed edge is harmless.
            let _ = self.commands.mark_running(record.command_id);
        }

        if let Ok(data) = serde_json::to_value(&progress) {
            self.bus.publish(CommandEvent::for_requester(
                record.requester_id,
                WireFrame::event(events::COMMAND_PROGRESS, data),
            ));
        }
    }

    /// Agent-origin terminal result.
    pub fn handle_result(&self, session_id: Uuid, result: CommandResult) {
        let record = match self.commands.get(result.command_id) {
            Ok(record) => record,
            Err(_) => {
                warn!(command_id = %result.command_id, "result for unknown command, dropping");
                return;
            }
        };
        if !self.session_owns_command(session_id, &record) {
            warn!(
                command_id = %record.command_id,
                session_id = %session_id,
                "result from a session not bound to the command's agent, dropping"
            );
            return;
        }

        let outcome = ExecutionOutcome {
            exit_code: result.exit_code,
            stdout: result.stdout.clone(),
            stderr: result.stderr.clone(),
            execution_type: result.execution_type,
            target: result.target.clone(),
            cancelled: result.cancelled,
        };

        if record.status.is_terminal() {
            // Late report after Lost: record it, never re-transition, never
            // hand the requester a second terminal.
            info!(command_id = %record.command_id, status = %record.status, "late result after terminal");
            self.commands.record_late_result(record.command_id, outcome);
            return;
        }

        match self.commands.complete(record.command_id, outcome) {
            Ok(terminal) => {
                info!(
                    command_id = %terminal.command_id,
                    status = %terminal.status,
                    exit_code = result.exit_code,
                    "command finished"
                );
                if let Ok(mut data) = serde_json::to_value(&result) {
                    data["status"] = json!(terminal.status);
                    self.bus.publish(CommandEvent::for_requester(
                        terminal.requester_id,
                        WireFrame::event(events::COMMAND_RESULT, data),
                    ));
                }
            }
            Err(Error::InvalidTransition { .. }) => {
                self.commands.record_late_result(record.command_id, ExecutionOutcome {
                    exit_code: result.exit_code,
                    stdout: result.stdout,
                    stderr: result.stderr,
                    execution_type: result.execution_type,
                    target: result.target,
                    cancelled: result.cancelled,
                });
            }
            Err(e) => warn!(command_id = %record.command_id, error = %e, "result ingestion failed"),
        }
    }

    /// A transport session went away. Unbinds the agent (unless a newer
    /// session already replaced it) and starts the grace sweep over its
    /// in-flight commands.
    pub fn handle_session_closed(&self, session_id: Uuid) {
        self.sessions.close(session_id);
        let Some(agent) = self.agents.unregister_session(session_id) else {
            return;
        };
        info!(agent_id = %agent.agent_id, session_id = %session_id, "agent session lost");
        self.bus.publish(CommandEvent::broadcast(WireFrame::event(
            events::AGENT_DISCONNECTED,
            json!({
                "agent_id": agent.agent_id,
                "session_id": session_id,
                "disconnected_at": Utc::now(),
            }),
        )));

        let inflight = self.commands.inflight_for_agent(&agent.agent_id);
        if inflight.is_empty() {
            return;
        }

        let agents = Arc::clone(&self.agents);
        let commands = Arc::clone(&self.commands);
        let bus = self.bus.clone();
        let grace = self.config.grace_interval;
        let agent_id = agent.agent_id;
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            for command_id in inflight {
                let Ok(record) = commands.get(command_id) else {
                    continue;
                };
                if record.status.is_terminal() {
                    continue;
                }
                // A reconnect within grace keeps the command alive; the
                // per-command deadline still bounds it.
                if agents.get(&agent_id).is_ok() {
                    continue;
                }
                match commands.mark_lost(command_id, "agent session lost") {
                    Ok(lost) => publish_lost(&bus, &lost),
                    Err(_) => continue,
                }
            }
        });
    }

    /// Operator cancellation: forward `cancel_command` to the bound
    /// session. The terminal outcome arrives as a cancelled result or via
    /// the deadline path.
    pub fn cancel(&self, command_id: Uuid) -> Result<()> {
        let record = self.commands.get(command_id)?;
        if record.status.is_terminal() {
            return Ok(());
        }
        let agent = self.agents.get(&record.agent_id)?;
        self.sessions.send(
            agent.session_id,
            cancel_frame(command_id).map_err(|e| Error::Internal(e.to_string()))?,
        )
    }

    fn session_owns_command(&self, session_id: Uuid, record: &CommandRecord) -> bool {
        self.agents
            .by_session(session_id)
            .map(|agent| agent.agent_id == record.agent_id)
            .unwrap_or(false)
    }

    /// Terminal failure originating at the router (validation, routing).
    fn fail_command(&self, command_id: Uuid, reason: &str) -> Result<CommandRecord> {
        let record = self.commands.fail(command_id, reason)?;
        info!(command_id = %command_id, reason = %reason, "command failed before dispatch");
        let mut data = json!({
            "command_id": record.command_id,
            "status": record.status,
            "reason": reason,
        });
        if let Some(analysis) = &record.analysis {
            data["analysis"] = serde_json::to_value(analysis).unwrap_or_default();
        }
        self.bus.publish(CommandEvent::for_requester(
            record.requester_id.clone(),
            WireFrame::event(events::COMMAND_FAILED, data),
        ));
        Ok(record)
    }

    /// Per-command overall deadline: on expiry, ask the agent to cancel,
    /// then declare the command lost after the grace window.
    fn spawn_deadline(&self, command_id: Uuid) {
        let agents = Arc::clone(&self.agents);
        let commands = Arc::clone(&self.commands);
        let sessions = Arc::clone(&self.sessions);
        let bus = self.bus.clone();
        let deadline = self.config.command_deadline;
        let grace = self.config.grace_interval;

        tokio::spawn(async move {
            tokio::time::sleep(deadline).await;
            let Ok(record) = commands.get(command_id) else {
                return;
            };
            if record.status.is_terminal() {
                return;
            }
            warn!(command_id = %command_id, "command deadline expired, cancelling");
            if let Ok(agent) = agents.get(&record.agent_id) {
                if let Ok(frame) = cancel_frame(command_id) {
                    let _ = sessions.send(agent.session_id, frame);
                }
            }

            tokio::time::sleep(grace).await;
            let Ok(record) = commands.get(command_id) else {
                return;
            };
            if record.status.is_terminal() {
                return;
            }
            if let Ok(lost) = commands.mark_lost(command_id, "deadline exceeded") {
                publish_lost(&bus, &lost);
            }
        });
    }
}

fn cancel_frame(command_id: Uuid) -> std::result::Result<WireFrame, serde_json::Error> {
    Ok(WireFrame::event(
        events::CANCEL_COMMAND,
        serde_json::to_value(CancelCommand { command_id })?,
    ))
}

fn publish_lost(bus: &EventBus, record: &CommandRecord) {
    warn!(command_id = %record.command_id, "command lost");
    bus.publish(CommandEvent::for_requester(
        record.requester_id.clone(),
        WireFrame::event(
            events::COMMAND_LOST,
            json!({
                "command_id": record.command_id,
                "status": record.status,
                "reason": record.failure_reason,
            }),
        ),
    ));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ai::{AiPolicy, RuleBasedBackend};
    use crate::sessions::SessionKind;
    use ogent_exec::ExecutionType;
    use tokio::sync::broadcast;
    use tokio::sync::mpsc::UnboundedReceiver;

    struct Harness {
        router: Arc<Router>,
        bus_rx: broadcast::Receiver<CommandEvent>,
    }

    fn harness(config: RouterConfig) -> Harness {
        harness_with_ai(config, AiManager::disabled())
    }

    fn harness_with_ai(config: RouterConfig, ai: AiManager) -> Harness {
        let bus = EventBus::new(64);
        let bus_rx = bus.subscribe();
        let router = Arc::new(Router::new(
            Arc::new(AgentRegistry::new()),
            Arc::new(CommandRegistry::default()),
            Arc::new(SessionManager::new()),
            Arc::new(ai),
            bus,
            config,
        ));
        Harness { router, bus_rx }
    }

    /// Register a fake live agent: a session whose outbound frames land in
    /// the returned receiver.
    fn connect_agent(router: &Router, agent_id: &str) -> (Uuid, UnboundedReceiver<WireFrame>) {
        let session_id = Uuid::new_v4();
        let rx = router
            .sessions()
            .register(session_id, SessionKind::Agent, agent_id);
        router.register_agent(session_id, Some(agent_id.to_string()), AgentInfo::default());
        (session_id, rx)
    }

    fn request(command: &str, use_ai: bool) -> ExecuteRequest {
        ExecuteRequest {
            command: command.to_string(),
            execution_target: ExecutionTarget::Local,
            use_ai,
            system: None,
            context: None,
        }
    }

    fn result_payload(command_id: Uuid, exit_code: i32) -> CommandResult {
        CommandResult {
            command_id,
            exit_code,
            stdout: "hi\n".to_string(),
            stderr: String::new(),
            execution_type: ExecutionType::Local,
            target: "host-1".to_string(),
            cancelled: false,
            ts: Utc::now(),
        }
    }

    fn progress_payload(command_id: Uuid) -> CommandProgress {
        CommandProgress {
            command_id,
            status: "running".to_string(),
            progress: None,
            stdout_chunk: Some("hi\n".to_string()),
            stderr_chunk: None,
            message: None,
            ts: Utc::now(),
        }
    }

    /// Drain the bus, skipping broadcast (presence) events, until a
    /// requester-addressed event arrives.
    async fn next_requester_event(rx: &mut broadcast::Receiver<CommandEvent>) -> CommandEvent {
        loop {
            let event = rx.recv().await.unwrap();
            if event.requester_id.is_some() {
                return event;
            }
        }
    }

    fn event_name(frame: &WireFrame) -> &str {
        match frame {
            WireFrame::Event { event, .. } => event,
            _ => panic!("expected event frame"),
        }
    }

    #[tokio::test]
    async fn test_dispatch_progress_result_flow() {
        let mut h = harness(RouterConfig::default());
        let (session_id, mut agent_rx) = connect_agent(&h.router, "agent-1");

        let record = h
            .router
            .execute("user-1", "agent-1", request("echo hi", false))
            .await
            .unwrap();
        assert_eq!(record.status, CommandStatus::Dispatched);

        // The agent session received exactly one execute_command.
        let frame = agent_rx.recv().await.unwrap();
        assert_eq!(event_name(&frame), events::EXECUTE_COMMAND);

        h.router
            .handle_progress(session_id, progress_payload(record.command_id));
        assert_eq!(
            h.router.commands().get(record.command_id).unwrap().status,
            CommandStatus::Running
        );

        h.router
            .handle_result(session_id, result_payload(record.command_id, 0));
        let finished = h.router.commands().get(record.command_id).unwrap();
        assert_eq!(finished.status, CommandStatus::Completed);
        assert_eq!(finished.result.as_ref().unwrap().stdout, "hi\n");

        // Requester saw progress then exactly one terminal.
        let progress = next_requester_event(&mut h.bus_rx).await;
        assert_eq!(event_name(&progress.frame), events::COMMAND_PROGRESS);
        let terminal = next_requester_event(&mut h.bus_rx).await;
        assert_eq!(event_name(&terminal.frame), events::COMMAND_RESULT);
        assert_eq!(terminal.requester_id.as_deref(), Some("user-1"));
        assert!(h.bus_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_result_before_progress_completes_directly() {
        let mut h = harness(RouterConfig::default());
        let (session_id, _agent_rx) = connect_agent(&h.router, "agent-1");

        let record = h
            .router
            .execute("user-1", "agent-1", request("true", false))
            .await
            .unwrap();
        h.router
            .handle_result(session_id, result_payload(record.command_id, 0));

        assert_eq!(
            h.router.commands().get(record.command_id).unwrap().status,
            CommandStatus::Completed
        );
        let terminal = next_requester_event(&mut h.bus_rx).await;
        assert_eq!(event_name(&terminal.frame), events::COMMAND_RESULT);
    }

    #[tokio::test]
    async fn test_undeliverable_when_no_agent() {
        let mut h = harness(RouterConfig::default());

        let record = h
            .router
            .execute("user-1", "agent-ghost", request("echo hi", false))
            .await
            .unwrap();
        assert_eq!(record.status, CommandStatus::Failed);
        assert!(record
            .failure_reason
            .as_deref()
            .unwrap()
            .starts_with("undeliverable"));

        let terminal = next_requester_event(&mut h.bus_rx).await;
        assert_eq!(event_name(&terminal.frame), events::COMMAND_FAILED);
        assert!(h.bus_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_unsafe_command_rejected_without_dispatch() {
        let ai = AiManager::new(
            Some(Arc::new(RuleBasedBackend::new())),
            AiPolicy::default(),
        );
        let mut h = harness_with_ai(RouterConfig::default(), ai);
        let (_session_id, mut agent_rx) = connect_agent(&h.router, "agent-1");

        let record = h
            .router
            .execute("user-1", "agent-1", request("rm -rf /", true))
            .await
            .unwrap();
        assert_eq!(record.status, CommandStatus::Failed);
        assert!(record.analysis.is_some());
        assert!(!record.analysis.as_ref().unwrap().validation.safe);

        // No agent interaction at all.
        assert!(agent_rx.try_recv().is_err());

        let terminal = next_requester_event(&mut h.bus_rx).await;
        match &terminal.frame {
            WireFrame::Event { event, data } => {
                assert_eq!(event, events::COMMAND_FAILED);
                assert!(data.get("analysis").is_some());
            }
            _ => panic!("expected event"),
        }
    }

    #[tokio::test]
    async fn test_failed_exit_code_fails_command() {
        let h = harness(RouterConfig::default());
        let (session_id, _agent_rx) = connect_agent(&h.router, "agent-1");

        let record = h
            .router
            .execute("user-1", "agent-1", request("false", false))
            .await
            .unwrap();
        h.router
            .handle_result(session_id, result_payload(record.command_id, 1));
        assert_eq!(
            h.router.commands().get(record.command_id).unwrap().status,
            CommandStatus::Failed
        );
    }

    #[tokio::test]
    async fn test_frames_from_unbound_session_are_dropped() {
        let h = harness(RouterConfig::default());
        let (_session_id, _agent_rx) = connect_agent(&h.router, "agent-1");

        let record = h
            .router
            .execute("user-1", "agent-1", request("echo hi", false))
            .await
            .unwrap();

        // A session bound to a different agent cannot move the command.
        let (other_session, _other_rx) = connect_agent(&h.router, "agent-2");
        h.router
            .handle_progress(other_session, progress_payload(record.command_id));
        h.router
            .handle_result(other_session, result_payload(record.command_id, 0));

        assert_eq!(
            h.router.commands().get(record.command_id).unwrap().status,
            CommandStatus::Dispatched
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_grace_expiry_marks_inflight_lost() {
        let config = RouterConfig {
            command_deadline: Duration::from_secs(300),
            grace_interval: Duration::from_secs(30),
        };
        let mut h = harness(config);
        let (session_id, _agent_rx) = connect_agent(&h.router, "agent-1");

        let record = h
            .router
            .execute("user-1", "agent-1", request("sleep 999", false))
            .await
            .unwrap();

        h.router.handle_session_closed(session_id);

        // Grace has not expired yet.
        tokio::time::sleep(Duration::from_secs(29)).await;
        assert_eq!(
            h.router.commands().get(record.command_id).unwrap().status,
            CommandStatus::Dispatched
        );

        tokio::time::sleep(Duration::from_secs(2)).await;
        let lost = h.router.commands().get(record.command_id).unwrap();
        assert_eq!(lost.status, CommandStatus::Lost);

        // Exactly one terminal event for the requester.
        let mut terminals = 0;
        while let Ok(event) = h.bus_rx.try_recv() {
            if event.requester_id.is_some() && event_name(&event.frame) == events::COMMAND_LOST {
                terminals += 1;
            }
        }
        assert_eq!(terminals, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_within_grace_keeps_command_alive() {
        let config = RouterConfig {
            command_deadline: Duration::from_secs(300),
            grace_interval: Duration::from_secs(30),
        };
        let h = harness(config);
        let (session_id, _agent_rx) = connect_agent(&h.router, "agent-1");

        let record = h
            .router
            .execute("user-1", "agent-1", request("sleep 5", false))
            .await
            .unwrap();
        h.router.handle_session_closed(session_id);

        // Agent reconnects with the same id before grace expires.
        tokio::time::sleep(Duration::from_secs(10)).await;
        let (new_session, _new_rx) = connect_agent(&h.router, "agent-1");

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(
            h.router.commands().get(record.command_id).unwrap().status,
            CommandStatus::Dispatched
        );

        // The result arrives on the new session and terminates the command.
        h.router
            .handle_result(new_session, result_payload(record.command_id, 0));
        assert_eq!(
            h.router.commands().get(record.command_id).unwrap().status,
            CommandStatus::Completed
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_result_after_lost_is_recorded_not_retransitioned() {
        let config = RouterConfig {
            command_deadline: Duration::from_secs(300),
            grace_interval: Duration::from_secs(5),
        };
        let mut h = harness(config);
        let (session_id, _agent_rx) = connect_agent(&h.router, "agent-1");

        let record = h
            .router
            .execute("user-1", "agent-1", request("slow", false))
            .await
            .unwrap();
        h.router.handle_session_closed(session_id);
        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(
            h.router.commands().get(record.command_id).unwrap().status,
            CommandStatus::Lost
        );

        // Drain everything seen so far, then deliver the late result.
        while h.bus_rx.try_recv().is_ok() {}
        let (new_session, _new_rx) = connect_agent(&h.router, "agent-1");
        h.router
            .handle_result(new_session, result_payload(record.command_id, 0));

        let refreshed = h.router.commands().get(record.command_id).unwrap();
        assert_eq!(refreshed.status, CommandStatus::Lost);
        assert!(refreshed.result.is_some());

        // No second requester-visible terminal.
        let mut requester_events = 0;
        while let Ok(event) = h.bus_rx.try_recv() {
            if event.requester_id.is_some() {
                requester_events += 1;
            }
        }
        assert_eq!(requester_events, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_cancels_then_marks_lost() {
        let config = RouterConfig {
            command_deadline: Duration::from_secs(2),
            grace_interval: Duration::from_secs(3),
        };
        let h = harness(config);
        let (_session_id, mut agent_rx) = connect_agent(&h.router, "agent-1");

        let record = h
            .router
            .execute("user-1", "agent-1", request("sleep 9999", false))
            .await
            .unwrap();

        // Skip the dispatch frame.
        let first = agent_rx.recv().await.unwrap();
        assert_eq!(event_name(&first), events::EXECUTE_COMMAND);

        // Deadline expiry emits cancel_command.
        tokio::time::sleep(Duration::from_secs(3)).await;
        let cancel = agent_rx.recv().await.unwrap();
        assert_eq!(event_name(&cancel), events::CANCEL_COMMAND);

        // No terminal arrives within grace: Lost.
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(
            h.router.commands().get(record.command_id).unwrap().status,
            CommandStatus::Lost
        );
    }

    #[tokio::test]
    async fn test_progress_after_terminal_increments_late_frames() {
        let h = harness(RouterConfig::default());
        let (session_id, _agent_rx) = connect_agent(&h.router, "agent-1");

        let record = h
            .router
            .execute("user-1", "agent-1", request("echo hi", false))
            .await
            .unwrap();
        h.router
            .handle_result(session_id, result_payload(record.command_id, 0));

        h.router
            .handle_progress(session_id, progress_payload(record.command_id));
        h.router
            .handle_progress(session_id, progress_payload(record.command_id));

        let refreshed = h.router.commands().get(record.command_id).unwrap();
        assert_eq!(refreshed.status, CommandStatus::Completed);
        assert_eq!(refreshed.late_frames, 2);
    }

    #[tokio::test]
    async fn test_cancel_forwards_to_agent_session() {
        let h = harness(RouterConfig::default());
        let (_session_id, mut agent_rx) = connect_agent(&h.router, "agent-1");

        let record = h
            .router
            .execute("user-1", "agent-1", request("sleep 60", false))
            .await
            .unwrap();
        agent_rx.recv().await.unwrap(); // execute_command

        h.router.cancel(record.command_id).unwrap();
        let frame = agent_rx.recv().await.unwrap();
        assert_eq!(event_name(&frame), events::CANCEL_COMMAND);
    }

    #[tokio::test]
    async fn test_cancel_unknown_command_errors() {
        let h = harness(RouterConfig::default());
        assert!(matches!(
            h.router.cancel(Uuid::new_v4()),
            Err(Error::CommandNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_register_evicts_stale_session_handle() {
        let h = harness(RouterConfig::default());
        let (old_session, mut old_rx) = connect_agent(&h.router, "agent-1");
        let (_new_session, _new_rx) = connect_agent(&h.router, "agent-1");

        // The stale session's pump is closed so its connection unwinds.
        assert!(old_rx.recv().await.is_none());
        assert!(!h.router.sessions().contains(old_session));
    }
}
