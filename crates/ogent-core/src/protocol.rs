//! Wire protocol between Controller, Agents, and requester channels.
//!
//! All messages on a WebSocket connection are one [`WireFrame`]:
//! request/response for the handshake and requester method calls, named
//! events for everything that flows during a command's lifetime. Field
//! names of the event payloads are part of the contract.

use chrono::{DateTime, Utc};
use ogent_exec::{ExecutionTarget, ExecutionType};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Canonical event names.
pub mod events {
    /// Controller → Agent: run this command.
    pub const EXECUTE_COMMAND: &str = "execute_command";
    /// Controller → Agent: cancel a dispatched command.
    pub const CANCEL_COMMAND: &str = "cancel_command";
    /// Agent → Controller: incremental progress for a command.
    pub const COMMAND_PROGRESS: &str = "command_progress";
    /// Agent → Controller: terminal result for a command.
    pub const COMMAND_RESULT: &str = "command_result";
    /// Agent → Controller: capability update.
    pub const AGENT_INFO: &str = "agent_info";
    /// Controller → requesters: router-origin terminal failure.
    pub const COMMAND_FAILED: &str = "command_failed";
    /// Controller → requesters: command declared lost.
    pub const COMMAND_LOST: &str = "command_lost";
    /// Controller → requesters: an agent registered.
    pub const AGENT_CONNECTED: &str = "agent_connected";
    /// Controller → requesters: an agent went away.
    pub const AGENT_DISCONNECTED: &str = "agent_disconnected";
}

/// Request method names.
pub mod methods {
    /// Agent handshake.
    pub const REGISTER: &str = "register";
    /// Requester handshake.
    pub const CONNECT: &str = "connect";
    /// Requester: dispatch a command.
    pub const COMMAND_EXECUTE: &str = "command.execute";
    /// Requester: cancel a command.
    pub const COMMAND_CANCEL: &str = "command.cancel";
    /// Liveness probe.
    pub const PING: &str = "ping";
}

/// Wire frame — every message on a connection is one of these.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "frame", rename_all = "snake_case")]
pub enum WireFrame {
    /// Method invocation (handshakes, requester commands)
    Request {
        /// Unique request ID (sender-generated)
        id: String,
        /// Method name
        method: String,
        /// Method parameters
        #[serde(default)]
        params: Value,
    },
    /// Response to a request
    Response {
        /// Matches the request ID
        id: String,
        /// Successful result (mutually exclusive with error)
        #[serde(skip_serializing_if = "Option::is_none")]
        result: Option<Value>,
        /// Error (mutually exclusive with result)
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<WireError>,
    },
    /// Named event with a structured payload
    Event {
        /// Event name
        event: String,
        /// Event payload
        data: Value,
    },
}

impl WireFrame {
    /// Create a success response for a given request ID.
    pub fn ok(id: impl Into<String>, result: Value) -> Self {
        Self::Response {
            id: id.into(),
            result: Some(result),
            error: None,
        }
    }

    /// Create an error response for a given request ID.
    pub fn err(id: impl Into<String>, error: WireError) -> Self {
        Self::Response {
            id: id.into(),
            result: None,
            error: Some(error),
        }
    }

    /// Create an event frame.
    pub fn event(name: impl Into<String>, data: Value) -> Self {
        Self::Event {
            event: name.into(),
            data,
        }
    }
}

/// Structured error in a Response frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireError {
    /// Machine-readable error code
    pub code: WireErrorCode,
    /// Human-readable message
    pub message: String,
}

impl WireError {
    pub fn new(code: WireErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

/// Error codes for the wire protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WireErrorCode {
    /// Authentication failed or missing
    Unauthorized,
    /// Must complete the handshake first
    NotRegistered,
    /// Unknown method
    UnknownMethod,
    /// Invalid parameters
    InvalidParams,
    /// Resource not found
    NotFound,
    /// Target agent has no live session
    NotDeliverable,
    /// Internal server error
    InternalError,
}

/// Free-form capability info an agent reports at registration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    /// Executor kinds the agent can run ("local", "remote").
    #[serde(default)]
    pub executors: Vec<String>,
    #[serde(default)]
    pub remote_enabled: bool,
    /// Descriptor of the remote target (user@host) when remote is enabled.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_target: Option<String>,
}

impl AgentInfo {
    /// Merge a capability update into this info. Present fields overwrite,
    /// absent fields are kept.
    pub fn merge(&mut self, update: AgentInfo) {
        if update.hostname.is_some() {
            self.hostname = update.hostname;
        }
        if update.platform.is_some() {
            self.platform = update.platform;
        }
        if update.version.is_some() {
            self.version = update.version;
        }
        if !update.executors.is_empty() {
            self.executors = update.executors;
        }
        self.remote_enabled = update.remote_enabled;
        if update.remote_target.is_some() {
            self.remote_target = update.remote_target;
        }
    }
}

/// Parameters for the agent `register` handshake.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterParams {
    /// Short-lived bearer token from `POST /token`
    pub token: String,
    /// Agent-proposed stable id; synthesized by the Controller when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    #[serde(default)]
    pub info: AgentInfo,
}

/// Successful `register` response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterAck {
    /// Authoritative agent id for this session
    pub assigned_agent_id: String,
    /// Session bound to this connection
    pub session_id: Uuid,
    pub status: String,
}

/// Parameters for the requester `connect` handshake.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectParams {
    /// Short-lived bearer token from `POST /token`
    pub token: String,
}

/// Successful requester `connect` response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectAck {
    /// Requester session id; progress and results are addressed to it
    pub session_id: Uuid,
    pub user_id: String,
}

/// `execute_command` payload (Controller → Agent).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecuteCommand {
    /// Controller-assigned correlation id. An agent receiving a frame
    /// without one synthesizes it here and echoes it back in every
    /// progress/result frame.
    #[serde(default = "Uuid::new_v4")]
    pub command_id: Uuid,
    pub command: String,
    #[serde(default)]
    pub execution_target: ExecutionTarget,
    /// Channel the agent echoes back so progress can be routed
    pub requester_sid: String,
}

/// `command_progress` payload (Agent → Controller).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandProgress {
    pub command_id: Uuid,
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stdout_chunk: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stderr_chunk: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub ts: DateTime<Utc>,
}

/// `command_result` payload (Agent → Controller).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandResult {
    pub command_id: Uuid,
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub execution_type: ExecutionType,
    pub target: String,
    #[serde(default)]
    pub cancelled: bool,
    pub ts: DateTime<Utc>,
}

/// `cancel_command` payload (Controller → Agent).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancelCommand {
    pub command_id: Uuid,
}

/// `agent_info` payload (Agent → Controller).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentInfoUpdate {
    pub info: AgentInfo,
}
