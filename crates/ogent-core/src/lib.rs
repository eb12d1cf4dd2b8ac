//! Core dispatch and lifecycle subsystem for ogent.
//!
//! The controller side of the system lives here: the agent and command
//! registries, the command router with its state machine and timers, the
//! wire protocol shared with agents, authentication, the optional AI
//! pre-processing stage, and the pub/sub adapter contract for horizontal
//! scale. Everything is in-memory; durable history is out of scope.

pub mod agents;
pub mod ai;
pub mod auth;
pub mod commands;
pub mod error;
pub mod events;
pub mod messaging;
pub mod protocol;
pub mod retry;
pub mod router;
pub mod sessions;

pub use agents::{AgentRecord, AgentRegistry};
pub use auth::{AuthContext, AuthService};
pub use commands::{CommandRecord, CommandRegistry, CommandStatus, DEFAULT_RETENTION};
pub use error::{Error, Result};
pub use events::{CommandEvent, EventBus};
pub use router::{ExecuteRequest, Router, RouterConfig};
pub use sessions::{SessionKind, SessionManager};

// Execution vocabulary shared across the boundary.
pub use ogent_exec::{ExecutionOutcome, ExecutionTarget, ExecutionType};
