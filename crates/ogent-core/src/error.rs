//! Error types for ogent-core
//!
//! One kind per failure class of the dispatch subsystem. Execution
//! failures, cancellations and lost commands are command outcomes, not Rust
//! errors — they travel through the command state machine instead.

use thiserror::Error;
use uuid::Uuid;

use crate::commands::CommandStatus;

/// Core error type
#[derive(Debug, Error)]
pub enum Error {
    /// Credentials or token invalid
    #[error("authentication failed: {0}")]
    AuthFailure(String),

    /// Target agent is not registered
    #[error("agent not found: {0}")]
    AgentNotFound(String),

    /// Agent known but its session is gone or the send failed
    #[error("not deliverable: {0}")]
    NotDeliverable(String),

    /// Command id not present in the registry
    #[error("command not found: {0}")]
    CommandNotFound(Uuid),

    /// Attempted state-machine edge is not allowed
    #[error("invalid transition: {from} -> {to}")]
    InvalidTransition {
        from: CommandStatus,
        to: CommandStatus,
    },

    /// Malformed event payload or frame
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// AI pre-processing backend failure
    #[error("ai backend error: {0}")]
    AiBackend(String),

    /// Messaging adapter failure
    #[error("messaging error: {0}")]
    Messaging(String),

    /// Unrecoverable internal error
    #[error("internal error: {0}")]
    Internal(String),
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;
