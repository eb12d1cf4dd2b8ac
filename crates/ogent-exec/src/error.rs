//! Error types for ogent-exec

use thiserror::Error;

/// Executor error type
#[derive(Debug, Error)]
pub enum Error {
    /// The requested executor cannot run right now (forced target missing
    /// or disabled). Never silently falls back.
    #[error("executor unavailable: {0}")]
    Unavailable(String),

    /// Spawning the subprocess failed
    #[error("failed to spawn command: {0}")]
    Spawn(#[from] std::io::Error),

    /// The remote target could not be reached during a connection probe
    #[error("remote connection failed: {0}")]
    ConnectFailed(String),

    /// Unrecoverable internal error
    #[error("internal executor error: {0}")]
    Internal(String),
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;
