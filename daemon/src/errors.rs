/// Error types for the coordination daemon
use agentlink_core::{HubError, StoreError};
use thiserror::Error;

/// Result type for daemon operations
pub type DaemonResult<T> = Result<T, DaemonError>;

/// Daemon error types
#[derive(Debug, Error)]
pub enum DaemonError {
    /// Listener could not be bound
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    /// Channel store failure
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Hub error
    #[error("Hub error: {0}")]
    Hub(#[from] HubError),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Server error
    #[error("Server error: {0}")]
    Server(String),
}

impl DaemonError {
    /// Whether this error should stop `start()`.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            DaemonError::Bind { .. } | DaemonError::Store(_) | DaemonError::Config(_)
        )
    }
}
