/// Error types for the agentlink coordination core.
use thiserror::Error;

/// Envelope rejected by the validator. Never retried.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FormatError {
    #[error("Missing required field: {0}")]
    MissingField(&'static str),

    #[error("Field must not be empty: {0}")]
    EmptyField(&'static str),

    #[error("Envelope must name at least one recipient")]
    NoRecipients,

    #[error("ttl must be greater than zero")]
    InvalidTtl,

    #[error("Malformed envelope: {0}")]
    Malformed(String),
}

/// Result type for validation.
pub type FormatResult<T> = Result<T, FormatError>;

/// Failure reported by a durable channel store.
#[derive(Error, Debug, Clone)]
pub enum StoreError {
    #[error("Store not connected")]
    NotConnected,

    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Store command failed: {0}")]
    CommandFailed(String),

    #[error("Subscription failed: {0}")]
    SubscribeFailed(String),
}

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Core error type for hub operations.
#[derive(Error, Debug)]
pub enum HubError {
    #[error("Format error: {0}")]
    Format(#[from] FormatError),

    #[error("Channel error: {0}")]
    Channel(#[from] StoreError),

    #[error("Connection error for {client_id}: {message}")]
    Connection { client_id: String, message: String },

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Metrics error: {0}")]
    Metrics(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type for hub operations.
pub type HubResult<T> = Result<T, HubError>;

impl HubError {
    pub fn connection(client_id: impl Into<String>, message: impl Into<String>) -> Self {
        HubError::Connection {
            client_id: client_id.into(),
            message: message.into(),
        }
    }

    /// Whether the failure leaves the instance usable.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, HubError::Config(_) | HubError::Metrics(_))
    }
}

impl From<prometheus::Error> for HubError {
    fn from(e: prometheus::Error) -> Self {
        HubError::Metrics(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_error_display() {
        let err = FormatError::MissingField("channel");
        assert_eq!(err.to_string(), "Missing required field: channel");
    }

    #[test]
    fn test_recoverable_classification() {
        assert!(HubError::from(FormatError::InvalidTtl).is_recoverable());
        assert!(HubError::from(StoreError::NotConnected).is_recoverable());
        assert!(!HubError::Config("bad".into()).is_recoverable());
    }
}
