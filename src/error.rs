//! Error types for Courier
//!
//! One error enum covers every failure mode of the conversation engine and the
//! mail queue. Uses thiserror for ergonomic error handling.
//!
//! Throttle and quota results are not errors: they come back as ordinary
//! values (`bool`, `NegotiationOutcome::QuotaExceeded`, ...).

use crate::mail::TransportError;
use thiserror::Error;

/// Result type alias for Courier operations
pub type Result<T> = std::result::Result<T, CourierError>;

/// Comprehensive error type for Courier operations
#[derive(Error, Debug)]
pub enum CourierError {
    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Storage errors that are not raw SQLite failures
    #[error("Storage error: {0}")]
    Storage(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML parsing errors
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// SQLite database errors
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// A pre-create or pre-send validator vetoed the operation
    #[error("Rejected: {}", .0.join("; "))]
    Rejected(Vec<String>),

    /// The actor may not perform this action
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// A referenced thread, message, user or negotiation does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// No mail type is registered under this name
    #[error("Unknown mail type: {0}")]
    UnknownMailType(String),

    /// Caller supplied an argument outside the accepted domain
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Notification transport errors
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Other errors
    #[error("{0}")]
    Other(String),
}

impl CourierError {
    /// True for validator vetoes
    pub fn is_rejection(&self) -> bool {
        matches!(self, CourierError::Rejected(_))
    }

    /// True for access-denied conditions
    pub fn is_permission_denied(&self) -> bool {
        matches!(self, CourierError::PermissionDenied(_))
    }

    /// Human-readable rejection reasons, empty for other errors
    pub fn reasons(&self) -> &[String] {
        match self {
            CourierError::Rejected(reasons) => reasons,
            _ => &[],
        }
    }

    pub(crate) fn not_found(what: &str, id: impl std::fmt::Display) -> Self {
        CourierError::NotFound(format!("{} {}", what, id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejected_message_joins_reasons() {
        let err = CourierError::Rejected(vec![
            "quota exceeded".to_string(),
            "recipient blocked you".to_string(),
        ]);
        assert_eq!(
            err.to_string(),
            "Rejected: quota exceeded; recipient blocked you"
        );
        assert!(err.is_rejection());
        assert_eq!(err.reasons().len(), 2);
    }

    #[test]
    fn test_reasons_empty_for_other_errors() {
        let err = CourierError::not_found("thread", 42);
        assert_eq!(err.to_string(), "Not found: thread 42");
        assert!(err.reasons().is_empty());
        assert!(!err.is_permission_denied());
    }
}
