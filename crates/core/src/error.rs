//! Domain error model.

use thiserror::Error;

/// Result type used across the queue domain.
pub type QueueResult<T> = Result<T, QueueError>;

/// Domain-level error.
///
/// Deterministic failures only (validation, bad identifiers, illegal state
/// changes). Storage and transport failures have their own types.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum QueueError {
    /// A value failed validation (e.g. empty filename).
    #[error("validation failed: {0}")]
    Validation(String),

    /// An identifier was invalid (e.g. parse failure).
    #[error("invalid identifier: {0}")]
    InvalidId(String),

    /// A persisted status string did not name a known status.
    #[error("unknown job status: {0}")]
    UnknownStatus(String),

    /// A state change the job state machine does not allow.
    #[error("invalid transition: {from} -> {to}")]
    InvalidTransition {
        from: &'static str,
        to: &'static str,
    },
}

impl QueueError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }
}
