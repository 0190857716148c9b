//! Domain error model.

use thiserror::Error;

/// Result type used across the core types.
pub type DomainResult<T> = Result<T, DomainError>;

/// Domain-level error.
///
/// Keep this focused on deterministic parsing failures. Transport and
/// remote-service failures belong to `triage-jobs`.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// An identifier was invalid (e.g. empty).
    #[error("invalid identifier: {0}")]
    InvalidId(String),

    /// A job status string was not recognised.
    #[error("unknown job status: {0}")]
    UnknownStatus(String),
}

impl DomainError {
    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }

    pub fn unknown_status(status: impl Into<String>) -> Self {
        Self::UnknownStatus(status.into())
    }
}
