//! Error taxonomy of the orchestrator.

use thiserror::Error;

/// Message recorded on a job when the start request never got an answer.
pub const TRANSPORT_FAILURE_MESSAGE: &str = "Request failed";

/// Message recorded on a job when the remote cancel request failed.
pub const CANCEL_FAILURE_MESSAGE: &str = "Cancel failed";

/// Failure of a call to the judge service.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ApiError {
    /// Network failure: the request did not complete.
    #[error("network error: {0}")]
    Transport(String),

    /// The service answered with a non-success status.
    #[error("API error ({status}): {detail}")]
    Rejected { status: u16, detail: String },

    /// The response body could not be decoded.
    #[error("parse error: {0}")]
    Parse(String),
}

impl ApiError {
    /// Message to record on the affected job.
    ///
    /// Rejections carry the service's `detail` verbatim; everything else
    /// collapses to a generic message.
    pub fn job_message(&self) -> String {
        match self {
            ApiError::Rejected { detail, .. } => detail.clone(),
            ApiError::Transport(_) | ApiError::Parse(_) => TRANSPORT_FAILURE_MESSAGE.to_string(),
        }
    }

    pub fn kind(&self) -> FailureKind {
        match self {
            ApiError::Rejected { detail, .. } if is_quota_exhaustion(detail) => {
                FailureKind::QuotaExhausted
            }
            ApiError::Rejected { .. } => FailureKind::RemoteRejection,
            ApiError::Transport(_) | ApiError::Parse(_) => FailureKind::TransportFailure,
        }
    }
}

/// How a job failure is classified for the operator and the auto-run loop.
///
/// A start cancelled before acknowledgement is not a failure; it ends as
/// `StartOutcome::Cancelled` with the job `cancelled`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Network or decoding error on any call.
    TransportFailure,
    /// Non-success answer with a `detail` message.
    RemoteRejection,
    /// The service is out of quota for the model.
    QuotaExhausted,
}

/// Heuristic detection of quota exhaustion in an error message.
///
/// The service reports quota problems only as free text, so this matches the
/// phrases it is known to use.
pub fn is_quota_exhaustion(message: &str) -> bool {
    let text = message.to_lowercase();
    text.contains("quota")
        || text.contains("exhausted your capacity")
        || text.contains("terminalquotaerror")
}

/// Invalid configuration value.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value:?} ({reason})")]
    InvalidValue {
        key: &'static str,
        value: String,
        reason: String,
    },

    #[error("failed to build HTTP client: {0}")]
    HttpClient(String),
}
