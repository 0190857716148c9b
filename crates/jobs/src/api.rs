//! Contract with the remote judge service.
//!
//! The orchestrator only ever talks to the service through [`JudgeApi`] and
//! [`QueueSource`]; [`crate::http::HttpJudgeClient`] is the production
//! implementation, [`crate::memory::InMemoryJudgeApi`] the in-process one.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Deserializer, Serialize};

use triage_core::{GuessFilter, JobStatus, Judgment, ModelId, QueueItem, ThreadId};

use crate::error::ApiError;

/// Acknowledgement of a start request (not the analysis result).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartAck {
    #[serde(default = "queued", deserialize_with = "lenient_status")]
    pub status: JobStatus,
    /// Concurrency cap enforced by the service.
    #[serde(default)]
    pub max_inflight: Option<usize>,
    /// `"capacity"` when the job waits for a free worker slot.
    #[serde(default)]
    pub queued_reason: Option<String>,
}

impl StartAck {
    pub fn new(status: JobStatus) -> Self {
        Self {
            status,
            max_inflight: None,
            queued_reason: None,
        }
    }

    /// True when the service queued the job because all slots are taken.
    pub fn is_capacity_constrained(&self) -> bool {
        self.queued_reason.as_deref() == Some("capacity")
    }
}

/// Authoritative answer to a cancel request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelReply {
    #[serde(default = "cancelled", deserialize_with = "lenient_status")]
    pub status: JobStatus,
    #[serde(default)]
    pub error: Option<String>,
}

/// Status of one job as reported by the bulk status and active-jobs endpoints.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusItem {
    pub thread_id: ThreadId,
    #[serde(deserialize_with = "lenient_status")]
    pub status: JobStatus,
    #[serde(default)]
    pub error: Option<String>,
}

impl StatusItem {
    pub fn new(thread_id: ThreadId, status: JobStatus) -> Self {
        Self {
            thread_id,
            status,
            error: None,
        }
    }
}

/// Full thread detail, refetched when the open thread's job completes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ThreadDetail {
    #[serde(default)]
    pub thread: serde_json::Value,
    #[serde(default)]
    pub judgment: Option<Judgment>,
}

impl ThreadDetail {
    /// The LLM's suggested disposition, if any.
    pub fn suggestion(&self) -> Option<&str> {
        self.judgment
            .as_ref()
            .and_then(|j| j.status_guess.as_deref())
            .filter(|g| !g.trim().is_empty())
    }
}

/// Remote judge service.
#[async_trait]
pub trait JudgeApi: Send + Sync + 'static {
    /// `POST /judge/{thread}?model=`: enqueue an analysis run.
    async fn start(&self, thread_id: &ThreadId, model: &ModelId) -> Result<StartAck, ApiError>;

    /// `POST /judge/cancel/{thread}`.
    async fn cancel(&self, thread_id: &ThreadId) -> Result<CancelReply, ApiError>;

    /// `POST /judge/status/bulk`: status of many jobs in one round-trip.
    async fn bulk_status(&self, thread_ids: &[ThreadId]) -> Result<Vec<StatusItem>, ApiError>;

    /// `GET /judge/active`: jobs active across all clients.
    async fn active_jobs(&self) -> Result<Vec<StatusItem>, ApiError>;

    /// `GET /judge/state?model=`: opaque key/value state holding quota markers.
    async fn quota_state(&self, model: &ModelId) -> Result<HashMap<String, String>, ApiError>;

    /// `GET /thread/{id}`.
    async fn thread_detail(&self, thread_id: &ThreadId) -> Result<ThreadDetail, ApiError>;
}

/// Source of the triage queue shown to the operator.
#[async_trait]
pub trait QueueSource: Send + Sync + 'static {
    /// First page of unreviewed threads matching `filter`, in display order.
    async fn load_queue(
        &self,
        filter: GuessFilter,
        limit: usize,
    ) -> Result<Vec<QueueItem>, ApiError>;
}

fn queued() -> JobStatus {
    JobStatus::Queued
}

fn cancelled() -> JobStatus {
    JobStatus::Cancelled
}

/// Unknown or null statuses from the service are read as `idle` instead of
/// failing the whole response.
fn lenient_status<'de, D>(deserializer: D) -> Result<JobStatus, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<String>::deserialize(deserializer)?;
    Ok(match raw {
        Some(raw) => raw.parse().unwrap_or_else(|_| {
            tracing::warn!(status = %raw, "unknown job status from judge service");
            JobStatus::Idle
        }),
        None => JobStatus::Idle,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_ack_defaults_to_queued() {
        let ack: StartAck = serde_json::from_str("{}").unwrap();
        assert_eq!(ack.status, JobStatus::Queued);
        assert!(!ack.is_capacity_constrained());

        let ack: StartAck = serde_json::from_str(
            r#"{"thread_id":"9","status":"queued","queued_reason":"capacity","max_inflight":4}"#,
        )
        .unwrap();
        assert!(ack.is_capacity_constrained());
        assert_eq!(ack.max_inflight, Some(4));
    }

    #[test]
    fn unknown_status_reads_as_idle() {
        let item: StatusItem =
            serde_json::from_str(r#"{"thread_id":"3","status":"exploded"}"#).unwrap();
        assert_eq!(item.status, JobStatus::Idle);

        let reply: CancelReply = serde_json::from_str(r#"{"status":"done"}"#).unwrap();
        assert_eq!(reply.status, JobStatus::Done);
    }

    #[test]
    fn detail_suggestion() {
        let detail: ThreadDetail = serde_json::from_str(
            r#"{"thread":{"thread_id":"1"},"posts":[],"judgment":{"status_guess":"duplicate"}}"#,
        )
        .unwrap();
        assert_eq!(detail.suggestion(), Some("duplicate"));
        assert_eq!(ThreadDetail::default().suggestion(), None);
    }
}
