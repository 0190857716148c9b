//! Job lifecycle types.

use core::str::FromStr;
use serde::{Deserialize, Serialize};

use crate::error::DomainError;
use crate::id::ThreadId;

/// Status of one remote analysis attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Accepted locally or by the service, waiting for a worker slot.
    Queued,
    /// The service is spinning up the analysis.
    Starting,
    /// The analysis is executing.
    Running,
    /// Finished; a judgment is available.
    Done,
    /// Failed; see [`Job::error`].
    Error,
    /// Cancelled by the operator.
    Cancelled,
    /// The service declined to run (e.g. the thread has no posts).
    Skipped,
    /// The service holds no job for the thread.
    Idle,
}

impl JobStatus {
    pub const ALL: [JobStatus; 8] = [
        JobStatus::Queued,
        JobStatus::Starting,
        JobStatus::Running,
        JobStatus::Done,
        JobStatus::Error,
        JobStatus::Cancelled,
        JobStatus::Skipped,
        JobStatus::Idle,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Starting => "starting",
            JobStatus::Running => "running",
            JobStatus::Done => "done",
            JobStatus::Error => "error",
            JobStatus::Cancelled => "cancelled",
            JobStatus::Skipped => "skipped",
            JobStatus::Idle => "idle",
        }
    }

    /// Queued, starting or running.
    pub fn is_active(&self) -> bool {
        matches!(self, JobStatus::Queued | JobStatus::Starting | JobStatus::Running)
    }

    pub fn is_terminal(&self) -> bool {
        !self.is_active()
    }
}

impl core::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase();
        JobStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == normalized)
            .ok_or_else(|| DomainError::unknown_status(s))
    }
}

/// One tracked attempt to obtain an LLM judgment for a thread.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub thread_id: ThreadId,
    pub status: JobStatus,
    /// Present only when `status` is [`JobStatus::Error`].
    pub error: Option<String>,
}

impl Job {
    /// Build a job, normalising the error field.
    ///
    /// The message is dropped for non-error statuses; an error without a
    /// message gets a generic one.
    pub fn new(thread_id: ThreadId, status: JobStatus, error: Option<String>) -> Self {
        let error = match status {
            JobStatus::Error => Some(
                error
                    .filter(|e| !e.trim().is_empty())
                    .unwrap_or_else(|| "Unknown error".to_string()),
            ),
            _ => None,
        };
        Self {
            thread_id,
            status,
            error,
        }
    }

    pub fn failed(thread_id: ThreadId, error: impl Into<String>) -> Self {
        Self::new(thread_id, JobStatus::Error, Some(error.into()))
    }

    pub fn is_active(&self) -> bool {
        self.status.is_active()
    }
}

/// Per-status totals over a set of jobs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobCounts {
    pub queued: usize,
    pub starting: usize,
    pub running: usize,
    pub done: usize,
    pub error: usize,
    pub cancelled: usize,
    pub skipped: usize,
    pub idle: usize,
}

impl JobCounts {
    pub fn from_statuses<I>(statuses: I) -> Self
    where
        I: IntoIterator<Item = JobStatus>,
    {
        let mut counts = Self::default();
        for status in statuses {
            counts.record(status);
        }
        counts
    }

    pub fn record(&mut self, status: JobStatus) {
        match status {
            JobStatus::Queued => self.queued += 1,
            JobStatus::Starting => self.starting += 1,
            JobStatus::Running => self.running += 1,
            JobStatus::Done => self.done += 1,
            JobStatus::Error => self.error += 1,
            JobStatus::Cancelled => self.cancelled += 1,
            JobStatus::Skipped => self.skipped += 1,
            JobStatus::Idle => self.idle += 1,
        }
    }

    pub fn get(&self, status: JobStatus) -> usize {
        match status {
            JobStatus::Queued => self.queued,
            JobStatus::Starting => self.starting,
            JobStatus::Running => self.running,
            JobStatus::Done => self.done,
            JobStatus::Error => self.error,
            JobStatus::Cancelled => self.cancelled,
            JobStatus::Skipped => self.skipped,
            JobStatus::Idle => self.idle,
        }
    }

    pub fn total(&self) -> usize {
        self.active() + self.finished()
    }

    pub fn active(&self) -> usize {
        self.queued + self.starting + self.running
    }

    pub fn finished(&self) -> usize {
        self.done + self.error + self.cancelled + self.skipped + self.idle
    }

    /// Share of tracked jobs that reached a terminal state, rounded to a whole percent.
    pub fn progress_percent(&self) -> u8 {
        let total = self.total();
        if total == 0 {
            return 0;
        }
        ((self.finished() as f64 / total as f64) * 100.0).round() as u8
    }
}
