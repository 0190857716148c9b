//! `triage-core`: shared vocabulary of the triage console.
//!
//! This crate contains **pure** types (no I/O, no runtime): identifiers, job
//! lifecycle states, queue items and quota markers. Orchestration lives in
//! `triage-jobs`.

pub mod error;
pub mod id;
pub mod job;
pub mod queue;
pub mod quota;

pub use error::{DomainError, DomainResult};
pub use id::{BatchId, ModelId, ThreadId};
pub use job::{Job, JobCounts, JobStatus};
pub use queue::{GuessFilter, Judgment, QueueItem};
pub use quota::QuotaState;
