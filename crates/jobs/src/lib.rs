//! `triage-jobs`
//!
//! **Responsibility:** orchestration of remote LLM judge runs for the triage console.
//!
//! This crate provides:
//! - `JobRegistry`: per-thread job state with change notifications
//! - `Scheduler`: start / cancel / sequential batch submission
//! - `Poller`: batched status reconciliation with a load-scaled interval
//! - `AutoRunController`: keeps the backlog flowing up to the concurrency cap
//! - `QuotaMonitor`: throttled quota checks and the operator-facing note
//!
//! The judge service stays the authority; everything here is process-lifetime
//! state reconciled against it.

pub mod api;
pub mod auto_run;
pub mod config;
pub mod debounce;
pub mod error;
pub mod http;
pub mod memory;
pub mod orchestrator;
pub mod poller;
pub mod quota;
pub mod registry;
pub mod scheduler;
pub mod view;

pub use api::{CancelReply, JudgeApi, QueueSource, StartAck, StatusItem, ThreadDetail};
pub use auto_run::{AutoRunController, AutoRunSwitch, TickOutcome};
pub use config::{JobsConfig, PollPolicy};
pub use error::{ApiError, ConfigError, FailureKind};
pub use http::HttpJudgeClient;
pub use memory::InMemoryJudgeApi;
pub use orchestrator::{ConsoleSnapshot, Orchestrator, OrchestratorHandle};
pub use poller::{PollOutcome, Poller};
pub use quota::{QuotaMonitor, RefreshOutcome};
pub use registry::{Generation, JobRegistry, MergeReport};
pub use scheduler::{BatchProgress, Scheduler, StartOutcome};
pub use view::{QueueSnapshot, ViewState};
