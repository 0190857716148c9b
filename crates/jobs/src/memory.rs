//! In-process judge service.
//!
//! Backs the `TRIAGE_JUDGE_MODE=mock` dry-run mode of the binary and the
//! test suites. It mimics the service's observable behaviour: a server-side
//! concurrency cap, bulk status, authoritative cancel, quota markers and the
//! unreviewed queue. Tests script failures and hold requests open with gates.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::watch;

use triage_core::{GuessFilter, JobStatus, Judgment, ModelId, QueueItem, QuotaState, ThreadId};

use crate::api::{CancelReply, JudgeApi, QueueSource, StartAck, StatusItem, ThreadDetail};
use crate::config::DEFAULT_MAX_INFLIGHT;
use crate::error::ApiError;

#[derive(Debug, Clone)]
struct RemoteJob {
    status: JobStatus,
    error: Option<String>,
}

#[derive(Debug)]
struct ServiceState {
    jobs: HashMap<ThreadId, RemoteJob>,
    max_inflight: usize,
    queue: Vec<QueueItem>,
    details: HashMap<ThreadId, ThreadDetail>,
    quota: HashMap<String, String>,
    no_posts: HashSet<ThreadId>,
    start_failures: HashMap<ThreadId, ApiError>,
    cancel_failures: HashSet<ThreadId>,
    status_failure: Option<ApiError>,
    /// Advance jobs one step per bulk status call (dry-run mode).
    auto_progress: bool,
    started: Vec<ThreadId>,
}

/// Call counters, for assertions on request volume.
#[derive(Debug, Default)]
pub struct CallCounts {
    pub start: AtomicUsize,
    pub cancel: AtomicUsize,
    pub bulk_status: AtomicUsize,
    pub active: AtomicUsize,
    pub quota: AtomicUsize,
    pub detail: AtomicUsize,
    pub queue: AtomicUsize,
}

impl CallCounts {
    pub fn get(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }
}

/// In-memory judge service.
#[derive(Debug)]
pub struct InMemoryJudgeApi {
    state: Mutex<ServiceState>,
    calls: CallCounts,
    start_gate: watch::Sender<bool>,
    status_gate: watch::Sender<bool>,
}

impl Default for InMemoryJudgeApi {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryJudgeApi {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ServiceState {
                jobs: HashMap::new(),
                max_inflight: DEFAULT_MAX_INFLIGHT,
                queue: Vec::new(),
                details: HashMap::new(),
                quota: HashMap::new(),
                no_posts: HashSet::new(),
                start_failures: HashMap::new(),
                cancel_failures: HashSet::new(),
                status_failure: None,
                auto_progress: false,
                started: Vec::new(),
            }),
            calls: CallCounts::default(),
            start_gate: watch::channel(true).0,
            status_gate: watch::channel(true).0,
        }
    }

    /// Service with a queue of `n` unguessed threads named `1..=n`.
    pub fn with_backlog(n: usize) -> Self {
        let api = Self::new();
        let items = (1..=n)
            .filter_map(|i| ThreadId::new(i.to_string()).ok())
            .map(|id| QueueItem::new(id.clone(), format!("Thread {id}")))
            .collect();
        api.set_queue(items);
        api
    }

    /// Advance jobs on every status poll: queued → running → done.
    pub fn with_auto_progress(self) -> Self {
        self.lock().auto_progress = true;
        self
    }

    fn lock(&self) -> MutexGuard<'_, ServiceState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn calls(&self) -> &CallCounts {
        &self.calls
    }

    /// Threads for which a start request reached the service, in order.
    pub fn started(&self) -> Vec<ThreadId> {
        self.lock().started.clone()
    }

    pub fn set_max_inflight(&self, cap: usize) {
        self.lock().max_inflight = cap;
    }

    pub fn set_queue(&self, items: Vec<QueueItem>) {
        self.lock().queue = items;
    }

    pub fn remote_status(&self, thread_id: &ThreadId) -> Option<JobStatus> {
        self.lock().jobs.get(thread_id).map(|j| j.status)
    }

    /// Force a job into `status` on the service side.
    pub fn set_remote_status(&self, thread_id: &ThreadId, status: JobStatus) {
        self.lock().jobs.insert(
            thread_id.clone(),
            RemoteJob {
                status,
                error: None,
            },
        );
    }

    /// Finish a job and record a judgment for it.
    pub fn complete(&self, thread_id: &ThreadId, guess: &str) {
        let mut state = self.lock();
        complete_locked(&mut state, thread_id, guess);
    }

    /// Record quota markers for `model`.
    pub fn exhaust_quota(
        &self,
        model: &ModelId,
        message: &str,
        exhausted_at: DateTime<Utc>,
        reset_at: Option<DateTime<Utc>>,
    ) {
        let mut state = self.lock();
        state
            .quota
            .insert(QuotaState::message_key(model), message.to_string());
        state.quota.insert(
            QuotaState::exhausted_at_key(model),
            exhausted_at.naive_utc().format("%Y-%m-%dT%H:%M:%S%.6f").to_string(),
        );
        match reset_at {
            Some(reset) => {
                state
                    .quota
                    .insert(QuotaState::reset_at_key(model), reset.to_rfc3339());
            }
            None => {
                state.quota.remove(&QuotaState::reset_at_key(model));
            }
        }
    }

    pub fn clear_quota(&self) {
        self.lock().quota.clear();
    }

    /// The thread has no posts; starts will be answered with `skipped`.
    pub fn mark_no_posts(&self, thread_id: &ThreadId) {
        self.lock().no_posts.insert(thread_id.clone());
    }

    /// Fail the next start of `thread_id` with `error`.
    pub fn fail_next_start(&self, thread_id: &ThreadId, error: ApiError) {
        self.lock().start_failures.insert(thread_id.clone(), error);
    }

    /// Fail the next cancel of `thread_id` with a transport error.
    pub fn fail_next_cancel(&self, thread_id: &ThreadId) {
        self.lock().cancel_failures.insert(thread_id.clone());
    }

    /// Fail the next bulk status call with `error`.
    pub fn fail_next_status(&self, error: ApiError) {
        self.lock().status_failure = Some(error);
    }

    pub fn set_detail(&self, thread_id: &ThreadId, detail: ThreadDetail) {
        self.lock().details.insert(thread_id.clone(), detail);
    }

    /// Hold start requests open until [`Self::release_starts`].
    pub fn hold_starts(&self) {
        self.start_gate.send_replace(false);
    }

    pub fn release_starts(&self) {
        self.start_gate.send_replace(true);
    }

    /// Hold bulk status requests open until [`Self::release_status`].
    pub fn hold_status(&self) {
        self.status_gate.send_replace(false);
    }

    pub fn release_status(&self) {
        self.status_gate.send_replace(true);
    }

    async fn pass(gate: &watch::Sender<bool>) {
        let mut rx = gate.subscribe();
        // The sender lives as long as `self`, so this only ends when the gate opens.
        let _ = rx.wait_for(|open| *open).await;
    }
}

fn complete_locked(state: &mut ServiceState, thread_id: &ThreadId, guess: &str) {
    state.jobs.insert(
        thread_id.clone(),
        RemoteJob {
            status: JobStatus::Done,
            error: None,
        },
    );
    if let Some(item) = state.queue.iter_mut().find(|i| &i.thread_id == thread_id) {
        item.status_guess = Some(guess.to_string());
        item.confidence = Some("medium".to_string());
    }
    let detail = state.details.entry(thread_id.clone()).or_default();
    detail.judgment = Some(Judgment {
        status_guess: Some(guess.to_string()),
        confidence: Some("medium".to_string()),
        ..Judgment::default()
    });
}

fn inflight(state: &ServiceState) -> usize {
    state.jobs.values().filter(|j| j.status.is_active()).count()
}

fn advance(state: &mut ServiceState) {
    let running = state
        .jobs
        .values()
        .filter(|j| j.status == JobStatus::Running)
        .count();
    let mut to_finish = Vec::new();
    let mut to_run = Vec::new();
    let mut ids: Vec<_> = state.jobs.keys().cloned().collect();
    ids.sort();
    for id in ids {
        match state.jobs.get(&id).map(|j| j.status) {
            Some(JobStatus::Running) => to_finish.push(id),
            Some(JobStatus::Queued) | Some(JobStatus::Starting) => to_run.push(id),
            _ => {}
        }
    }
    for id in to_finish {
        complete_locked(state, &id, "open");
    }
    let free = state.max_inflight.saturating_sub(running.min(state.max_inflight));
    for id in to_run.into_iter().take(free) {
        if let Some(job) = state.jobs.get_mut(&id) {
            job.status = JobStatus::Running;
        }
    }
}

#[async_trait]
impl JudgeApi for InMemoryJudgeApi {
    async fn start(&self, thread_id: &ThreadId, _model: &ModelId) -> Result<StartAck, ApiError> {
        self.calls.start.fetch_add(1, Ordering::SeqCst);
        self.lock().started.push(thread_id.clone());
        Self::pass(&self.start_gate).await;

        let mut state = self.lock();
        if let Some(error) = state.start_failures.remove(thread_id) {
            return Err(error);
        }
        let max_inflight = state.max_inflight;
        if state.no_posts.contains(thread_id) {
            state.jobs.insert(
                thread_id.clone(),
                RemoteJob {
                    status: JobStatus::Skipped,
                    error: Some("no posts for thread".to_string()),
                },
            );
            let mut ack = StartAck::new(JobStatus::Skipped);
            ack.max_inflight = Some(max_inflight);
            return Ok(ack);
        }
        if let Some(job) = state.jobs.get(thread_id).filter(|j| j.status.is_active()) {
            let mut ack = StartAck::new(job.status);
            ack.max_inflight = Some(max_inflight);
            return Ok(ack);
        }
        let constrained = inflight(&state) >= max_inflight;
        state.jobs.insert(
            thread_id.clone(),
            RemoteJob {
                status: JobStatus::Queued,
                error: None,
            },
        );
        Ok(StartAck {
            status: JobStatus::Queued,
            max_inflight: Some(max_inflight),
            queued_reason: constrained.then(|| "capacity".to_string()),
        })
    }

    async fn cancel(&self, thread_id: &ThreadId) -> Result<CancelReply, ApiError> {
        self.calls.cancel.fetch_add(1, Ordering::SeqCst);
        let mut state = self.lock();
        if state.cancel_failures.remove(thread_id) {
            return Err(ApiError::Transport("connection reset".to_string()));
        }
        let reply = match state.jobs.get_mut(thread_id) {
            None => CancelReply {
                status: JobStatus::Idle,
                error: None,
            },
            Some(job) if job.status.is_terminal() => CancelReply {
                status: job.status,
                error: job.error.clone(),
            },
            Some(job) => {
                job.status = JobStatus::Cancelled;
                job.error = None;
                CancelReply {
                    status: JobStatus::Cancelled,
                    error: None,
                }
            }
        };
        Ok(reply)
    }

    async fn bulk_status(&self, thread_ids: &[ThreadId]) -> Result<Vec<StatusItem>, ApiError> {
        self.calls.bulk_status.fetch_add(1, Ordering::SeqCst);
        Self::pass(&self.status_gate).await;

        let mut state = self.lock();
        if let Some(error) = state.status_failure.take() {
            return Err(error);
        }
        if state.auto_progress {
            advance(&mut state);
        }
        Ok(thread_ids
            .iter()
            .map(|id| match state.jobs.get(id) {
                Some(job) => StatusItem {
                    thread_id: id.clone(),
                    status: job.status,
                    error: job.error.clone().filter(|_| job.status == JobStatus::Error),
                },
                None => StatusItem::new(id.clone(), JobStatus::Idle),
            })
            .collect())
    }

    async fn active_jobs(&self) -> Result<Vec<StatusItem>, ApiError> {
        self.calls.active.fetch_add(1, Ordering::SeqCst);
        let state = self.lock();
        let mut items: Vec<_> = state
            .jobs
            .iter()
            .filter(|(_, j)| j.status.is_active())
            .map(|(id, j)| StatusItem::new(id.clone(), j.status))
            .collect();
        items.sort_by(|a, b| a.thread_id.cmp(&b.thread_id));
        Ok(items)
    }

    async fn quota_state(&self, model: &ModelId) -> Result<HashMap<String, String>, ApiError> {
        self.calls.quota.fetch_add(1, Ordering::SeqCst);
        let state = self.lock();
        let keys = [
            QuotaState::exhausted_at_key(model),
            QuotaState::message_key(model),
            QuotaState::reset_at_key(model),
        ];
        Ok(keys
            .into_iter()
            .filter_map(|k| state.quota.get(&k).map(|v| (k, v.clone())))
            .collect())
    }

    async fn thread_detail(&self, thread_id: &ThreadId) -> Result<ThreadDetail, ApiError> {
        self.calls.detail.fetch_add(1, Ordering::SeqCst);
        self.lock()
            .details
            .get(thread_id)
            .cloned()
            .ok_or_else(|| ApiError::Rejected {
                status: 404,
                detail: "Thread not found".to_string(),
            })
    }
}

#[async_trait]
impl QueueSource for InMemoryJudgeApi {
    async fn load_queue(
        &self,
        filter: GuessFilter,
        limit: usize,
    ) -> Result<Vec<QueueItem>, ApiError> {
        self.calls.queue.fetch_add(1, Ordering::SeqCst);
        let state = self.lock();
        Ok(state
            .queue
            .iter()
            .filter(|item| match filter.has_llm_param() {
                None => true,
                Some(with_guess) => item.has_guess() == with_guess,
            })
            .take(limit)
            .cloned()
            .collect())
    }
}
