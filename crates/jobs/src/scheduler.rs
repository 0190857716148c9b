//! Start, cancel and sequential batch submission of judge runs.
//!
//! Every start captures the [`Generation`] handed out by
//! [`JobRegistry::begin`] and only applies its acknowledgement through
//! [`JobRegistry::set_if_awaiting_ack`], so neither a newer start or cancel
//! nor a status already reported by a poll round is overwritten. The request
//! future races a per-start [`CancellationToken`]; cancelling drops the
//! request and the remote cancel reply then decides the final state.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use triage_core::{BatchId, JobStatus, ModelId, ThreadId};

use crate::api::{JudgeApi, StartAck};
use crate::auto_run::AutoRunSwitch;
use crate::config::JobsConfig;
use crate::error::{CANCEL_FAILURE_MESSAGE, FailureKind};
use crate::registry::{Generation, JobRegistry};

/// Result of [`Scheduler::start`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartOutcome {
    /// The thread already had an active job; nothing was sent.
    AlreadyActive,
    /// The service acknowledged the run with this status.
    Acknowledged(JobStatus),
    /// The request failed; the job is now `error` with `message`.
    Failed { kind: FailureKind, message: String },
    /// The request was cancelled locally before the service answered.
    Cancelled,
    /// A newer start or cancel, or a poll round, got there first; the answer
    /// was discarded.
    Superseded,
}

/// Progress of a sequential batch submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchProgress {
    pub id: BatchId,
    pub label: String,
    pub total: usize,
    /// Starts issued so far.
    pub queued: usize,
    /// False once the batch finished or was aborted.
    pub running: bool,
}

/// Issues start/cancel requests and keeps the registry in step with them.
pub struct Scheduler<A> {
    api: Arc<A>,
    registry: Arc<JobRegistry>,
    auto_run: Arc<AutoRunSwitch>,
    tokens: Mutex<HashMap<ThreadId, (Generation, CancellationToken)>>,
    default_max_inflight: usize,
    /// Concurrency cap reported by the service, once known.
    max_inflight: watch::Sender<Option<usize>>,
    capacity_hint: AtomicBool,
    batch: watch::Sender<Option<BatchProgress>>,
}

impl<A: JudgeApi> Scheduler<A> {
    pub fn new(
        api: Arc<A>,
        registry: Arc<JobRegistry>,
        auto_run: Arc<AutoRunSwitch>,
        config: &JobsConfig,
    ) -> Self {
        Self {
            api,
            registry,
            auto_run,
            tokens: Mutex::new(HashMap::new()),
            default_max_inflight: config.default_max_inflight,
            max_inflight: watch::channel(None).0,
            capacity_hint: AtomicBool::new(false),
            batch: watch::channel(None).0,
        }
    }

    fn tokens(&self) -> MutexGuard<'_, HashMap<ThreadId, (Generation, CancellationToken)>> {
        self.tokens.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Request an analysis run of `thread_id`.
    ///
    /// A no-op when the thread is already queued, starting or running.
    /// Resolves once the service acknowledged (or refused) the run; the
    /// analysis itself completes later and is picked up by the poller.
    pub async fn start(&self, thread_id: &ThreadId, model: &ModelId) -> StartOutcome {
        let Some(generation) = self.registry.begin(thread_id) else {
            tracing::debug!(thread_id = %thread_id, "start ignored, job already active");
            return StartOutcome::AlreadyActive;
        };
        let token = CancellationToken::new();
        self.tokens().insert(thread_id.clone(), (generation, token.clone()));
        tracing::debug!(thread_id = %thread_id, model = %model, "starting judge run");

        let result = tokio::select! {
            _ = token.cancelled() => None,
            result = self.api.start(thread_id, model) => Some(result),
        };
        self.release_token(thread_id, generation);

        match result {
            None => {
                self.registry
                    .set_if_current(thread_id, generation, JobStatus::Cancelled, None);
                tracing::debug!(thread_id = %thread_id, "start aborted before acknowledgement");
                StartOutcome::Cancelled
            }
            Some(Ok(ack)) => {
                self.learn_capacity(&ack);
                if self
                    .registry
                    .set_if_awaiting_ack(thread_id, generation, ack.status, None)
                {
                    tracing::info!(
                        thread_id = %thread_id,
                        status = %ack.status,
                        "judge run acknowledged"
                    );
                    StartOutcome::Acknowledged(ack.status)
                } else {
                    tracing::debug!(thread_id = %thread_id, "late acknowledgement discarded");
                    StartOutcome::Superseded
                }
            }
            Some(Err(e)) => {
                let message = e.job_message();
                let kind = e.kind();
                tracing::warn!(thread_id = %thread_id, error = %e, "judge start failed");
                if self.registry.set_if_awaiting_ack(
                    thread_id,
                    generation,
                    JobStatus::Error,
                    Some(message.clone()),
                ) {
                    StartOutcome::Failed { kind, message }
                } else {
                    StartOutcome::Superseded
                }
            }
        }
    }

    fn release_token(&self, thread_id: &ThreadId, generation: Generation) {
        let mut tokens = self.tokens();
        if tokens.get(thread_id).is_some_and(|(g, _)| *g == generation) {
            tokens.remove(thread_id);
        }
    }

    fn learn_capacity(&self, ack: &StartAck) {
        if let Some(cap) = ack.max_inflight.filter(|cap| *cap > 0) {
            self.max_inflight.send_if_modified(|known| {
                if *known == Some(cap) {
                    return false;
                }
                tracing::info!(max_inflight = cap, "learned service concurrency cap");
                *known = Some(cap);
                true
            });
        }
        if ack.is_capacity_constrained() {
            self.capacity_hint.store(true, Ordering::SeqCst);
        }
    }

    /// Cancel the thread's job, locally and on the service.
    ///
    /// The job turns `cancelled` immediately; the service's reply then wins,
    /// so a job that finished in the meantime ends `done`. Returns the status
    /// recorded from the reply.
    pub async fn cancel(&self, thread_id: &ThreadId) -> JobStatus {
        if let Some((_, token)) = self.tokens().remove(thread_id) {
            token.cancel();
        }
        let generation = self.registry.set(thread_id, JobStatus::Cancelled, None);

        let (status, error) = match self.api.cancel(thread_id).await {
            Ok(reply) => match reply.status {
                JobStatus::Done => (JobStatus::Done, None),
                JobStatus::Error => (JobStatus::Error, reply.error),
                _ => (JobStatus::Cancelled, None),
            },
            Err(e) => {
                tracing::warn!(thread_id = %thread_id, error = %e, "remote cancel failed");
                (JobStatus::Error, Some(CANCEL_FAILURE_MESSAGE.to_string()))
            }
        };
        self.registry.set_if_current(thread_id, generation, status, error);
        tracing::info!(thread_id = %thread_id, status = %status, "judge run cancelled");
        status
    }

    /// Turn auto-run off, abort the running batch and cancel every active job.
    ///
    /// Returns the number of jobs cancelled.
    pub async fn cancel_all(&self) -> usize {
        self.auto_run.disable();
        self.abort_batch();
        let targets = self.registry.active_ids();
        tracing::info!(count = targets.len(), "cancelling all active judge runs");
        for thread_id in &targets {
            self.cancel(thread_id).await;
        }
        targets.len()
    }

    /// Start `ids` one after another, publishing progress as it goes.
    ///
    /// Stops early when the batch is aborted or a start fails on quota.
    /// Returns the final progress, or `None` for an empty list.
    pub async fn start_batch(
        &self,
        ids: Vec<ThreadId>,
        label: impl Into<String>,
        model: &ModelId,
    ) -> Option<BatchProgress> {
        self.submit_batch(ids, label.into(), model, false).await
    }

    /// Like [`Self::start_batch`], but also stops once the active count
    /// reaches the concurrency cap. The cap is re-read before every start,
    /// so a lower cap learned from the first acknowledgement takes effect
    /// within the same batch.
    pub async fn start_batch_within_cap(
        &self,
        ids: Vec<ThreadId>,
        label: impl Into<String>,
        model: &ModelId,
    ) -> Option<BatchProgress> {
        self.submit_batch(ids, label.into(), model, true).await
    }

    async fn submit_batch(
        &self,
        ids: Vec<ThreadId>,
        label: String,
        model: &ModelId,
        within_cap: bool,
    ) -> Option<BatchProgress> {
        if ids.is_empty() {
            return None;
        }
        let id = BatchId::new();
        tracing::info!(batch = %id, label = %label, total = ids.len(), "batch submission started");
        self.batch.send_replace(Some(BatchProgress {
            id,
            label,
            total: ids.len(),
            queued: 0,
            running: true,
        }));

        let mut queued = 0;
        for thread_id in &ids {
            if !self.batch_live(id) {
                tracing::info!(batch = %id, queued, "batch aborted");
                break;
            }
            if within_cap && self.registry.active_count() >= self.max_inflight() {
                tracing::info!(
                    batch = %id,
                    queued,
                    max_inflight = self.max_inflight(),
                    "concurrency cap reached, batch stopped"
                );
                break;
            }
            let outcome = self.start(thread_id, model).await;
            queued += 1;
            self.update_batch(id, |batch| batch.queued = queued);
            if let StartOutcome::Failed {
                kind: FailureKind::QuotaExhausted,
                ..
            } = outcome
            {
                tracing::warn!(
                    batch = %id,
                    thread_id = %thread_id,
                    "quota exhausted, batch stopped"
                );
                break;
            }
        }
        self.update_batch(id, |batch| {
            batch.queued = queued;
            batch.running = false;
        });
        self.batch_progress().filter(|batch| batch.id == id)
    }

    fn batch_live(&self, id: BatchId) -> bool {
        self.batch
            .borrow()
            .as_ref()
            .is_some_and(|batch| batch.id == id && batch.running)
    }

    fn update_batch(&self, id: BatchId, apply: impl FnOnce(&mut BatchProgress)) {
        self.batch.send_if_modified(|batch| match batch {
            Some(batch) if batch.id == id => {
                apply(batch);
                true
            }
            _ => false,
        });
    }

    /// Stop issuing starts for the running batch. Jobs already started keep running.
    pub fn abort_batch(&self) {
        self.batch.send_if_modified(|batch| match batch {
            Some(batch) if batch.running => {
                batch.running = false;
                true
            }
            _ => false,
        });
    }

    /// Forget the batch entirely.
    pub fn clear_batch(&self) {
        self.batch.send_if_modified(|batch| batch.take().is_some());
    }

    pub fn batch_progress(&self) -> Option<BatchProgress> {
        self.batch.borrow().clone()
    }

    /// True while a batch is mid-submission.
    pub fn batch_running(&self) -> bool {
        self.batch.borrow().as_ref().is_some_and(|b| b.running)
    }

    pub fn subscribe_batch(&self) -> watch::Receiver<Option<BatchProgress>> {
        self.batch.subscribe()
    }

    /// Effective concurrency cap: the service's, or the configured default.
    pub fn max_inflight(&self) -> usize {
        self.max_inflight
            .borrow()
            .unwrap_or(self.default_max_inflight)
    }

    /// Cap reported by the service, if any start was acknowledged yet.
    pub fn learned_max_inflight(&self) -> Option<usize> {
        *self.max_inflight.borrow()
    }

    pub fn subscribe_max_inflight(&self) -> watch::Receiver<Option<usize>> {
        self.max_inflight.subscribe()
    }

    /// Whether new runs are waiting for a free slot on the service.
    ///
    /// Cleared once nothing is active any more.
    pub fn capacity_hint(&self) -> bool {
        if self.registry.active_count() == 0 {
            self.capacity_hint.store(false, Ordering::SeqCst);
            return false;
        }
        self.capacity_hint.load(Ordering::SeqCst)
    }

    pub fn registry(&self) -> &Arc<JobRegistry> {
        &self.registry
    }
}
