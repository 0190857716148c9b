//! Batched status reconciliation.
//!
//! One round collects every active thread, asks the service for their
//! status in as few requests as possible and merges the answers into the
//! registry in one step. The run loop fires rounds on an interval that grows
//! with the number of active jobs and stops when nothing is active.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use triage_core::{GuessFilter, ThreadId};

use crate::api::{JudgeApi, QueueSource};
use crate::config::{BULK_STATUS_LIMIT, JobsConfig, PollPolicy};
use crate::debounce::Debouncer;
use crate::quota::QuotaMonitor;
use crate::registry::JobRegistry;
use crate::view::ViewState;

/// Result of one [`Poller::poll_round`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    /// Another round is still in flight.
    Skipped,
    /// Nothing is active.
    Idle,
    Completed {
        applied: usize,
        stale: usize,
        completed: Vec<ThreadId>,
    },
    /// The status request failed; the registry is unchanged.
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FlightState {
    Idle,
    InFlight,
}

/// Holds the poller in `InFlight` until dropped.
struct FlightGuard<'a> {
    state: &'a Mutex<FlightState>,
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = FlightState::Idle;
    }
}

pub struct Poller<A> {
    api: Arc<A>,
    registry: Arc<JobRegistry>,
    view: Arc<ViewState>,
    quota: Arc<QuotaMonitor<A>>,
    policy: PollPolicy,
    flight: Mutex<FlightState>,
    queue_refresh: Debouncer,
    page_size: usize,
    interval: watch::Sender<Option<Duration>>,
}

impl<A: JudgeApi + QueueSource> Poller<A> {
    pub fn new(
        api: Arc<A>,
        registry: Arc<JobRegistry>,
        view: Arc<ViewState>,
        quota: Arc<QuotaMonitor<A>>,
        config: &JobsConfig,
    ) -> Self {
        Self {
            api,
            registry,
            view,
            quota,
            policy: config.poll,
            flight: Mutex::new(FlightState::Idle),
            queue_refresh: Debouncer::new(config.queue_refresh_delay),
            page_size: config.queue_page_size,
            interval: watch::channel(None).0,
        }
    }

    fn try_begin(&self) -> Option<FlightGuard<'_>> {
        let mut state = self.flight.lock().unwrap_or_else(PoisonError::into_inner);
        if *state == FlightState::InFlight {
            return None;
        }
        *state = FlightState::InFlight;
        Some(FlightGuard { state: &self.flight })
    }

    /// True while a round is outstanding.
    pub fn in_flight(&self) -> bool {
        *self.flight.lock().unwrap_or_else(PoisonError::into_inner) == FlightState::InFlight
    }

    /// Polling interval in effect; `None` while nothing is active.
    pub fn interval(&self) -> Option<Duration> {
        *self.interval.borrow()
    }

    pub fn subscribe_interval(&self) -> watch::Receiver<Option<Duration>> {
        self.interval.subscribe()
    }

    /// Run one reconciliation round, unless one is already in flight.
    pub async fn poll_round(&self) -> PollOutcome {
        let Some(_flight) = self.try_begin() else {
            tracing::trace!("poll round skipped, previous round in flight");
            return PollOutcome::Skipped;
        };

        let snapshot = self.registry.active_snapshot();
        if snapshot.is_empty() {
            return PollOutcome::Idle;
        }
        let ids: Vec<ThreadId> = snapshot.iter().map(|(id, _)| id.clone()).collect();
        let expected: HashMap<_, _> = snapshot.into_iter().collect();

        let mut items = Vec::with_capacity(ids.len());
        for chunk in ids.chunks(BULK_STATUS_LIMIT) {
            match self.api.bulk_status(chunk).await {
                Ok(mut part) => items.append(&mut part),
                Err(e) => {
                    tracing::warn!(active = ids.len(), error = %e, "status poll failed");
                    return PollOutcome::Failed;
                }
            }
        }

        let report = self.registry.merge_round(items, &expected);
        tracing::debug!(
            active = ids.len(),
            applied = report.applied,
            stale = report.stale,
            completed = report.completed.len(),
            "poll round merged"
        );

        if !report.completed.is_empty() {
            self.schedule_queue_refresh();
            self.quota.refresh(false).await;
            if let Some(selected) = self
                .view
                .selected()
                .filter(|selected| report.completed.contains(selected))
            {
                self.refresh_detail(&selected).await;
            }
        }

        PollOutcome::Completed {
            applied: report.applied,
            stale: report.stale,
            completed: report.completed,
        }
    }

    /// Reload the queue view after the debounce delay. Returns `false` when
    /// folded into an already pending reload.
    pub fn schedule_queue_refresh(&self) -> bool {
        let api = self.api.clone();
        let view = self.view.clone();
        let filter = view.filter();
        let limit = self.page_size;
        self.queue_refresh.schedule(move || async move {
            refresh_queue(api.as_ref(), &view, filter, limit).await;
        })
    }

    async fn refresh_detail(&self, thread_id: &ThreadId) {
        match self.api.thread_detail(thread_id).await {
            Ok(detail) => {
                if self.view.selected().as_ref() != Some(thread_id) {
                    return;
                }
                tracing::info!(
                    thread_id = %thread_id,
                    suggestion = detail.suggestion().unwrap_or_default(),
                    "open thread judged"
                );
                self.view.show_detail(detail);
            }
            Err(e) => {
                tracing::warn!(
                    thread_id = %thread_id,
                    error = %e,
                    "failed to refresh thread detail"
                );
            }
        }
    }

    /// Poll until `shutdown` fires.
    ///
    /// The interval follows the active count; the timer is only rebuilt when
    /// the tier changes. Rounds run in their own task so a slow round does
    /// not hold up the loop, and overlapping ticks are skipped. On shutdown
    /// outstanding rounds and a pending queue reload are aborted, so nothing
    /// touches the registry after this returns.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let mut changes = self.registry.subscribe();
        let mut ticker: Option<Interval> = None;
        let mut rounds = JoinSet::new();
        tracing::debug!("poller started");

        loop {
            let wanted = self.policy.interval_for(self.registry.active_count());
            if wanted != self.interval() {
                ticker = wanted.map(|period| {
                    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
                    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
                    ticker
                });
                match wanted {
                    Some(period) => tracing::info!(
                        interval_ms = period.as_millis() as u64,
                        active = self.registry.active_count(),
                        "poll interval changed"
                    ),
                    None => tracing::debug!("nothing active, polling stopped"),
                }
                self.interval.send_replace(wanted);
            }

            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                res = changes.changed() => {
                    if res.is_err() {
                        break;
                    }
                }
                Some(res) = rounds.join_next(), if !rounds.is_empty() => {
                    if let Err(e) = res {
                        tracing::warn!(error = %e, "poll round ended abnormally");
                    }
                }
                _ = next_tick(&mut ticker) => {
                    let poller = self.clone();
                    rounds.spawn(async move {
                        poller.poll_round().await;
                    });
                }
            }
        }
        rounds.shutdown().await;
        self.queue_refresh.cancel();
        tracing::debug!("poller stopped");
    }
}

async fn next_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending().await,
    }
}

/// Load the first page of the queue for `filter` into the view, unless the
/// operator switched filters in the meantime.
pub(crate) async fn refresh_queue<Q: QueueSource + ?Sized>(
    source: &Q,
    view: &ViewState,
    filter: GuessFilter,
    limit: usize,
) -> bool {
    match source.load_queue(filter, limit).await {
        Ok(items) => {
            if view.filter() != filter {
                tracing::debug!("queue filter changed during reload, result dropped");
                return false;
            }
            tracing::debug!(items = items.len(), "queue view refreshed");
            view.replace_items(items);
            true
        }
        Err(e) => {
            tracing::warn!(error = %e, "failed to reload queue");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{JudgeApi as _, ThreadDetail};
    use crate::error::ApiError;
    use crate::memory::{CallCounts, InMemoryJudgeApi};
    use crate::view::QueueSnapshot;
    use triage_core::{JobStatus, ModelId, QueueItem};

    fn tid(s: &str) -> ThreadId {
        ThreadId::new(s).unwrap()
    }

    fn poller(
        api: Arc<InMemoryJudgeApi>,
    ) -> (Arc<Poller<InMemoryJudgeApi>>, Arc<JobRegistry>, Arc<ViewState>) {
        let config = JobsConfig::default();
        let registry = Arc::new(JobRegistry::new());
        let view = Arc::new(ViewState::new());
        let quota = Arc::new(QuotaMonitor::new(api.clone(), &config));
        let poller = Arc::new(Poller::new(api, registry.clone(), view.clone(), quota, &config));
        (poller, registry, view)
    }

    async fn wait_for_status_calls(api: &InMemoryJudgeApi, n: usize) {
        while CallCounts::get(&api.calls().bulk_status) < n {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn idle_registry_sends_nothing() {
        let api = Arc::new(InMemoryJudgeApi::new());
        let (poller, _, _) = poller(api.clone());

        assert_eq!(poller.poll_round().await, PollOutcome::Idle);
        assert_eq!(CallCounts::get(&api.calls().bulk_status), 0);
    }

    #[tokio::test]
    async fn overlapping_rounds_are_skipped() {
        let api = Arc::new(InMemoryJudgeApi::new());
        let (poller, registry, _) = poller(api.clone());
        registry.set(&tid("1"), JobStatus::Running, None);
        api.set_remote_status(&tid("1"), JobStatus::Running);
        api.hold_status();

        let first = {
            let poller = poller.clone();
            tokio::spawn(async move { poller.poll_round().await })
        };
        wait_for_status_calls(&api, 1).await;
        assert!(poller.in_flight());

        assert_eq!(poller.poll_round().await, PollOutcome::Skipped);
        api.release_status();

        assert!(matches!(first.await.unwrap(), PollOutcome::Completed { applied: 1, .. }));
        assert!(!poller.in_flight());
        assert_eq!(CallCounts::get(&api.calls().bulk_status), 1);
    }

    #[tokio::test]
    async fn cancel_during_round_wins() {
        let api = Arc::new(InMemoryJudgeApi::new());
        let (poller, registry, _) = poller(api.clone());
        registry.set(&tid("1"), JobStatus::Running, None);
        api.set_remote_status(&tid("1"), JobStatus::Running);
        api.hold_status();

        let round = {
            let poller = poller.clone();
            tokio::spawn(async move { poller.poll_round().await })
        };
        wait_for_status_calls(&api, 1).await;
        registry.set(&tid("1"), JobStatus::Cancelled, None);
        api.release_status();

        let outcome = round.await.unwrap();
        assert!(matches!(outcome, PollOutcome::Completed { applied: 0, stale: 1, .. }));
        assert_eq!(registry.get(&tid("1")).unwrap().status, JobStatus::Cancelled);
    }

    #[tokio::test]
    async fn failed_round_leaves_registry_alone() {
        let api = Arc::new(InMemoryJudgeApi::new());
        let (poller, registry, _) = poller(api.clone());
        registry.set(&tid("1"), JobStatus::Queued, None);
        api.complete(&tid("1"), "open");
        api.fail_next_status(ApiError::Transport("timed out".into()));

        assert_eq!(poller.poll_round().await, PollOutcome::Failed);
        assert_eq!(registry.get(&tid("1")).unwrap().status, JobStatus::Queued);
    }

    #[tokio::test]
    async fn large_rounds_are_chunked() {
        let api = Arc::new(InMemoryJudgeApi::new());
        let (poller, registry, _) = poller(api.clone());
        for i in 0..450 {
            registry.set(&tid(&i.to_string()), JobStatus::Running, None);
        }

        poller.poll_round().await;
        assert_eq!(CallCounts::get(&api.calls().bulk_status), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn completion_refreshes_queue_quota_and_open_thread() {
        let api = Arc::new(InMemoryJudgeApi::with_backlog(2));
        let (poller, registry, view) = poller(api.clone());
        let items = vec![
            QueueItem::new(tid("1"), "Thread 1"),
            QueueItem::new(tid("2"), "Thread 2"),
        ];
        view.set_queue(QueueSnapshot::new(GuessFilter::WithoutGuess, items));
        view.select(Some(tid("1")));
        api.set_detail(&tid("1"), ThreadDetail::default());

        api.start(&tid("1"), &ModelId::auto()).await.unwrap();
        registry.set(&tid("1"), JobStatus::Queued, None);
        api.complete(&tid("1"), "duplicate");

        let outcome = poller.poll_round().await;
        assert_eq!(
            outcome,
            PollOutcome::Completed {
                applied: 1,
                stale: 0,
                completed: vec![tid("1")],
            }
        );
        assert_eq!(view.detail().unwrap().suggestion(), Some("duplicate"));
        assert_eq!(CallCounts::get(&api.calls().quota), 1);

        // Queue reload is debounced.
        assert_eq!(view.queue().items.len(), 2);
        tokio::time::sleep(Duration::from_millis(601)).await;
        let queue = view.queue();
        assert_eq!(queue.items.len(), 1);
        assert_eq!(queue.items[0].thread_id, tid("2"));
        assert_eq!(CallCounts::get(&api.calls().queue), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn interval_follows_active_count() {
        let api = Arc::new(InMemoryJudgeApi::new());
        let (poller, registry, _) = poller(api.clone());
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(poller.clone().run(shutdown.clone()));
        let mut interval = poller.subscribe_interval();

        let mut busy = |i: usize| {
            api.set_remote_status(&tid(&i.to_string()), JobStatus::Running);
            registry.set(&tid(&i.to_string()), JobStatus::Running, None);
        };
        (0..9).for_each(&mut busy);
        interval
            .wait_for(|i| *i == Some(Duration::from_millis(2000)))
            .await
            .unwrap();

        (9..11).for_each(&mut busy);
        interval
            .wait_for(|i| *i == Some(Duration::from_millis(3000)))
            .await
            .unwrap();

        for i in 0..11 {
            registry.set(&tid(&i.to_string()), JobStatus::Done, None);
        }
        interval.wait_for(|i| i.is_none()).await.unwrap();

        shutdown.cancel();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn run_loop_polls_on_the_interval() {
        let api = Arc::new(InMemoryJudgeApi::new());
        let (poller, registry, _) = poller(api.clone());
        registry.set(&tid("1"), JobStatus::Running, None);
        api.set_remote_status(&tid("1"), JobStatus::Running);
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(poller.clone().run(shutdown.clone()));

        tokio::time::sleep(Duration::from_millis(1900)).await;
        assert_eq!(CallCounts::get(&api.calls().bulk_status), 0);

        tokio::time::sleep(Duration::from_millis(4200)).await;
        assert_eq!(CallCounts::get(&api.calls().bulk_status), 3);

        shutdown.cancel();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_aborts_the_round_in_flight() {
        let api = Arc::new(InMemoryJudgeApi::new());
        let (poller, registry, _) = poller(api.clone());
        registry.set(&tid("1"), JobStatus::Running, None);
        api.complete(&tid("1"), "open");
        api.hold_status();
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(poller.clone().run(shutdown.clone()));

        tokio::time::sleep(Duration::from_millis(2100)).await;
        wait_for_status_calls(&api, 1).await;
        assert!(poller.in_flight());
        shutdown.cancel();
        task.await.unwrap();
        assert!(!poller.in_flight());

        api.release_status();
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(registry.get(&tid("1")).unwrap().status, JobStatus::Running);
        assert_eq!(CallCounts::get(&api.calls().bulk_status), 1);
    }
}
