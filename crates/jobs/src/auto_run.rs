//! Keeps the unguessed backlog flowing up to the service's concurrency cap.
//!
//! The controller is level-triggered: [`AutoRunController::tick`] looks at the
//! current state and decides; [`AutoRunController::run`] calls it again every
//! time one of its inputs changes.

use std::sync::Arc;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use triage_core::{GuessFilter, ThreadId};

use crate::api::JudgeApi;
use crate::quota::QuotaMonitor;
use crate::registry::JobRegistry;
use crate::scheduler::Scheduler;
use crate::view::ViewState;

/// Operator toggle for auto-run.
#[derive(Debug)]
pub struct AutoRunSwitch {
    enabled: watch::Sender<bool>,
}

impl AutoRunSwitch {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled: watch::channel(enabled).0,
        }
    }

    /// Returns `true` if the switch was off.
    pub fn enable(&self) -> bool {
        self.set(true)
    }

    /// Returns `true` if the switch was on.
    pub fn disable(&self) -> bool {
        self.set(false)
    }

    fn set(&self, enabled: bool) -> bool {
        self.enabled.send_if_modified(|current| {
            let changed = *current != enabled;
            *current = enabled;
            changed
        })
    }

    pub fn is_enabled(&self) -> bool {
        *self.enabled.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.enabled.subscribe()
    }
}

/// Decision taken by one [`AutoRunController::tick`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    Disabled,
    /// A batch is still being submitted.
    BatchInFlight,
    /// A job failed on quota; auto-run switched itself off.
    QuotaHalted,
    /// Every slot up to the cap is taken.
    NoSlots,
    /// The visible queue is not restricted to unguessed threads.
    FilterNotRestricted,
    NoCandidates,
    /// A batch was submitted; this many starts were issued.
    Submitted(usize),
}

pub struct AutoRunController<A> {
    scheduler: Arc<Scheduler<A>>,
    registry: Arc<JobRegistry>,
    view: Arc<ViewState>,
    quota: Arc<QuotaMonitor<A>>,
    switch: Arc<AutoRunSwitch>,
}

impl<A: JudgeApi> AutoRunController<A> {
    pub fn new(
        scheduler: Arc<Scheduler<A>>,
        view: Arc<ViewState>,
        quota: Arc<QuotaMonitor<A>>,
        switch: Arc<AutoRunSwitch>,
    ) -> Self {
        Self {
            registry: scheduler.registry().clone(),
            scheduler,
            view,
            quota,
            switch,
        }
    }

    /// Evaluate the current state once and submit a batch if there is room.
    pub async fn tick(&self) -> TickOutcome {
        if !self.switch.is_enabled() {
            return TickOutcome::Disabled;
        }
        if self.scheduler.batch_running() {
            return TickOutcome::BatchInFlight;
        }

        if let Some(job) = self.registry.quota_error() {
            self.switch.disable();
            tracing::warn!(
                thread_id = %job.thread_id,
                error = job.error.as_deref().unwrap_or_default(),
                "quota exhausted, auto-run disabled"
            );
            self.quota.refresh(true).await;
            if let Some(error) = job.error.as_deref() {
                self.quota.note_job_exhaustion(error);
            }
            self.scheduler.clear_batch();
            return TickOutcome::QuotaHalted;
        }

        let cap = self.scheduler.max_inflight();
        let active = self.registry.active_count();
        let slots = cap.saturating_sub(active);
        if slots == 0 {
            return TickOutcome::NoSlots;
        }

        let queue = self.view.queue();
        if queue.filter != GuessFilter::WithoutGuess {
            return TickOutcome::FilterNotRestricted;
        }
        let batch: Vec<ThreadId> = queue
            .unguessed()
            .filter(|item| !self.registry.contains(&item.thread_id))
            .take(slots)
            .map(|item| item.thread_id.clone())
            .collect();
        if batch.is_empty() {
            return TickOutcome::NoCandidates;
        }

        let planned = batch.len();
        tracing::info!(planned, active, cap, "auto-run submitting batch");
        let progress = self
            .scheduler
            .start_batch_within_cap(batch, format!("Auto ({planned})"), &self.view.model())
            .await;
        TickOutcome::Submitted(progress.map_or(0, |batch| batch.queued))
    }

    /// Tick whenever the registry, the cap, the batch, the switch or the
    /// queue view changes, until `shutdown` fires.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let mut registry = self.registry.subscribe();
        let mut cap = self.scheduler.subscribe_max_inflight();
        let mut batch = self.scheduler.subscribe_batch();
        let mut enabled = self.switch.subscribe();
        let mut queue = self.view.subscribe_queue();
        tracing::debug!("auto-run loop started");

        loop {
            let outcome = self.tick().await;
            tracing::trace!(?outcome, "auto-run tick");

            let changed = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                res = registry.changed() => res,
                res = cap.changed() => res,
                res = batch.changed() => res,
                res = enabled.changed() => res,
                res = queue.changed() => res,
            };
            if changed.is_err() {
                break;
            }
        }
        tracing::debug!("auto-run loop stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::JobsConfig;
    use crate::memory::InMemoryJudgeApi;
    use crate::poller::Poller;
    use crate::view::QueueSnapshot;
    use proptest::prelude::*;
    use triage_core::{JobStatus, QueueItem};

    struct Fixture {
        api: Arc<InMemoryJudgeApi>,
        registry: Arc<JobRegistry>,
        view: Arc<ViewState>,
        quota: Arc<QuotaMonitor<InMemoryJudgeApi>>,
        switch: Arc<AutoRunSwitch>,
        poller: Poller<InMemoryJudgeApi>,
        controller: AutoRunController<InMemoryJudgeApi>,
    }

    fn tid(s: &str) -> ThreadId {
        ThreadId::new(s).unwrap()
    }

    fn fixture(cap: usize, candidates: usize) -> Fixture {
        fixture_with_caps(cap, cap, candidates)
    }

    /// `service_cap` is what acknowledgements report; `default_cap` is what
    /// the scheduler assumes before the first one.
    fn fixture_with_caps(service_cap: usize, default_cap: usize, candidates: usize) -> Fixture {
        let api = Arc::new(InMemoryJudgeApi::with_backlog(candidates));
        api.set_max_inflight(service_cap);
        let config = JobsConfig::default().with_default_max_inflight(default_cap);
        let registry = Arc::new(JobRegistry::new());
        let switch = Arc::new(AutoRunSwitch::new(true));
        let view = Arc::new(ViewState::new());
        let items = (1..=candidates)
            .map(|i| QueueItem::new(tid(&i.to_string()), format!("Thread {i}")))
            .collect();
        view.set_queue(QueueSnapshot::new(GuessFilter::WithoutGuess, items));
        let quota = Arc::new(QuotaMonitor::new(api.clone(), &config));
        let scheduler = Arc::new(Scheduler::new(
            api.clone(),
            registry.clone(),
            switch.clone(),
            &config,
        ));
        let poller = Poller::new(
            api.clone(),
            registry.clone(),
            view.clone(),
            quota.clone(),
            &config,
        );
        let controller =
            AutoRunController::new(scheduler, view.clone(), quota.clone(), switch.clone());
        Fixture {
            api,
            registry,
            view,
            quota,
            switch,
            poller,
            controller,
        }
    }

    #[tokio::test]
    async fn fills_free_slots_and_then_one_more() {
        let f = fixture(2, 5);

        assert_eq!(f.controller.tick().await, TickOutcome::Submitted(2));
        assert_eq!(f.registry.active_ids(), vec![tid("1"), tid("2")]);
        assert_eq!(f.controller.tick().await, TickOutcome::NoSlots);

        f.api.complete(&tid("1"), "open");
        assert_eq!(f.controller.tick().await, TickOutcome::NoSlots);
        f.poller.poll_round().await;
        assert_eq!(f.registry.get(&tid("1")).unwrap().status, JobStatus::Done);

        assert_eq!(f.controller.tick().await, TickOutcome::Submitted(1));
        assert_eq!(f.registry.active_ids(), vec![tid("2"), tid("3")]);
        assert_eq!(f.api.started(), vec![tid("1"), tid("2"), tid("3")]);
    }

    #[tokio::test]
    async fn lower_service_cap_stops_the_first_batch() {
        let f = fixture_with_caps(2, 8, 10);

        assert_eq!(f.controller.tick().await, TickOutcome::Submitted(2));
        assert_eq!(f.controller.scheduler.max_inflight(), 2);
        assert_eq!(f.registry.active_count(), 2);
        assert_eq!(f.api.started(), vec![tid("1"), tid("2")]);
        assert_eq!(f.controller.tick().await, TickOutcome::NoSlots);
    }

    #[tokio::test]
    async fn never_resubmits_tracked_threads() {
        let f = fixture(4, 2);
        f.registry.set(&tid("1"), JobStatus::Error, Some("LLM timed out".into()));

        assert_eq!(f.controller.tick().await, TickOutcome::Submitted(1));
        assert_eq!(f.controller.tick().await, TickOutcome::NoCandidates);
        assert_eq!(f.api.started(), vec![tid("2")]);
    }

    #[tokio::test]
    async fn requires_the_unguessed_filter() {
        let f = fixture(2, 3);
        f.view
            .set_queue(QueueSnapshot::new(GuessFilter::Any, f.view.queue().items));

        assert_eq!(f.controller.tick().await, TickOutcome::FilterNotRestricted);
        assert!(f.api.started().is_empty());
    }

    #[tokio::test]
    async fn quota_error_halts_auto_run() {
        let f = fixture(3, 3);
        f.registry.set(
            &tid("9"),
            JobStatus::Error,
            Some("LLM quota exhausted; try later".into()),
        );

        assert_eq!(f.controller.tick().await, TickOutcome::QuotaHalted);
        assert!(!f.switch.is_enabled());
        assert!(f.quota.note().is_some_and(|note| !note.is_empty()));
        assert!(f.api.started().is_empty());

        assert_eq!(f.controller.tick().await, TickOutcome::Disabled);
    }

    #[tokio::test]
    async fn disabled_switch_does_nothing() {
        let f = fixture(2, 2);
        assert!(f.switch.disable());
        assert!(!f.switch.disable());
        assert_eq!(f.controller.tick().await, TickOutcome::Disabled);
    }

    #[tokio::test]
    async fn run_loop_reacts_to_the_switch() {
        let f = fixture(2, 2);
        f.switch.disable();
        let controller = Arc::new(f.controller);
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(controller.run(shutdown.clone()));

        tokio::task::yield_now().await;
        assert!(f.api.started().is_empty());

        f.switch.enable();
        while f.registry.active_count() < 2 {
            tokio::task::yield_now().await;
        }
        shutdown.cancel();
        task.await.unwrap();
        assert_eq!(f.api.started(), vec![tid("1"), tid("2")]);
    }

    #[derive(Debug, Clone)]
    enum Step {
        Tick,
        PollRound,
        /// Finish the n-th active job (modulo the active count) on the service.
        CompleteRemote(usize),
    }

    fn step() -> impl Strategy<Value = Step> {
        prop_oneof![
            3 => Just(Step::Tick),
            2 => Just(Step::PollRound),
            2 => (0usize..8).prop_map(Step::CompleteRemote),
        ]
    }

    proptest! {
        #![proptest_config(ProptestConfig { cases: 64, ..ProptestConfig::default() })]

        #[test]
        fn tick_never_exceeds_cap(
            service_cap in 1usize..6,
            default_cap in 1usize..10,
            candidates in 0usize..12,
            steps in proptest::collection::vec(step(), 1..32),
        ) {
            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .unwrap();
            rt.block_on(async {
                let f = fixture_with_caps(service_cap, default_cap, candidates);
                for step in steps {
                    match step {
                        Step::Tick => {
                            f.controller.tick().await;
                            let cap = f.controller.scheduler.max_inflight();
                            prop_assert!(f.registry.active_count() <= cap);
                        }
                        Step::PollRound => {
                            f.poller.poll_round().await;
                        }
                        Step::CompleteRemote(n) => {
                            let active = f.registry.active_ids();
                            if !active.is_empty() {
                                f.api.complete(&active[n % active.len()], "open");
                            }
                        }
                    }
                }

                let started = f.api.started();
                let mut unique = started.clone();
                unique.sort();
                unique.dedup();
                prop_assert_eq!(unique.len(), started.len());
                Ok(())
            })?;
        }
    }
}
