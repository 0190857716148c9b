//! Wiring of registry, scheduler, poller, auto-run and quota monitor.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use triage_core::{GuessFilter, Job, JobCounts, JobStatus, ModelId, ThreadId};

use crate::api::{JudgeApi, QueueSource};
use crate::auto_run::{AutoRunController, AutoRunSwitch};
use crate::config::JobsConfig;
use crate::error::ApiError;
use crate::poller::{Poller, refresh_queue};
use crate::quota::QuotaMonitor;
use crate::registry::JobRegistry;
use crate::scheduler::{BatchProgress, Scheduler, StartOutcome};
use crate::view::{QueueSnapshot, ViewState};

/// Everything the console shows about judge runs, at one instant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsoleSnapshot {
    pub counts: JobCounts,
    pub progress_percent: u8,
    pub active: usize,
    pub batch: Option<BatchProgress>,
    pub quota_note: Option<String>,
    pub auto_run: bool,
    pub max_inflight: usize,
    pub capacity_hint: bool,
    pub poll_interval: Option<Duration>,
}

pub struct Orchestrator<A> {
    api: Arc<A>,
    registry: Arc<JobRegistry>,
    view: Arc<ViewState>,
    switch: Arc<AutoRunSwitch>,
    scheduler: Arc<Scheduler<A>>,
    poller: Arc<Poller<A>>,
    quota: Arc<QuotaMonitor<A>>,
    auto_run: Arc<AutoRunController<A>>,
    page_size: usize,
}

impl<A: JudgeApi + QueueSource> Orchestrator<A> {
    /// Build the components around `api`. Auto-run starts disabled.
    pub fn new(api: Arc<A>, config: &JobsConfig) -> Self {
        let registry = Arc::new(JobRegistry::new());
        let view = Arc::new(ViewState::new());
        view.set_model(config.model.clone());
        let switch = Arc::new(AutoRunSwitch::new(false));
        let quota = Arc::new(QuotaMonitor::new(api.clone(), config));
        let scheduler = Arc::new(Scheduler::new(
            api.clone(),
            registry.clone(),
            switch.clone(),
            config,
        ));
        let poller = Arc::new(Poller::new(
            api.clone(),
            registry.clone(),
            view.clone(),
            quota.clone(),
            config,
        ));
        let auto_run = Arc::new(AutoRunController::new(
            scheduler.clone(),
            view.clone(),
            quota.clone(),
            switch.clone(),
        ));
        Self {
            api,
            registry,
            view,
            switch,
            scheduler,
            poller,
            quota,
            auto_run,
            page_size: config.queue_page_size,
        }
    }

    pub fn registry(&self) -> &Arc<JobRegistry> {
        &self.registry
    }

    pub fn view(&self) -> &Arc<ViewState> {
        &self.view
    }

    pub fn scheduler(&self) -> &Arc<Scheduler<A>> {
        &self.scheduler
    }

    pub fn poller(&self) -> &Arc<Poller<A>> {
        &self.poller
    }

    pub fn quota(&self) -> &Arc<QuotaMonitor<A>> {
        &self.quota
    }

    /// Adopt jobs that are already active on the service (started by an
    /// earlier session or another console).
    pub async fn seed_from_remote(&self) -> Result<usize, ApiError> {
        let items = self.api.active_jobs().await?;
        let seeded = self.registry.seed(items);
        tracing::info!(seeded, "registry seeded from active jobs");
        Ok(seeded)
    }

    /// Load the first queue page for `filter` and make it the visible queue.
    pub async fn load_queue(&self, filter: GuessFilter) -> Result<usize, ApiError> {
        let items = self.api.load_queue(filter, self.page_size).await?;
        let loaded = items.len();
        self.view.set_queue(QueueSnapshot::new(filter, items));
        tracing::debug!(filter = ?filter, loaded, "queue loaded");
        Ok(loaded)
    }

    /// Reload the visible queue with its current filter.
    pub async fn refresh_queue(&self) -> bool {
        refresh_queue(self.api.as_ref(), &self.view, self.view.filter(), self.page_size).await
    }

    pub async fn start(&self, thread_id: &ThreadId) -> StartOutcome {
        self.scheduler.start(thread_id, &self.view.model()).await
    }

    pub async fn cancel(&self, thread_id: &ThreadId) -> JobStatus {
        self.scheduler.cancel(thread_id).await
    }

    pub async fn cancel_all(&self) -> usize {
        self.scheduler.cancel_all().await
    }

    pub async fn start_batch(
        &self,
        ids: Vec<ThreadId>,
        label: impl Into<String>,
    ) -> Option<BatchProgress> {
        self.scheduler
            .start_batch(ids, label, &self.view.model())
            .await
    }

    /// Submit every visible queue item as one batch.
    pub async fn start_visible(&self) -> Option<BatchProgress> {
        let ids: Vec<ThreadId> = self
            .view
            .queue()
            .items
            .into_iter()
            .map(|item| item.thread_id)
            .collect();
        let label = format!("Visible ({})", ids.len());
        self.start_batch(ids, label).await
    }

    pub fn abort_batch(&self) {
        self.scheduler.abort_batch();
    }

    pub fn clear_finished(&self) -> usize {
        self.registry.clear_finished()
    }

    /// Turn auto-run on or off. Enabling re-checks quota right away.
    pub async fn set_auto_run(&self, enabled: bool) {
        if enabled {
            if self.switch.enable() {
                tracing::info!("auto-run enabled");
            }
            self.quota.refresh(true).await;
        } else if self.switch.disable() {
            tracing::info!("auto-run disabled");
        }
    }

    pub fn auto_run_enabled(&self) -> bool {
        self.switch.is_enabled()
    }

    /// Select the model for new runs and re-check its quota.
    pub async fn set_model(&self, model: ModelId) {
        if self.view.set_model(model.clone()) {
            tracing::info!(model = %model, "model changed");
        }
        self.quota.set_model(model);
        self.quota.refresh(true).await;
    }

    /// Open a thread in the detail pane (or close it with `None`).
    pub fn select_thread(&self, thread_id: Option<ThreadId>) {
        self.view.select(thread_id);
    }

    pub fn job(&self, thread_id: &ThreadId) -> Option<Job> {
        self.registry.get(thread_id)
    }

    pub fn snapshot(&self) -> ConsoleSnapshot {
        let counts = self.registry.counts();
        ConsoleSnapshot {
            counts,
            progress_percent: counts.progress_percent(),
            active: counts.active(),
            batch: self.scheduler.batch_progress(),
            quota_note: self.quota.note(),
            auto_run: self.switch.is_enabled(),
            max_inflight: self.scheduler.max_inflight(),
            capacity_hint: self.scheduler.capacity_hint(),
            poll_interval: self.poller.interval(),
        }
    }

    /// True when nothing is active or being submitted and no visible
    /// unguessed thread is left untracked.
    pub fn is_settled(&self) -> bool {
        self.registry.active_count() == 0
            && !self.scheduler.batch_running()
            && !self
                .view
                .queue()
                .unguessed()
                .any(|item| !self.registry.contains(&item.thread_id))
    }

    /// Spawn the poller and auto-run loops.
    pub fn spawn(&self) -> OrchestratorHandle {
        let shutdown = CancellationToken::new();
        let tasks = vec![
            tokio::spawn(self.poller.clone().run(shutdown.clone())),
            tokio::spawn(self.auto_run.clone().run(shutdown.clone())),
        ];
        tracing::info!("orchestrator started");
        OrchestratorHandle { shutdown, tasks }
    }
}

/// Background loops of a running [`Orchestrator`].
pub struct OrchestratorHandle {
    shutdown: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl OrchestratorHandle {
    /// Stop the loops and wait for them to exit.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        for task in self.tasks {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "orchestrator task ended abnormally");
            }
        }
        tracing::info!("orchestrator stopped");
    }
}
