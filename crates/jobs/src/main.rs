use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::time::MissedTickBehavior;

use triage_core::GuessFilter;
use triage_jobs::{
    ConsoleSnapshot, HttpJudgeClient, InMemoryJudgeApi, JobsConfig, JudgeApi, Orchestrator,
    QueueSource,
};

/// Size of the fake backlog in mock mode.
const MOCK_BACKLOG: usize = 20;

const REPORT_INTERVAL: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    triage_observability::init();

    let config = JobsConfig::from_env().context("invalid configuration")?;
    tracing::info!(
        api_url = %config.api_url,
        model = %config.model,
        auto_run = config.auto_run,
        mock = config.mock_mode,
        "triage-judge starting"
    );

    if config.mock_mode {
        tracing::warn!("TRIAGE_JUDGE_MODE=mock, using the in-process judge service");
        let api = InMemoryJudgeApi::with_backlog(MOCK_BACKLOG).with_auto_progress();
        api.set_max_inflight(config.default_max_inflight);
        run(Arc::new(api), config).await
    } else {
        let api = HttpJudgeClient::from_config(&config)?;
        run(Arc::new(api), config).await
    }
}

async fn run<A: JudgeApi + QueueSource>(api: Arc<A>, config: JobsConfig) -> anyhow::Result<()> {
    let orchestrator = Orchestrator::new(api, &config);

    orchestrator
        .seed_from_remote()
        .await
        .context("failed to load active jobs")?;
    let loaded = orchestrator
        .load_queue(GuessFilter::WithoutGuess)
        .await
        .context("failed to load the queue")?;
    tracing::info!(loaded, "unguessed threads loaded");

    let handle = orchestrator.spawn();
    orchestrator.set_auto_run(config.auto_run).await;

    let mut report = tokio::time::interval(REPORT_INTERVAL);
    report.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut revisions = orchestrator.registry().subscribe();
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    let reason = loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                let cancelled = orchestrator.cancel_all().await;
                tracing::info!(cancelled, "interrupted, active runs cancelled");
                break "interrupted";
            }
            _ = report.tick() => log_snapshot(&orchestrator.snapshot()),
            _ = revisions.changed() => {}
        }

        if config.auto_run && !orchestrator.auto_run_enabled() {
            break "auto-run halted";
        }
        let idle = orchestrator.registry().active_count() == 0
            && !orchestrator.scheduler().batch_running();
        if idle && (!config.auto_run || orchestrator.is_settled()) {
            break "backlog done";
        }
    };

    let snapshot = orchestrator.snapshot();
    log_snapshot(&snapshot);
    if let Some(note) = &snapshot.quota_note {
        tracing::warn!(note = %note, "quota");
    }
    handle.shutdown().await;
    tracing::info!(reason, "triage-judge finished");
    Ok(())
}

fn log_snapshot(snapshot: &ConsoleSnapshot) {
    tracing::info!(
        total = snapshot.counts.total(),
        active = snapshot.active,
        done = snapshot.counts.done,
        error = snapshot.counts.error,
        cancelled = snapshot.counts.cancelled,
        skipped = snapshot.counts.skipped,
        progress = snapshot.progress_percent,
        max_inflight = snapshot.max_inflight,
        capacity_hint = snapshot.capacity_hint,
        auto_run = snapshot.auto_run,
        poll_interval_ms = ?snapshot.poll_interval.map(|d| d.as_millis() as u64),
        batch = ?snapshot.batch.as_ref().map(|b| format!("{}: {}/{}", b.label, b.queued, b.total)),
        "judge progress"
    );
}
