//! Quota monitoring for the selected model.
//!
//! Advisory only: the note is shown to the operator and consulted by
//! nothing that gates `Scheduler::start`.

use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use chrono::{DateTime, Local, TimeZone, Utc};
use tokio::sync::watch;
use tokio::time::Instant;

use triage_core::{ModelId, QuotaState};

use crate::api::JudgeApi;
use crate::config::JobsConfig;

/// What a call to [`QuotaMonitor::refresh`] did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefreshOutcome {
    /// Skipped: the last fetch is too recent.
    Throttled,
    /// Fetched; the note is now this value.
    Updated(Option<String>),
    /// The model changed while fetching; the answer was discarded.
    Superseded,
    /// The fetch failed; the note is unchanged.
    Failed,
}

/// Tracks the quota state of the selected model.
pub struct QuotaMonitor<A> {
    api: Arc<A>,
    model: RwLock<ModelId>,
    last_fetch: Mutex<Option<Instant>>,
    note: watch::Sender<Option<String>>,
    min_refetch: Duration,
    recency_window: chrono::Duration,
}

impl<A: JudgeApi> QuotaMonitor<A> {
    pub fn new(api: Arc<A>, config: &JobsConfig) -> Self {
        Self {
            api,
            model: RwLock::new(config.model.clone()),
            last_fetch: Mutex::new(None),
            note: watch::channel(None).0,
            min_refetch: config.quota_min_refetch,
            recency_window: config.quota_recency_window,
        }
    }

    pub fn model(&self) -> ModelId {
        self.model
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Switch the tracked model. The caller is expected to force a refresh.
    pub fn set_model(&self, model: ModelId) {
        *self.model.write().unwrap_or_else(PoisonError::into_inner) = model;
    }

    /// Current operator-facing note; `None` when quota looks healthy.
    pub fn note(&self) -> Option<String> {
        self.note.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<String>> {
        self.note.subscribe()
    }

    /// Fetch quota markers unless the previous fetch is younger than the
    /// minimum interval. `force` bypasses the throttle.
    pub async fn refresh(&self, force: bool) -> RefreshOutcome {
        {
            let now = Instant::now();
            let mut last = self.last_fetch.lock().unwrap_or_else(PoisonError::into_inner);
            if !force && last.is_some_and(|at| now.duration_since(at) < self.min_refetch) {
                tracing::trace!("quota refresh throttled");
                return RefreshOutcome::Throttled;
            }
            *last = Some(now);
        }

        let model = self.model();
        let state = match self.api.quota_state(&model).await {
            Ok(state) => state,
            Err(e) => {
                tracing::warn!(model = %model, error = %e, "failed to fetch quota state");
                return RefreshOutcome::Failed;
            }
        };
        if self.model() != model {
            return RefreshOutcome::Superseded;
        }

        let quota = QuotaState::from_state_map(&model, &state);
        let note = quota_note(&model, &quota, Local::now(), self.recency_window);
        if let Some(note) = &note {
            tracing::info!(model = %model, note = %note, "quota exhausted");
        }
        self.note.send_replace(note.clone());
        RefreshOutcome::Updated(note)
    }

    /// Make sure a note is shown after a job failed on quota, even when the
    /// service recorded no marker for the selected model.
    pub fn note_job_exhaustion(&self, message: &str) {
        let model = self.model();
        self.note.send_if_modified(|note| {
            if note.is_some() {
                return false;
            }
            tracing::debug!(model = %model, error = %message, "quota note derived from job error");
            *note = Some(fallback_note(&model));
            true
        });
    }
}

/// Note for a quota exhaustion without usable timestamps.
pub fn fallback_note(model: &ModelId) -> String {
    format!("Quota exhausted for {} · runs might fail", model.label())
}

/// Operator-facing note for `quota` as seen at `now`.
///
/// `None` unless a message is recorded and the exhaustion is younger than
/// `window`. Reset times are rendered in `now`'s time zone: time only on the
/// same day, date and time otherwise.
pub fn quota_note<Tz>(
    model: &ModelId,
    quota: &QuotaState,
    now: DateTime<Tz>,
    window: chrono::Duration,
) -> Option<String>
where
    Tz: TimeZone,
    Tz::Offset: std::fmt::Display,
{
    if !quota.is_recent(now.with_timezone(&Utc), window) {
        return None;
    }
    let label = model.label();

    if let Some(reset) = quota.reset_at {
        let reset = reset.with_timezone(&now.timezone());
        let time = reset.format("%H:%M").to_string();
        let until = if reset.date_naive() == now.date_naive() {
            time
        } else {
            format!("{} {}", reset.format("%b %-d"), time)
        };
        return Some(format!(
            "Quota exhausted for {label} · until {until} · runs might fail"
        ));
    }

    let ago = quota
        .exhausted_at
        .map(|at| now.with_timezone(&Utc) - at)
        .filter(|age| *age >= chrono::Duration::zero())
        .map(|age| {
            let minutes = (age.num_milliseconds() as f64 / 60_000.0).round() as i64;
            let (hours, minutes) = (minutes / 60, minutes % 60);
            if hours > 0 {
                format!(" ({hours}h{minutes}m ago)")
            } else {
                format!(" ({minutes}m ago)")
            }
        })
        .unwrap_or_default();
    Some(format!("Quota exhausted for {label}{ago} · runs might fail"))
}
