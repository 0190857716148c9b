//! In-memory job registry.
//!
//! The registry is the only shared mutable state of the orchestrator. Every
//! mutation goes through one of the methods below and bumps a revision
//! counter that observers follow through [`JobRegistry::subscribe`].
//!
//! Each entry carries a [`Generation`]. `begin` and `set` (the start and
//! cancel paths) issue a new generation; continuations of network calls
//! apply their result only if the generation they captured is still current,
//! so a late acknowledgement can never resurrect a cancelled job.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tokio::sync::watch;

use triage_core::{Job, JobCounts, JobStatus, ThreadId};

use crate::api::StatusItem;
use crate::error::is_quota_exhaustion;

/// Version of a registry entry; bumped by every start or cancel of the thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Generation(u64);

#[derive(Debug, Clone)]
struct Entry {
    job: Job,
    generation: Generation,
    /// A start request for this generation has not been acknowledged yet.
    awaiting_ack: bool,
}

#[derive(Debug, Default)]
struct RegistryState {
    entries: HashMap<ThreadId, Entry>,
    next_generation: u64,
}

impl RegistryState {
    fn next_generation(&mut self) -> Generation {
        self.next_generation += 1;
        Generation(self.next_generation)
    }
}

/// Result of applying one poll round.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeReport {
    /// Entries overwritten by the round.
    pub applied: usize,
    /// Items dropped because a newer start/cancel superseded the round.
    pub stale: usize,
    /// Threads that transitioned to `done` in this round.
    pub completed: Vec<ThreadId>,
}

/// Mapping thread id → job state.
#[derive(Debug)]
pub struct JobRegistry {
    state: RwLock<RegistryState>,
    revision: watch::Sender<u64>,
}

impl Default for JobRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl JobRegistry {
    pub fn new() -> Self {
        let (revision, _) = watch::channel(0);
        Self {
            state: RwLock::new(RegistryState::default()),
            revision,
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, RegistryState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, RegistryState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn notify(&self) {
        self.revision.send_modify(|rev| *rev += 1);
    }

    /// Watch the registry revision; it changes after every mutation.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.revision.subscribe()
    }

    pub fn get(&self, thread_id: &ThreadId) -> Option<Job> {
        self.read().entries.get(thread_id).map(|e| e.job.clone())
    }

    pub fn generation(&self, thread_id: &ThreadId) -> Option<Generation> {
        self.read().entries.get(thread_id).map(|e| e.generation)
    }

    pub fn contains(&self, thread_id: &ThreadId) -> bool {
        self.read().entries.contains_key(thread_id)
    }

    /// True iff the thread's job is queued, starting or running.
    pub fn is_active(&self, thread_id: &ThreadId) -> bool {
        self.read()
            .entries
            .get(thread_id)
            .is_some_and(|e| e.job.is_active())
    }

    pub fn counts(&self) -> JobCounts {
        JobCounts::from_statuses(self.read().entries.values().map(|e| e.job.status))
    }

    pub fn active_count(&self) -> usize {
        self.read()
            .entries
            .values()
            .filter(|e| e.job.is_active())
            .count()
    }

    pub fn len(&self) -> usize {
        self.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().entries.is_empty()
    }

    /// Active thread ids, sorted.
    pub fn active_ids(&self) -> Vec<ThreadId> {
        self.active_snapshot().into_iter().map(|(id, _)| id).collect()
    }

    /// Active thread ids with their current generation, sorted by id.
    pub fn active_snapshot(&self) -> Vec<(ThreadId, Generation)> {
        let state = self.read();
        let mut active: Vec<_> = state
            .entries
            .iter()
            .filter(|(_, e)| e.job.is_active())
            .map(|(id, e)| (id.clone(), e.generation))
            .collect();
        active.sort_by(|a, b| a.0.cmp(&b.0));
        active
    }

    /// Snapshot of every tracked job, sorted by thread id.
    pub fn jobs(&self) -> Vec<Job> {
        let state = self.read();
        let mut jobs: Vec<Job> = state.entries.values().map(|e| e.job.clone()).collect();
        jobs.sort_by(|a, b| a.thread_id.cmp(&b.thread_id));
        jobs
    }

    /// Mark the thread `queued` for a new start, unless it is already active.
    ///
    /// Returns the generation the start continuation must present, or `None`
    /// when the thread is active (the start is a no-op).
    pub fn begin(&self, thread_id: &ThreadId) -> Option<Generation> {
        let generation = {
            let mut state = self.write();
            if state
                .entries
                .get(thread_id)
                .is_some_and(|e| e.job.is_active())
            {
                return None;
            }
            let generation = state.next_generation();
            state.entries.insert(
                thread_id.clone(),
                Entry {
                    job: Job::new(thread_id.clone(), JobStatus::Queued, None),
                    generation,
                    awaiting_ack: true,
                },
            );
            generation
        };
        self.notify();
        Some(generation)
    }

    /// Overwrite the thread's entry unconditionally, superseding any pending
    /// continuation.
    pub fn set(
        &self,
        thread_id: &ThreadId,
        status: JobStatus,
        error: Option<String>,
    ) -> Generation {
        let generation = {
            let mut state = self.write();
            let generation = state.next_generation();
            state.entries.insert(
                thread_id.clone(),
                Entry {
                    job: Job::new(thread_id.clone(), status, error),
                    generation,
                    awaiting_ack: false,
                },
            );
            generation
        };
        self.notify();
        generation
    }

    /// Apply a continuation result if `generation` is still the thread's current one.
    ///
    /// Returns `false` (and changes nothing) when a newer start or cancel won.
    pub fn set_if_current(
        &self,
        thread_id: &ThreadId,
        generation: Generation,
        status: JobStatus,
        error: Option<String>,
    ) -> bool {
        {
            let mut state = self.write();
            match state.entries.get_mut(thread_id) {
                Some(entry) if entry.generation == generation => {
                    entry.job = Job::new(thread_id.clone(), status, error);
                    entry.awaiting_ack = false;
                }
                _ => return false,
            }
        }
        self.notify();
        true
    }

    /// Apply a start acknowledgement (or start failure) for `generation`.
    ///
    /// Like [`Self::set_if_current`], but also refuses once a poll round has
    /// reported on this generation: the service's later view wins over the
    /// answer to the start request.
    pub fn set_if_awaiting_ack(
        &self,
        thread_id: &ThreadId,
        generation: Generation,
        status: JobStatus,
        error: Option<String>,
    ) -> bool {
        {
            let mut state = self.write();
            match state.entries.get_mut(thread_id) {
                Some(entry) if entry.generation == generation && entry.awaiting_ack => {
                    entry.job = Job::new(thread_id.clone(), status, error);
                    entry.awaiting_ack = false;
                }
                _ => return false,
            }
        }
        self.notify();
        true
    }

    /// Apply one poll round atomically.
    ///
    /// Only threads present in `expected` are touched, and only while their
    /// generation still matches; later items for the same thread win. An
    /// `idle` report for a start the service has not acknowledged yet is
    /// ignored (the request simply has not landed).
    pub fn merge_round(
        &self,
        items: Vec<StatusItem>,
        expected: &HashMap<ThreadId, Generation>,
    ) -> MergeReport {
        let mut report = MergeReport::default();
        {
            let mut state = self.write();
            for item in items {
                let Some(wanted) = expected.get(&item.thread_id) else {
                    continue;
                };
                let Some(entry) = state.entries.get_mut(&item.thread_id) else {
                    report.stale += 1;
                    continue;
                };
                if entry.generation != *wanted {
                    report.stale += 1;
                    continue;
                }
                if entry.awaiting_ack && item.status == JobStatus::Idle {
                    continue;
                }
                let was_done = entry.job.status == JobStatus::Done;
                entry.job = Job::new(item.thread_id.clone(), item.status, item.error);
                entry.awaiting_ack = false;
                report.applied += 1;
                if item.status == JobStatus::Done && !was_done {
                    report.completed.push(item.thread_id);
                }
            }
        }
        if report.applied > 0 {
            self.notify();
        }
        report
    }

    /// Insert jobs recovered from the service without touching known threads.
    pub fn seed(&self, items: Vec<StatusItem>) -> usize {
        let mut inserted = 0;
        {
            let mut state = self.write();
            for item in items {
                if state.entries.contains_key(&item.thread_id) {
                    continue;
                }
                let generation = state.next_generation();
                state.entries.insert(
                    item.thread_id.clone(),
                    Entry {
                        job: Job::new(item.thread_id, item.status, item.error),
                        generation,
                        awaiting_ack: false,
                    },
                );
                inserted += 1;
            }
        }
        if inserted > 0 {
            self.notify();
        }
        inserted
    }

    /// Drop every terminal entry ("clear finished"). Returns how many were removed.
    pub fn clear_finished(&self) -> usize {
        let removed = {
            let mut state = self.write();
            let before = state.entries.len();
            state.entries.retain(|_, e| e.job.is_active());
            before - state.entries.len()
        };
        if removed > 0 {
            self.notify();
        }
        removed
    }

    /// An errored job whose message indicates quota exhaustion, if any.
    pub fn quota_error(&self) -> Option<Job> {
        self.jobs().into_iter().find(|job| {
            job.status == JobStatus::Error
                && job.error.as_deref().is_some_and(is_quota_exhaustion)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tid(s: &str) -> ThreadId {
        ThreadId::new(s).unwrap()
    }

    fn expected(registry: &JobRegistry) -> HashMap<ThreadId, Generation> {
        registry.active_snapshot().into_iter().collect()
    }

    #[test]
    fn begin_is_noop_while_active() {
        let registry = JobRegistry::new();
        let t = tid("1");

        let generation = registry.begin(&t).unwrap();
        assert_eq!(registry.get(&t).unwrap().status, JobStatus::Queued);
        assert!(registry.begin(&t).is_none());
        assert_eq!(registry.generation(&t), Some(generation));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn begin_supersedes_terminal_entry() {
        let registry = JobRegistry::new();
        let t = tid("1");
        registry.set(&t, JobStatus::Error, Some("boom".into()));

        let generation = registry.begin(&t).unwrap();
        let job = registry.get(&t).unwrap();
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.error, None);
        assert_eq!(registry.generation(&t), Some(generation));
    }

    #[test]
    fn stale_continuation_is_discarded() {
        let registry = JobRegistry::new();
        let t = tid("1");
        let started = registry.begin(&t).unwrap();
        registry.set(&t, JobStatus::Cancelled, None);

        assert!(!registry.set_if_current(&t, started, JobStatus::Queued, None));
        assert_eq!(registry.get(&t).unwrap().status, JobStatus::Cancelled);
    }

    #[test]
    fn counts_and_active() {
        let registry = JobRegistry::new();
        registry.begin(&tid("1"));
        registry.begin(&tid("2"));
        registry.set(&tid("3"), JobStatus::Done, None);
        registry.set(&tid("4"), JobStatus::Error, Some("x".into()));

        let counts = registry.counts();
        assert_eq!(counts.queued, 2);
        assert_eq!(counts.done, 1);
        assert_eq!(counts.error, 1);
        assert_eq!(registry.active_count(), 2);
        assert!(registry.is_active(&tid("1")));
        assert!(!registry.is_active(&tid("3")));
        assert!(!registry.is_active(&tid("missing")));
        assert_eq!(registry.active_ids(), vec![tid("1"), tid("2")]);
    }

    #[test]
    fn merge_applies_round_and_reports_completions() {
        let registry = JobRegistry::new();
        for id in ["1", "2", "3"] {
            let generation = registry.begin(&tid(id)).unwrap();
            registry.set_if_current(&tid(id), generation, JobStatus::Queued, None);
        }
        let round = expected(&registry);

        let report = registry.merge_round(
            vec![
                StatusItem::new(tid("1"), JobStatus::Running),
                StatusItem::new(tid("2"), JobStatus::Done),
                StatusItem {
                    thread_id: tid("3"),
                    status: JobStatus::Error,
                    error: Some("LLM timed out; try later".into()),
                },
                // Not part of the round.
                StatusItem::new(tid("99"), JobStatus::Done),
            ],
            &round,
        );

        assert_eq!(report.applied, 3);
        assert_eq!(report.completed, vec![tid("2")]);
        assert_eq!(registry.get(&tid("1")).unwrap().status, JobStatus::Running);
        assert_eq!(
            registry.get(&tid("3")).unwrap().error.as_deref(),
            Some("LLM timed out; try later")
        );
        assert!(!registry.contains(&tid("99")));
    }

    #[test]
    fn merge_last_item_per_thread_wins() {
        let registry = JobRegistry::new();
        registry.set(&tid("1"), JobStatus::Queued, None);
        let round = expected(&registry);

        registry.merge_round(
            vec![
                StatusItem::new(tid("1"), JobStatus::Done),
                StatusItem::new(tid("1"), JobStatus::Running),
            ],
            &round,
        );
        assert_eq!(registry.get(&tid("1")).unwrap().status, JobStatus::Running);
    }

    #[test]
    fn merge_skips_threads_cancelled_during_the_round() {
        let registry = JobRegistry::new();
        registry.set(&tid("1"), JobStatus::Running, None);
        let round = expected(&registry);

        registry.set(&tid("1"), JobStatus::Cancelled, None);
        let report =
            registry.merge_round(vec![StatusItem::new(tid("1"), JobStatus::Running)], &round);

        assert_eq!(report.stale, 1);
        assert_eq!(registry.get(&tid("1")).unwrap().status, JobStatus::Cancelled);
    }

    #[test]
    fn merge_ignores_idle_before_acknowledgement() {
        let registry = JobRegistry::new();
        registry.begin(&tid("1"));
        let round = expected(&registry);

        registry.merge_round(vec![StatusItem::new(tid("1"), JobStatus::Idle)], &round);
        assert_eq!(registry.get(&tid("1")).unwrap().status, JobStatus::Queued);
    }

    #[test]
    fn polled_status_beats_a_late_acknowledgement() {
        let registry = JobRegistry::new();
        let t = tid("1");
        let generation = registry.begin(&t).unwrap();
        let round = expected(&registry);

        let report =
            registry.merge_round(vec![StatusItem::new(t.clone(), JobStatus::Done)], &round);
        assert_eq!(report.completed, vec![t.clone()]);

        assert!(!registry.set_if_awaiting_ack(&t, generation, JobStatus::Queued, None));
        assert_eq!(registry.get(&t).unwrap().status, JobStatus::Done);
        assert_eq!(registry.active_count(), 0);

        let round = expected(&registry);
        let report =
            registry.merge_round(vec![StatusItem::new(t.clone(), JobStatus::Done)], &round);
        assert!(report.completed.is_empty());
    }

    #[test]
    fn acknowledgement_applies_once() {
        let registry = JobRegistry::new();
        let t = tid("1");
        let generation = registry.begin(&t).unwrap();

        assert!(registry.set_if_awaiting_ack(&t, generation, JobStatus::Running, None));
        assert!(!registry.set_if_awaiting_ack(&t, generation, JobStatus::Queued, None));
        assert_eq!(registry.get(&t).unwrap().status, JobStatus::Running);
    }

    #[test]
    fn seed_keeps_local_entries() {
        let registry = JobRegistry::new();
        registry.set(&tid("1"), JobStatus::Cancelled, None);

        let inserted = registry.seed(vec![
            StatusItem::new(tid("1"), JobStatus::Running),
            StatusItem::new(tid("2"), JobStatus::Running),
        ]);
        assert_eq!(inserted, 1);
        assert_eq!(registry.get(&tid("1")).unwrap().status, JobStatus::Cancelled);
        assert_eq!(registry.get(&tid("2")).unwrap().status, JobStatus::Running);
    }

    #[test]
    fn clear_finished_keeps_active() {
        let registry = JobRegistry::new();
        registry.begin(&tid("1"));
        registry.set(&tid("2"), JobStatus::Done, None);
        registry.set(&tid("3"), JobStatus::Skipped, None);

        assert_eq!(registry.clear_finished(), 2);
        assert_eq!(registry.jobs().len(), 1);
        assert!(registry.is_active(&tid("1")));
    }

    #[test]
    fn quota_error_lookup() {
        let registry = JobRegistry::new();
        registry.set(&tid("1"), JobStatus::Error, Some("LLM timed out".into()));
        assert!(registry.quota_error().is_none());

        registry.set(&tid("2"), JobStatus::Error, Some("quota exceeded, retry later".into()));
        assert_eq!(registry.quota_error().unwrap().thread_id, tid("2"));
    }

    #[test]
    fn mutations_bump_revision() {
        let registry = JobRegistry::new();
        let rx = registry.subscribe();
        let before = *rx.borrow();

        registry.begin(&tid("1"));
        assert!(*rx.borrow() > before);

        let after_begin = *rx.borrow();
        registry.begin(&tid("1"));
        assert_eq!(*rx.borrow(), after_begin, "no-op start must not notify");
    }
}
