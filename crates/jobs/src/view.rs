//! Observable state of the operator's view.
//!
//! The orchestrator does not render anything; it reads the visible queue and
//! the open thread from here and publishes refreshed details back.

use tokio::sync::watch;

use triage_core::{GuessFilter, ModelId, QueueItem, ThreadId};

use crate::api::ThreadDetail;

/// The queue as currently visible to the operator.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueSnapshot {
    pub filter: GuessFilter,
    pub items: Vec<QueueItem>,
}

impl QueueSnapshot {
    pub fn new(filter: GuessFilter, items: Vec<QueueItem>) -> Self {
        Self { filter, items }
    }

    /// Visible items without a prior LLM suggestion, in display order.
    pub fn unguessed(&self) -> impl Iterator<Item = &QueueItem> {
        self.items.iter().filter(|item| !item.has_guess())
    }
}

/// Shared view state, observable through watch channels.
#[derive(Debug)]
pub struct ViewState {
    queue: watch::Sender<QueueSnapshot>,
    selected: watch::Sender<Option<ThreadId>>,
    detail: watch::Sender<Option<ThreadDetail>>,
    model: watch::Sender<ModelId>,
}

impl Default for ViewState {
    fn default() -> Self {
        Self::new()
    }
}

impl ViewState {
    pub fn new() -> Self {
        Self {
            queue: watch::channel(QueueSnapshot::default()).0,
            selected: watch::channel(None).0,
            detail: watch::channel(None).0,
            model: watch::channel(ModelId::auto()).0,
        }
    }

    pub fn queue(&self) -> QueueSnapshot {
        self.queue.borrow().clone()
    }

    pub fn filter(&self) -> GuessFilter {
        self.queue.borrow().filter
    }

    pub fn set_queue(&self, snapshot: QueueSnapshot) {
        self.queue.send_replace(snapshot);
    }

    /// Replace the visible items, keeping the filter.
    pub fn replace_items(&self, items: Vec<QueueItem>) {
        self.queue.send_modify(|q| q.items = items);
    }

    pub fn subscribe_queue(&self) -> watch::Receiver<QueueSnapshot> {
        self.queue.subscribe()
    }

    /// The thread currently open in the detail pane.
    pub fn selected(&self) -> Option<ThreadId> {
        self.selected.borrow().clone()
    }

    pub fn select(&self, thread_id: Option<ThreadId>) {
        self.selected.send_replace(thread_id);
    }

    pub fn detail(&self) -> Option<ThreadDetail> {
        self.detail.borrow().clone()
    }

    /// Publish a refreshed detail for the open thread.
    pub fn show_detail(&self, detail: ThreadDetail) {
        self.detail.send_replace(Some(detail));
    }

    /// Model selected for new runs.
    pub fn model(&self) -> ModelId {
        self.model.borrow().clone()
    }

    /// Returns `false` when `model` was already selected.
    pub fn set_model(&self, model: ModelId) -> bool {
        self.model.send_if_modified(|current| {
            if *current == model {
                return false;
            }
            *current = model;
            true
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unguessed_keeps_display_order() {
        let item = |id: &str| QueueItem::new(ThreadId::new(id).unwrap(), format!("t{id}"));
        let snapshot = QueueSnapshot::new(
            GuessFilter::Any,
            vec![
                item("5"),
                item("4").with_guess("open", "low"),
                item("3"),
            ],
        );
        let ids: Vec<_> = snapshot.unguessed().map(|i| i.thread_id.as_str()).collect();
        assert_eq!(ids, vec!["5", "3"]);
    }

    #[test]
    fn replace_items_keeps_filter() {
        let view = ViewState::new();
        view.set_queue(QueueSnapshot::new(GuessFilter::WithoutGuess, vec![]));
        view.replace_items(vec![QueueItem::new(ThreadId::new("1").unwrap(), "x")]);

        let queue = view.queue();
        assert_eq!(queue.filter, GuessFilter::WithoutGuess);
        assert_eq!(queue.items.len(), 1);
    }
}
