//! Coalescing delayed action.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::task::JoinHandle;

/// Runs an action once after `delay`; requests arriving while one is pending
/// are folded into it.
#[derive(Debug, Clone)]
pub struct Debouncer {
    delay: Duration,
    pending: Arc<AtomicBool>,
    task: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl Debouncer {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            pending: Arc::new(AtomicBool::new(false)),
            task: Arc::new(Mutex::new(None)),
        }
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    pub fn is_pending(&self) -> bool {
        self.pending.load(Ordering::SeqCst)
    }

    /// Schedule `action`. Returns `false` when it was coalesced into a pending timer.
    pub fn schedule<F, Fut>(&self, action: F) -> bool
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        if self.pending.swap(true, Ordering::SeqCst) {
            return false;
        }
        let pending = self.pending.clone();
        let delay = self.delay;
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            pending.store(false, Ordering::SeqCst);
            action().await;
        });
        *self.task.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
        true
    }

    /// Abort the pending or running action, if any.
    pub fn cancel(&self) {
        if let Some(handle) = self.task.lock().unwrap_or_else(PoisonError::into_inner).take() {
            handle.abort();
        }
        self.pending.store(false, Ordering::SeqCst);
    }
}
