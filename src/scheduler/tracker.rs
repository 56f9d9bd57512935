//! In-flight operation accounting.
//!
//! Every submitted task holds a token from its queue's tracker and from the
//! factory's tracker until the task is destroyed (completed, failed,
//! canceled or abandoned). Waiting for quiescence is what tests and shutdown
//! paths use.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::Notify;

/// Counts tasks that are still alive and wakes waiters when none remain.
#[derive(Debug, Default)]
pub struct OperationTracker {
    in_flight: AtomicUsize,
    idle: Notify,
}

impl OperationTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of tasks submitted and not yet destroyed.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Resolves when no tracked task is in flight.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.in_flight() == 0 {
                return;
            }
            notified.await;
        }
    }

    pub(crate) fn begin(self: &Arc<Self>) -> OperationToken {
        self.in_flight.fetch_add(1, Ordering::AcqRel);
        OperationToken {
            tracker: Arc::clone(self),
        }
    }
}

/// Held by a task for as long as it exists.
#[derive(Debug)]
pub(crate) struct OperationToken {
    tracker: Arc<OperationTracker>,
}

impl Drop for OperationToken {
    fn drop(&mut self) {
        if self.tracker.in_flight.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.tracker.idle.notify_waiters();
        }
    }
}
