//! Hands out task queues.
//!
//! Queues are often requested while the host is still coming up, before it
//! knows which thread is the affinity thread, so creating one never consults
//! the [`AffinityContext`]. The check happens on the queue's first submission.

use crate::context::AffinityContext;
use crate::scheduler::queue::TaskQueue;
use crate::scheduler::tracker::OperationTracker;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// What every queue from one factory shares.
pub(crate) struct FactoryShared {
    pub(crate) context: Arc<dyn AffinityContext>,
    pub(crate) tracker: Arc<OperationTracker>,
    next_queue: AtomicU64,
}

/// Creates task queues that all share one affinity context.
#[derive(Clone)]
pub struct SchedulerFactory {
    shared: Arc<FactoryShared>,
}

impl SchedulerFactory {
    pub fn new(context: Arc<dyn AffinityContext>) -> Self {
        Self {
            shared: Arc::new(FactoryShared {
                context,
                tracker: Arc::new(OperationTracker::new()),
                next_queue: AtomicU64::new(0),
            }),
        }
    }

    /// Create a queue for one consumer. Does not touch the affinity context.
    pub fn create_queue(&self) -> TaskQueue {
        let n = self.shared.next_queue.fetch_add(1, Ordering::Relaxed);
        TaskQueue::new(format!("queue-{n}"), Arc::clone(&self.shared))
    }

    /// Tasks in flight across every queue this factory created.
    pub fn in_flight(&self) -> usize {
        self.shared.tracker.in_flight()
    }

    /// Resolves once every queue from this factory has settled its tasks.
    pub async fn wait_idle(&self) {
        self.shared.tracker.wait_idle().await
    }
}

impl std::fmt::Debug for SchedulerFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SchedulerFactory")
            .field("in_flight", &self.in_flight())
            .finish_non_exhaustive()
    }
}
