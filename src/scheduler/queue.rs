//! Per-consumer task queue.
//!
//! A queue starts out uninitialized. The first submission materializes its
//! [`AffinityScheduler`]; every later submission reuses it. If the affinity
//! thread is still unknown at that moment the queue is poisoned for good.

use crate::error::{Error, Result};
use crate::scheduler::affinity::AffinityScheduler;
use crate::scheduler::cancel::Cancellation;
use crate::scheduler::factory::FactoryShared;
use crate::scheduler::task::{PendingTask, TaskHandle, TaskSpec};
use crate::scheduler::tracker::OperationTracker;
use crate::telemetry::metrics;
use std::future::Future;
use std::sync::{Arc, OnceLock};
use tracing::{debug, error};

/// One consumer's entry point for submitting work to the affinity thread.
pub struct TaskQueue {
    label: Arc<str>,
    shared: Arc<FactoryShared>,
    /// `None` once materialization has failed.
    scheduler: OnceLock<Option<AffinityScheduler>>,
    tracker: Arc<OperationTracker>,
}

impl TaskQueue {
    pub(crate) fn new(label: String, shared: Arc<FactoryShared>) -> Self {
        Self {
            label: Arc::from(label),
            shared,
            scheduler: OnceLock::new(),
            tracker: Arc::new(OperationTracker::new()),
        }
    }

    /// Diagnostic label, unique per factory.
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Whether the first submission has already bound this queue to the
    /// affinity thread.
    pub fn is_active(&self) -> bool {
        matches!(self.scheduler.get(), Some(Some(_)))
    }

    /// Tasks submitted to this queue and not yet settled.
    pub fn in_flight(&self) -> usize {
        self.tracker.in_flight()
    }

    /// Resolves when every task submitted to this queue has settled.
    pub async fn wait_idle(&self) {
        self.tracker.wait_idle().await
    }

    /// Schedule a side-effecting action.
    pub fn schedule_action<F>(
        &self,
        name: &str,
        cancellation: Option<&Cancellation>,
        action: F,
    ) -> Result<TaskHandle<()>>
    where
        F: FnOnce() -> anyhow::Result<()> + Send + 'static,
    {
        self.schedule_fn(name, cancellation, action)
    }

    /// Schedule a function producing a value.
    pub fn schedule_fn<T, F>(
        &self,
        name: &str,
        cancellation: Option<&Cancellation>,
        function: F,
    ) -> Result<TaskHandle<T>>
    where
        F: FnOnce() -> anyhow::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let scheduler = self.scheduler()?;
        let (task, handle) = PendingTask::sync(self.spec(name, cancellation), function);
        scheduler.schedule(task)?;
        Ok(handle)
    }

    /// Schedule an action that may suspend. The handle settles when the
    /// returned future does.
    pub fn schedule_async<F, Fut>(
        &self,
        name: &str,
        cancellation: Option<&Cancellation>,
        action: F,
    ) -> Result<TaskHandle<()>>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + 'static,
    {
        self.schedule_async_fn(name, cancellation, action)
    }

    /// Schedule a function that may suspend before producing its value.
    ///
    /// The future is created and polled only on the affinity thread, so it
    /// does not need to be `Send`.
    pub fn schedule_async_fn<T, F, Fut>(
        &self,
        name: &str,
        cancellation: Option<&Cancellation>,
        function: F,
    ) -> Result<TaskHandle<T>>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<T>> + 'static,
        T: Send + 'static,
    {
        let scheduler = self.scheduler()?;
        let (task, handle) = PendingTask::asynchronous(self.spec(name, cancellation), function);
        scheduler.schedule(task)?;
        Ok(handle)
    }

    fn scheduler(&self) -> Result<&AffinityScheduler> {
        self.scheduler
            .get_or_init(|| match AffinityScheduler::new(Arc::clone(&self.shared.context)) {
                Ok(scheduler) => {
                    debug!(queue = %self.label, "task queue bound to affinity thread");
                    Some(scheduler)
                }
                Err(e) => {
                    error!(queue = %self.label, error = %e, "task queue used before the affinity thread was established");
                    metrics::queue_lifecycle_failures().add(1, &[]);
                    None
                }
            })
            .as_ref()
            .ok_or(Error::AffinityThreadUnknown)
    }

    fn spec(&self, name: &str, cancellation: Option<&Cancellation>) -> TaskSpec {
        TaskSpec {
            name: name.to_owned(),
            queue: Arc::clone(&self.label),
            cancellation: cancellation.cloned(),
            context: Arc::clone(&self.shared.context),
            tracking: vec![self.tracker.begin(), self.shared.tracker.begin()],
        }
    }
}

impl std::fmt::Debug for TaskQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskQueue")
            .field("label", &self.label)
            .field("active", &self.is_active())
            .field("in_flight", &self.in_flight())
            .finish()
    }
}
