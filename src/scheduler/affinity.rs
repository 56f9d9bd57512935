//! The affinity scheduler: runs tasks one at a time on the affinity thread.
//!
//! Two paths:
//! - called on the affinity thread, the task runs inline, right now, inside
//!   the submitting call. A single-worker scheduler that queued here would
//!   deadlock any affine caller that then waits on its own task.
//! - called anywhere else, a proxy is handed to the host, which yields its
//!   run loop at least once and then runs exactly that one task.
//!
//! The scheduler holds no queue of its own and keeps no counters; serialized
//! execution follows from every body running on the one affinity thread.

use crate::context::AffinityContext;
use crate::error::{Error, Result};
use crate::scheduler::task::{ExecutionPath, PendingTask};
use crate::telemetry::metrics;
use opentelemetry::KeyValue;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

/// Runs a queue's tasks on the affinity thread, never more than one at a time.
pub struct AffinityScheduler {
    context: Arc<dyn AffinityContext>,
}

impl AffinityScheduler {
    /// Upper bound on simultaneously executing task bodies. Fixed.
    pub const MAX_CONCURRENCY: usize = 1;

    /// Bind a scheduler to the host's affinity thread.
    ///
    /// Fails with [`Error::AffinityThreadUnknown`] while the host cannot yet
    /// say which thread that is.
    pub fn new(context: Arc<dyn AffinityContext>) -> Result<Self> {
        if !context.has_affinity_thread() {
            return Err(Error::AffinityThreadUnknown);
        }
        Ok(Self { context })
    }

    pub fn max_concurrency(&self) -> usize {
        Self::MAX_CONCURRENCY
    }

    /// Always empty: this scheduler executes, it does not keep a backlog to
    /// inspect.
    pub fn scheduled_tasks(&self) -> impl Iterator<Item = Uuid> {
        std::iter::empty()
    }

    pub(crate) fn schedule(&self, task: PendingTask) -> Result<()> {
        match self.try_execute_inline(task) {
            Ok(()) => Ok(()),
            Err(task) => self.queue_task(task),
        }
    }

    /// Run `task` now if the caller is on the affinity thread; otherwise hand
    /// it back.
    fn try_execute_inline(&self, task: PendingTask) -> std::result::Result<(), PendingTask> {
        if !self.context.is_on_affinity_thread() {
            return Err(task);
        }
        metrics::task_scheduled().add(1, &[KeyValue::new("path", ExecutionPath::Inline.as_str())]);
        task.execute(self.context.as_ref(), ExecutionPath::Inline);
        Ok(())
    }

    fn queue_task(&self, task: PendingTask) -> Result<()> {
        debug!(task = task.name(), "queueing task for the affinity thread");

        let context = Arc::clone(&self.context);
        self.context.switch_to_affinity_thread(Box::new(move || {
            task.execute(context.as_ref(), ExecutionPath::Queued);
        }))?;
        metrics::task_scheduled().add(1, &[KeyValue::new("path", ExecutionPath::Queued.as_str())]);
        Ok(())
    }
}

impl std::fmt::Debug for AffinityScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AffinityScheduler")
            .field("max_concurrency", &Self::MAX_CONCURRENCY)
            .finish()
    }
}
