//! A unit of work in flight: its type-erased body, the state word that
//! arbitrates between starting and canceling, and the handle the submitter
//! holds.

use crate::context::AffinityContext;
use crate::error::TaskError;
use crate::scheduler::cancel::Cancellation;
use crate::scheduler::tracker::OperationToken;
use crate::telemetry::metrics;
use crate::telemetry::task::{record_task_transition, start_task_span};
use futures::FutureExt as _;
use futures::future::{BoxFuture, LocalBoxFuture};
use opentelemetry::KeyValue;
use std::any::Any;
use std::fmt;
use std::future::{Future, IntoFuture};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::task::{Context, Poll};
use tokio::sync::oneshot;
use tracing::{Instrument, debug};
use uuid::Uuid;

type Outcome<T> = std::result::Result<T, TaskError>;

/// How a task reached the affinity thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ExecutionPath {
    /// Submitted on the affinity thread and run within the submitting call.
    Inline,
    /// Submitted elsewhere and run after the host's loop yielded.
    Queued,
}

impl ExecutionPath {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            ExecutionPath::Inline => "inline",
            ExecutionPath::Queued => "queued",
        }
    }
}

// ---------------------------------------------------------------------------
// State word
// ---------------------------------------------------------------------------

const PENDING: u8 = 0;
const RUNNING: u8 = 1;
const CANCELED: u8 = 2;

/// Pending → Running or Pending → Canceled, exactly once.
#[derive(Debug)]
pub(crate) struct TaskState(AtomicU8);

impl TaskState {
    fn new() -> Arc<Self> {
        Arc::new(Self(AtomicU8::new(PENDING)))
    }

    /// Claim the task for execution. Fails once it has been canceled.
    fn start(&self) -> bool {
        self.0
            .compare_exchange(PENDING, RUNNING, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Withdraw the task. True when its body will never run.
    fn cancel(&self) -> bool {
        match self
            .0
            .compare_exchange(PENDING, CANCELED, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => true,
            Err(current) => current == CANCELED,
        }
    }

    fn is_canceled(&self) -> bool {
        self.0.load(Ordering::Acquire) == CANCELED
    }

    fn is_running(&self) -> bool {
        self.0.load(Ordering::Acquire) == RUNNING
    }
}

// ---------------------------------------------------------------------------
// Work bodies
// ---------------------------------------------------------------------------

/// A task body with its result channel, erased over the result type.
trait Work: Send {
    /// Run the body on the affinity thread. An asynchronous body runs up to
    /// its first suspension point; the unfinished remainder is returned.
    fn run(self: Box<Self>, name: &str) -> Option<LocalBoxFuture<'static, ()>>;

    /// Complete the handle as canceled without running the body.
    fn cancel(self: Box<Self>, name: &str);
}

struct SyncWork<F, T> {
    body: F,
    sender: oneshot::Sender<Outcome<T>>,
}

impl<F, T> Work for SyncWork<F, T>
where
    F: FnOnce() -> anyhow::Result<T> + Send + 'static,
    T: Send + 'static,
{
    fn run(self: Box<Self>, name: &str) -> Option<LocalBoxFuture<'static, ()>> {
        let SyncWork { body, sender } = *self;
        let outcome = match panic::catch_unwind(AssertUnwindSafe(body)) {
            Ok(result) => settle(name, result),
            Err(payload) => Err(panicked(name, payload)),
        };
        deliver(sender, outcome);
        None
    }

    fn cancel(self: Box<Self>, name: &str) {
        let Self { sender, .. } = *self;
        deliver(sender, Err(canceled(name)));
    }
}

struct AsyncWork<F, T> {
    body: F,
    sender: oneshot::Sender<Outcome<T>>,
}

impl<F, Fut, T> Work for AsyncWork<F, T>
where
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = anyhow::Result<T>> + 'static,
    T: Send + 'static,
{
    fn run(self: Box<Self>, name: &str) -> Option<LocalBoxFuture<'static, ()>> {
        let AsyncWork { body, sender } = *self;
        let future = match panic::catch_unwind(AssertUnwindSafe(body)) {
            Ok(future) => future,
            Err(payload) => {
                deliver(sender, Err(panicked(name, payload)));
                return None;
            }
        };

        let name = name.to_owned();
        let mut remainder: LocalBoxFuture<'static, ()> = Box::pin(async move {
            let outcome = match AssertUnwindSafe(future).catch_unwind().await {
                Ok(result) => settle(&name, result),
                Err(payload) => Err(panicked(&name, payload)),
            };
            deliver(sender, outcome);
        });

        // The host re-polls with a real waker when it takes the remainder over.
        let waker = futures::task::noop_waker();
        let mut cx = Context::from_waker(&waker);
        match remainder.poll_unpin(&mut cx) {
            Poll::Ready(()) => None,
            Poll::Pending => Some(remainder),
        }
    }

    fn cancel(self: Box<Self>, name: &str) {
        let Self { sender, .. } = *self;
        deliver(sender, Err(canceled(name)));
    }
}

fn settle<T>(name: &str, result: anyhow::Result<T>) -> Outcome<T> {
    result.map_err(|error| TaskError::Failed {
        name: name.to_owned(),
        error,
    })
}

fn canceled(name: &str) -> TaskError {
    TaskError::Canceled {
        name: name.to_owned(),
    }
}

fn panicked(name: &str, payload: Box<dyn Any + Send>) -> TaskError {
    let message = if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_owned()
    };
    TaskError::Panicked {
        name: name.to_owned(),
        message,
    }
}

fn record_outcome(label: &'static str) {
    metrics::task_outcomes().add(1, &[KeyValue::new("outcome", label)]);
}

fn deliver<T>(sender: oneshot::Sender<Outcome<T>>, outcome: Outcome<T>) {
    match &outcome {
        Ok(_) => record_outcome("ok"),
        Err(e) => {
            if let Some(label) = e.outcome_label() {
                record_outcome(label);
            }
        }
    }
    if let Err(e) = &outcome {
        debug!(error = %e, "task did not produce a value");
    }
    // The submitter may have dropped the handle.
    let _ = sender.send(outcome);
}

// ---------------------------------------------------------------------------
// Pending task
// ---------------------------------------------------------------------------

/// Everything a submission carries besides its body.
pub(crate) struct TaskSpec {
    pub name: String,
    pub queue: Arc<str>,
    pub cancellation: Option<Cancellation>,
    pub context: Arc<dyn AffinityContext>,
    pub tracking: Vec<OperationToken>,
}

/// A submitted task that has not run yet.
pub(crate) struct PendingTask {
    id: Uuid,
    name: String,
    queue: Arc<str>,
    cancellation: Cancellation,
    state: Arc<TaskState>,
    work: Box<dyn Work>,
    tracking: Vec<OperationToken>,
}

impl PendingTask {
    pub(crate) fn sync<T, F>(spec: TaskSpec, body: F) -> (Self, TaskHandle<T>)
    where
        F: FnOnce() -> anyhow::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        Self::assemble(spec, |sender| {
            Box::new(SyncWork { body, sender }) as Box<dyn Work>
        })
    }

    pub(crate) fn asynchronous<T, F, Fut>(spec: TaskSpec, body: F) -> (Self, TaskHandle<T>)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<T>> + 'static,
        T: Send + 'static,
    {
        Self::assemble(spec, |sender| {
            Box::new(AsyncWork { body, sender }) as Box<dyn Work>
        })
    }

    fn assemble<T: Send + 'static>(
        spec: TaskSpec,
        work: impl FnOnce(oneshot::Sender<Outcome<T>>) -> Box<dyn Work>,
    ) -> (Self, TaskHandle<T>) {
        let (sender, receiver) = oneshot::channel();
        let id = Uuid::new_v4();
        let state = TaskState::new();
        let cancellation = spec.cancellation.unwrap_or_default();

        let handle = TaskHandle {
            id,
            name: spec.name.clone(),
            receiver,
            cancellation: cancellation.clone(),
            state: Arc::clone(&state),
            context: spec.context,
        };
        let task = PendingTask {
            id,
            name: spec.name,
            queue: spec.queue,
            cancellation,
            state,
            work: work(sender),
            tracking: spec.tracking,
        };
        (task, handle)
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    /// Run the task on the affinity thread, unless it was withdrawn first.
    pub(crate) fn execute(self, context: &dyn AffinityContext, path: ExecutionPath) {
        let PendingTask {
            id,
            name,
            queue,
            cancellation,
            state,
            work,
            tracking,
        } = self;

        let span = start_task_span(&queue, &name, &id, path.as_str());
        let _entered = span.enter();

        if cancellation.is_canceled() {
            state.cancel();
        }
        if !state.start() {
            record_task_transition(&span, "pending", "canceled");
            work.cancel(&name);
            return;
        }
        record_task_transition(&span, "pending", "running");

        if let Some(remainder) = work.run(&name) {
            debug!("task suspended, handing remainder to the host");
            let remainder = async move {
                remainder.await;
                drop(tracking);
            };
            context.drive(Box::pin(remainder.instrument(span.clone())));
        }
    }
}

// ---------------------------------------------------------------------------
// Completion handle
// ---------------------------------------------------------------------------

/// The submitter's view of a task's eventual outcome.
///
/// Await it, or [`wait`](TaskHandle::wait) for it synchronously off the
/// affinity thread. Dropping the handle does not cancel the task.
pub struct TaskHandle<T> {
    id: Uuid,
    name: String,
    receiver: oneshot::Receiver<Outcome<T>>,
    cancellation: Cancellation,
    state: Arc<TaskState>,
    context: Arc<dyn AffinityContext>,
}

impl<T: Send + 'static> TaskHandle<T> {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Block the calling thread until the task settles.
    ///
    /// On the affinity thread this never blocks: a task that already ran
    /// inline yields its outcome, anything else is
    /// [`TaskError::WouldDeadlock`].
    pub fn wait(mut self) -> Outcome<T> {
        if self.context.is_on_affinity_thread() {
            return match self.receiver.try_recv() {
                Ok(outcome) => outcome,
                Err(oneshot::error::TryRecvError::Empty) => {
                    if self.cancellation.is_canceled() && self.state.cancel() {
                        Err(canceled(&self.name))
                    } else {
                        Err(TaskError::WouldDeadlock { name: self.name })
                    }
                }
                Err(oneshot::error::TryRecvError::Closed) => Err(lost(self.name, &self.state)),
            };
        }
        futures::executor::block_on(self.outcome())
    }

    async fn outcome(self) -> Outcome<T> {
        let TaskHandle {
            name,
            mut receiver,
            cancellation,
            state,
            ..
        } = self;

        tokio::select! {
            biased;
            received = &mut receiver => {
                return received.unwrap_or_else(|_| Err(lost(name, &state)));
            }
            _ = cancellation.canceled() => {}
        }

        if state.cancel() {
            return Err(TaskError::Canceled { name });
        }
        receiver
            .await
            .unwrap_or_else(|_| Err(lost(name, &state)))
    }
}

/// The result channel closed without a value: the host dropped the task,
/// either before it started or while its remainder was suspended.
fn lost(name: String, state: &TaskState) -> TaskError {
    if state.is_canceled() {
        return TaskError::Canceled { name };
    }
    let error = if state.is_running() {
        TaskError::Interrupted { name }
    } else {
        TaskError::Abandoned { name }
    };
    debug!(error = %error, "task lost with the affinity thread");
    if let Some(label) = error.outcome_label() {
        record_outcome(label);
    }
    error
}

impl<T: Send + 'static> IntoFuture for TaskHandle<T> {
    type Output = Outcome<T>;
    type IntoFuture = BoxFuture<'static, Outcome<T>>;

    fn into_future(self) -> Self::IntoFuture {
        Box::pin(self.outcome())
    }
}

impl<T> fmt::Debug for TaskHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskHandle")
            .field("id", &self.id)
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}
