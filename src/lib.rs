//! # affinity-sched
//!
//! Marshals units of work onto a single logical "affinity" thread.
//!
//! A [`SchedulerFactory`](scheduler::SchedulerFactory) hands out
//! [`TaskQueue`](scheduler::TaskQueue)s without touching the host; the first
//! submission on a queue materializes its
//! [`AffinityScheduler`](scheduler::AffinityScheduler), which runs work inline
//! when the caller is already on the affinity thread and otherwise hops over
//! through an [`AffinityContext`](context::AffinityContext), yielding to the
//! host's run loop first. At most one task body runs at a time.

pub mod config;
pub mod context;
pub mod error;
pub mod host;
pub mod scheduler;
pub mod telemetry;

pub use context::AffinityContext;
pub use error::{Error, Result, TaskError};
pub use host::{AffinityThread, AffinityThreadConfig};
pub use scheduler::{
    AffinityScheduler, Cancellation, OperationTracker, SchedulerFactory, TaskHandle, TaskQueue,
};
