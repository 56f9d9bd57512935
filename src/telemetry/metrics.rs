//! Metric instruments for affinity-sched.
//!
//! Built on the globally-registered `MeterProvider`; without one they are
//! no-ops.

use opentelemetry::metrics::{Counter, Meter};

fn meter() -> Meter {
    opentelemetry::global::meter("affinity-sched")
}

/// Counter: tasks handed to an affinity scheduler.
/// Labels: `path` ("inline" | "queued").
pub fn task_scheduled() -> Counter<u64> {
    meter()
        .u64_counter("affinity.task.scheduled")
        .with_description("Number of tasks scheduled onto the affinity thread")
        .build()
}

/// Counter: how tasks settled.
/// Labels: `outcome` ("ok" | "failed" | "panicked" | "canceled" | "abandoned" |
/// "interrupted"). The last two are counted when a handle observes the loss.
pub fn task_outcomes() -> Counter<u64> {
    meter()
        .u64_counter("affinity.task.outcome")
        .with_description("Number of settled tasks by outcome")
        .build()
}

/// Counter: queues that were first used before the affinity thread existed.
pub fn queue_lifecycle_failures() -> Counter<u64> {
    meter()
        .u64_counter("affinity.queue.lifecycle_failures")
        .with_description("Task queues materialized before the affinity thread was known")
        .build()
}
