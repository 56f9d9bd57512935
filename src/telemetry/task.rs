//! Task execution span helpers.

use tracing::Span;
use uuid::Uuid;

/// Start a span covering one task's execution on the affinity thread.
///
/// `path` is `inline` or `queued`.
pub fn start_task_span(queue: &str, name: &str, task_id: &Uuid, path: &str) -> Span {
    tracing::debug_span!(
        "task.execute",
        "task.queue" = queue,
        "task.name" = name,
        "task.id" = %task_id,
        "task.path" = path,
    )
}

/// Record a task state transition as an event scoped to `span`.
pub fn record_task_transition(span: &Span, from: &str, to: &str) {
    span.in_scope(|| {
        tracing::debug!(from = from, to = to, "task_transition");
    });
}
