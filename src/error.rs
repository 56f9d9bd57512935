//! Error types for affinity-sched.
//!
//! [`Error`] covers the scheduler's own failures (lifecycle, host, config).
//! [`TaskError`] is what a completion handle resolves to when a task does not
//! produce its value.

use thiserror::Error;

/// Failures of the scheduler itself, as opposed to the tasks it runs.
#[derive(Debug, Error)]
pub enum Error {
    #[error("affinity thread is not known yet; task queue cannot be materialized")]
    AffinityThreadUnknown,

    #[error("affinity thread has shut down")]
    HostShutDown,

    #[error("affinity thread already started")]
    AlreadyStarted,

    #[error("blocking on the affinity thread would deadlock")]
    WouldDeadlock,

    #[error("config error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Why a scheduled task did not yield a value.
#[derive(Debug, Error)]
pub enum TaskError {
    #[error("task '{name}' failed: {error:#}")]
    Failed { name: String, error: anyhow::Error },

    #[error("task '{name}' panicked: {message}")]
    Panicked { name: String, message: String },

    #[error("task '{name}' was canceled before it started")]
    Canceled { name: String },

    /// The host shut down before the task started.
    #[error("task '{name}' was dropped before it ran (affinity thread gone)")]
    Abandoned { name: String },

    /// The host shut down while a started asynchronous body was suspended.
    #[error("task '{name}' was interrupted mid-run (affinity thread gone)")]
    Interrupted { name: String },

    #[error("waiting for task '{name}' on the affinity thread would deadlock")]
    WouldDeadlock { name: String },
}

impl TaskError {
    pub fn is_canceled(&self) -> bool {
        matches!(self, TaskError::Canceled { .. })
    }

    /// Name of the task this error belongs to.
    pub fn task_name(&self) -> &str {
        match self {
            TaskError::Failed { name, .. }
            | TaskError::Panicked { name, .. }
            | TaskError::Canceled { name }
            | TaskError::Abandoned { name }
            | TaskError::Interrupted { name }
            | TaskError::WouldDeadlock { name } => name,
        }
    }

    /// Metric label for this outcome. `None` when the task itself has not
    /// settled.
    pub(crate) fn outcome_label(&self) -> Option<&'static str> {
        match self {
            TaskError::Failed { .. } => Some("failed"),
            TaskError::Panicked { .. } => Some("panicked"),
            TaskError::Canceled { .. } => Some("canceled"),
            TaskError::Abandoned { .. } => Some("abandoned"),
            TaskError::Interrupted { .. } => Some("interrupted"),
            TaskError::WouldDeadlock { .. } => None,
        }
    }
}
