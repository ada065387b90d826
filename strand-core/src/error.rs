//! Error types for the reactive core and the task scheduler.
//!
//! Two taxonomies, per the runtime's failure model:
//!
//! - [`ReactiveError`]: programmer errors in graph construction or teardown.
//!   These surface immediately from the call that detects them and are never
//!   retried.
//!
//! - [`TaskError`]: outcomes of scheduled tasks. `Interrupted` is the
//!   expected cooperative-cancellation signal, not a bug; `Failed` captures
//!   a user task failure verbatim so callers can decide whether to re-exec.

use thiserror::Error;

/// Errors raised by values, containers, and the disposal graph.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReactiveError {
    /// A value (or signal) was asked to dispose while subscribers remain.
    #[error("value '{name}' still has subscribers")]
    DisposeWhileSubscribed { name: String },

    /// A tuple was requested over a source list containing duplicates.
    #[error("duplicate sources in tuple request")]
    DuplicateTupleSources,

    /// A tuple over the same source set already exists in a different order.
    /// Allowing both would make the tuple cache key ambiguous.
    #[error("tuple over the same sources already exists in a different order")]
    TupleOrderMismatch,

    /// Adding this edge to the disposal graph would create a cycle.
    /// Detected at bind time, not deferred to disposal time.
    #[error("binding would create a dependency cycle")]
    CyclicBinding,
}

/// Outcome errors for tasks run under the scheduler.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TaskError {
    /// The task was asked to stop and observed the request at a suspension
    /// point. This is cooperative cancellation working as intended.
    #[error("task interrupted")]
    Interrupted,

    /// The task body failed. Stored in the task's reactive status, never
    /// silently swallowed and never automatically retried.
    #[error("task failed: {0}")]
    Failed(String),
}

impl TaskError {
    /// Wrap an arbitrary error as a task failure.
    pub fn failed(err: impl std::fmt::Display) -> Self {
        TaskError::Failed(err.to_string())
    }
}
