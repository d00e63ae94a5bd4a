use std::fmt;

use crate::compiler::{CompileError, PipelineId};
use crate::expr::EvalError;
use crate::memory::BufferError;
use crate::plan::{OperatorId, QueryId};
use crate::sink::SinkError;
use crate::window::WindowError;

/// Lifecycle of a deployed query.
///
/// ```text
/// Created ─► Deployed ─► Running ─┬─► Finished
///                                 ├─► Stopped
///                                 └─► ErrorState
/// ```
///
/// `Stopped` and `ErrorState` are reachable from every non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueryStatus {
    /// Stages built, sinks not yet opened.
    Created,
    /// Sinks announced their schema; not accepting data yet.
    Deployed,
    /// Accepting and executing tasks.
    Running,
    /// Completed normally.
    Finished,
    /// Torn down by request.
    Stopped,
    /// Torn down after an unrecoverable failure.
    ErrorState,
}

impl QueryStatus {
    /// Returns `true` once no further transition is possible.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Finished | Self::Stopped | Self::ErrorState)
    }
}

impl fmt::Display for QueryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Created => "Created",
            Self::Deployed => "Deployed",
            Self::Running => "Running",
            Self::Finished => "Finished",
            Self::Stopped => "Stopped",
            Self::ErrorState => "ErrorState",
        };
        f.write_str(name)
    }
}

/// Errors raised while deploying or executing a query.
#[derive(Debug, thiserror::Error)]
pub enum ExecutionError {
    /// Buffer pool or layout failure, including undecodable records.
    #[error("buffer error: {0}")]
    Buffer(#[from] BufferError),

    /// An expression failed on a record.
    #[error("pipeline {pipeline}: {source}")]
    Eval {
        /// Failing pipeline.
        pipeline: PipelineId,
        /// Evaluation error.
        source: EvalError,
    },

    /// A buffer arrived that the pipeline cannot interpret.
    #[error("pipeline {pipeline}: malformed input: {reason}")]
    Malformed {
        /// Receiving pipeline.
        pipeline: PipelineId,
        /// What was wrong.
        reason: String,
    },

    /// No deployed query has this id.
    #[error("query {0} not found")]
    QueryNotFound(QueryId),

    /// No source of the query has this name.
    #[error("unknown source '{0}'")]
    UnknownSource(String),

    /// The requested transition is not allowed from the current status.
    #[error("invalid query state: expected {expected}, got {actual}")]
    InvalidState {
        /// Acceptable states.
        expected: &'static str,
        /// Actual state.
        actual: QueryStatus,
    },

    /// A sink failed to open or write.
    #[error("sink of pipeline {pipeline} failed: {source}")]
    Sink {
        /// Sink pipeline.
        pipeline: PipelineId,
        /// Sink error.
        source: SinkError,
    },

    /// A window or join handler could not be created.
    #[error("handler {handler}: {source}")]
    Window {
        /// Logical window or join id.
        handler: OperatorId,
        /// Definition error.
        source: WindowError,
    },

    /// The pool cannot keep the buffers stages need in reserve.
    #[error("deployment needs more than {required} buffers in reserve, pool has {available}")]
    InsufficientBuffers {
        /// Buffers kept back for stages.
        required: usize,
        /// Buffers in the pool.
        available: usize,
    },

    /// The compiled query is inconsistent.
    #[error(transparent)]
    Compile(#[from] CompileError),

    /// A worker or timer thread could not be started.
    #[error("failed to spawn thread: {0}")]
    Spawn(#[source] std::io::Error),
}
