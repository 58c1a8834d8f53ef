//! Engine errors.

use std::fmt;

use thiserror::Error;

use tracehub_core::{CoreError, RunId, TaskId};

/// Errors raised by the orchestration engine and its collaborators.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Core(#[from] CoreError),

    #[error("Task not found: {0}")]
    TaskNotFound(TaskId),

    #[error("Repository error: {0}")]
    Repository(String),

    #[error("Span query error: {0}")]
    SpanQuery(String),

    #[error("Handler failed for task {task_id}: {message}")]
    Handler { task_id: TaskId, message: String },

    #[error("Version conflict on run {run_id}: expected version {expected}")]
    VersionConflict { run_id: RunId, expected: u64 },

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Deadline exceeded")]
    DeadlineExceeded,

    #[error("Failed to publish backfill request: {0}")]
    Producer(String),
}

/// Ordered collection of errors from work that keeps going after a failure.
#[derive(Debug, Default)]
pub struct ErrorList {
    errors: Vec<EngineError>,
}

impl ErrorList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, err: EngineError) {
        self.errors.push(err);
    }

    pub fn extend(&mut self, other: ErrorList) {
        self.errors.extend(other.errors);
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn len(&self) -> usize {
        self.errors.len()
    }

    /// `Ok` when nothing failed, otherwise the whole list.
    pub fn into_result(self) -> Result<(), ErrorList> {
        if self.errors.is_empty() {
            Ok(())
        } else {
            Err(self)
        }
    }

    /// `Ok` when nothing failed, otherwise the first error.
    pub fn into_first(self) -> Result<(), EngineError> {
        match self.errors.into_iter().next() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

impl fmt::Display for ErrorList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, err) in self.errors.iter().enumerate() {
            if i > 0 {
                f.write_str("; ")?;
            }
            write!(f, "{err}")?;
        }
        Ok(())
    }
}

impl std::error::Error for ErrorList {}
