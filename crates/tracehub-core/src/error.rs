//! Core domain errors.

use thiserror::Error;

/// Core domain errors for TraceHub.
#[derive(Debug, Clone, Error)]
pub enum CoreError {
    /// Task not found.
    #[error("Task not found: {0}")]
    TaskNotFound(String),

    /// Run not found.
    #[error("Run not found: {0}")]
    RunNotFound(String),

    /// Invalid state transition.
    #[error("Invalid state transition: {from} -> {to}")]
    InvalidStateTransition { from: String, to: String },

    /// Invalid input.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// A filter tree that cannot be evaluated.
    #[error("Invalid filter on field '{field}': {reason}")]
    InvalidFilter { field: String, reason: String },

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for CoreError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}
