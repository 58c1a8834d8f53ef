//! Messages exchanged between the engine and the backfill queue.

use serde::{Deserialize, Serialize};

use crate::{TaskId, WorkspaceId};

/// Request to (re)run the backfill of one task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackfillEvent {
    pub workspace_id: WorkspaceId,
    pub task_id: TaskId,
    /// Set when the event is a retry after a failed attempt.
    #[serde(default)]
    pub retry: bool,
}

impl BackfillEvent {
    pub fn new(workspace_id: impl Into<WorkspaceId>, task_id: impl Into<TaskId>) -> Self {
        Self {
            workspace_id: workspace_id.into(),
            task_id: task_id.into(),
            retry: false,
        }
    }

    /// The same request, marked as a retry.
    pub fn retried(mut self) -> Self {
        self.retry = true;
        self
    }
}
