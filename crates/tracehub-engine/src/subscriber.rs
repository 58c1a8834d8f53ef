//! Ephemeral task bindings for one span or one backfill page.

use std::sync::Arc;

use tracehub_core::{RunType, Task, TaskId, TaskStatus};

use crate::handler::TaskHandler;

/// One task resolved against one piece of incoming data.
///
/// `status` starts as the task's cached status and is updated locally as the
/// lifecycle advancer acts, so later stages see the outcome of this pass
/// without another repository read.
pub struct Subscriber {
    pub task: Task,
    pub run_type: RunType,
    pub handler: Arc<dyn TaskHandler>,
    status: TaskStatus,
}

impl Subscriber {
    pub fn new(task: Task, run_type: RunType, handler: Arc<dyn TaskHandler>) -> Self {
        let status = task.status;
        Self {
            task,
            run_type,
            handler,
            status,
        }
    }

    pub fn task_id(&self) -> &TaskId {
        &self.task.id
    }

    pub fn status(&self) -> TaskStatus {
        self.status
    }

    pub fn set_status(&mut self, status: TaskStatus) {
        self.status = status;
    }

    pub fn is_running(&self) -> bool {
        self.status == TaskStatus::Running
    }
}
