//! Status enums for Tasks and TaskRuns.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::CoreError;

/// Lifecycle status of an automation Task.
///
/// ```text
/// Unstarted -> Running <-> Pending
///     \          |           /
///      +--> Success | Disabled | Failed
/// ```
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Task created, effective window not yet reached or not yet touched.
    #[default]
    Unstarted,
    /// Task has an active run and accepts spans.
    Running,
    /// Task is paused between runs.
    Pending,
    /// Task reached its time horizon or sample cap.
    Success,
    /// Task was disabled by a user.
    Disabled,
    /// Task failed irrecoverably.
    Failed,
}

impl TaskStatus {
    /// Statuses the reconciler and cache consider live.
    pub const NON_TERMINAL: [TaskStatus; 3] =
        [TaskStatus::Unstarted, TaskStatus::Running, TaskStatus::Pending];

    /// Statuses that end a task's lifecycle.
    pub const TERMINAL: [TaskStatus; 3] =
        [TaskStatus::Success, TaskStatus::Disabled, TaskStatus::Failed];

    /// Returns true if the task is in a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Disabled | Self::Failed)
    }

    /// Returns true if moving from `self` to `to` is a legal lifecycle step.
    /// Staying in the same status is always legal.
    pub fn can_transition_to(&self, to: TaskStatus) -> bool {
        use TaskStatus::*;
        if *self == to {
            return true;
        }
        match (self, to) {
            (Unstarted | Pending, Running) => true,
            (Running, Pending) => true,
            (Unstarted | Running | Pending, Success) => true,
            (Unstarted | Running | Pending, Disabled | Failed) => true,
            _ => false,
        }
    }

    /// Apply a transition, returning the new status.
    pub fn transition(self, to: TaskStatus) -> Result<TaskStatus, CoreError> {
        if self.can_transition_to(to) {
            Ok(to)
        } else {
            Err(CoreError::InvalidStateTransition {
                from: self.to_string(),
                to: to.to_string(),
            })
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unstarted => "unstarted",
            Self::Running => "running",
            Self::Pending => "pending",
            Self::Success => "success",
            Self::Disabled => "disabled",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status of a single TaskRun.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Run window is open (or not yet finalized).
    #[default]
    Running,
    /// Run was finalized.
    Done,
}

impl RunStatus {
    /// Returns true if the run has been finalized.
    pub fn is_done(&self) -> bool {
        matches!(self, Self::Done)
    }
}

/// Kind of data a TaskRun consumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunType {
    /// Live spans arriving after the run started.
    NewData,
    /// Historical spans replayed from storage.
    BackFill,
}

impl fmt::Display for RunType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NewData => f.write_str("new_data"),
            Self::BackFill => f.write_str("back_fill"),
        }
    }
}

/// Kind of automation a Task performs. Used as the handler registry key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    AutoEvaluate,
    AutoDataReflow,
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AutoEvaluate => f.write_str("auto_evaluate"),
            Self::AutoDataReflow => f.write_str("auto_data_reflow"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_statuses() {
        for status in TaskStatus::TERMINAL {
            assert!(status.is_terminal());
        }
        for status in TaskStatus::NON_TERMINAL {
            assert!(!status.is_terminal());
        }
    }

    #[test]
    fn test_allowed_transitions() {
        assert_eq!(
            TaskStatus::Unstarted.transition(TaskStatus::Running).unwrap(),
            TaskStatus::Running
        );
        assert!(TaskStatus::Pending.can_transition_to(TaskStatus::Running));
        assert!(TaskStatus::Running.can_transition_to(TaskStatus::Pending));
        assert!(TaskStatus::Running.can_transition_to(TaskStatus::Success));
        assert!(TaskStatus::Running.can_transition_to(TaskStatus::Running));
    }

    #[test]
    fn test_terminal_states_are_sticky() {
        let err = TaskStatus::Success.transition(TaskStatus::Running);
        assert!(matches!(
            err,
            Err(CoreError::InvalidStateTransition { .. })
        ));
        assert!(!TaskStatus::Disabled.can_transition_to(TaskStatus::Success));
        assert!(!TaskStatus::Pending.can_transition_to(TaskStatus::Unstarted));
        assert!(TaskStatus::Unstarted.can_transition_to(TaskStatus::Success));
        assert!(!TaskStatus::Failed.can_transition_to(TaskStatus::Disabled));
    }

    #[test]
    fn test_serde_names() {
        let json = serde_json::to_string(&TaskStatus::Unstarted).unwrap();
        assert_eq!(json, "\"unstarted\"");
        let run_type: RunType = serde_json::from_str("\"back_fill\"").unwrap();
        assert_eq!(run_type, RunType::BackFill);
    }
}
