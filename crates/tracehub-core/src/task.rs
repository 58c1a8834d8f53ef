//! Task and TaskRun types.

use serde::{Deserialize, Serialize};

use crate::filter::FilterGroup;
use crate::{CoreError, RunId, RunStatus, RunType, TaskId, TaskStatus, TaskType, WorkspaceId};

const MINUTE_MS: i64 = 60 * 1000;
const DAY_MS: i64 = 24 * 60 * MINUTE_MS;

/// A `[start_at, end_at)` window in Unix milliseconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EffectiveTime {
    pub start_at: i64,
    pub end_at: i64,
}

impl EffectiveTime {
    pub fn new(start_at: i64, end_at: i64) -> Self {
        Self { start_at, end_at }
    }

    /// Both ends set and ordered.
    pub fn is_valid(&self) -> bool {
        self.start_at > 0 && self.end_at > 0 && self.start_at < self.end_at
    }

    pub fn has_started(&self, now_ms: i64) -> bool {
        now_ms >= self.start_at
    }

    pub fn has_ended(&self, now_ms: i64) -> bool {
        now_ms > self.end_at
    }

    pub fn len_ms(&self) -> i64 {
        self.end_at - self.start_at
    }
}

/// Unit of a cyclic sampler's recurrence.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeUnit {
    Day,
    Week,
    #[default]
    Null,
}

impl TimeUnit {
    pub fn as_millis(&self) -> i64 {
        match self {
            TimeUnit::Day => DAY_MS,
            TimeUnit::Week => 7 * DAY_MS,
            TimeUnit::Null => 10 * MINUTE_MS,
        }
    }
}

/// Admission control policy of a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sampler {
    /// Probability in `[0, 1]` that a matched span is admitted.
    pub sample_rate: f64,
    /// Cap on the total number of accepted items for the task.
    pub sample_size: i64,
    pub is_cycle: bool,
    /// Cap on accepted items per run. Zero disables the per-run cap.
    #[serde(default)]
    pub cycle_count: i64,
    #[serde(default)]
    pub cycle_interval: i64,
    #[serde(default)]
    pub cycle_time_unit: TimeUnit,
}

impl Default for Sampler {
    fn default() -> Self {
        Self {
            sample_rate: 1.0,
            sample_size: 1_000,
            is_cycle: false,
            cycle_count: 0,
            cycle_interval: 0,
            cycle_time_unit: TimeUnit::Null,
        }
    }
}

impl Sampler {
    /// Length of one cycle in milliseconds, saturating at `i64::MAX`.
    pub fn cycle_length_ms(&self) -> i64 {
        self.cycle_interval
            .saturating_mul(self.cycle_time_unit.as_millis())
    }

    /// Builder method to make the sampler cyclic.
    pub fn cyclic(mut self, interval: i64, unit: TimeUnit, cycle_count: i64) -> Self {
        self.is_cycle = true;
        self.cycle_interval = interval;
        self.cycle_time_unit = unit;
        self.cycle_count = cycle_count;
        self
    }

    fn validate(&self) -> Result<(), CoreError> {
        if !(0.0..=1.0).contains(&self.sample_rate) {
            return Err(CoreError::InvalidInput(format!(
                "sample rate {} outside [0, 1]",
                self.sample_rate
            )));
        }
        if self.sample_size <= 0 {
            return Err(CoreError::InvalidInput(
                "sample size must be positive".to_string(),
            ));
        }
        if self.is_cycle && self.cycle_interval <= 0 {
            return Err(CoreError::InvalidInput(
                "cyclic sampler needs a positive cycle interval".to_string(),
            ));
        }
        if self.is_cycle
            && self
                .cycle_interval
                .checked_mul(self.cycle_time_unit.as_millis())
                .is_none()
        {
            return Err(CoreError::InvalidInput(format!(
                "cycle interval {} is too large",
                self.cycle_interval
            )));
        }
        if self.cycle_count < 0 {
            return Err(CoreError::InvalidInput(
                "cycle count must not be negative".to_string(),
            ));
        }
        Ok(())
    }
}

/// Platform a task's spans come from; selects the storage tenants.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlatformType {
    #[default]
    Cozeloop,
    Prompt,
    Evaluator,
    Workflow,
}

/// Which spans of a trace a task looks at.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpanListType {
    #[default]
    RootSpan,
    LlmSpan,
    AllSpan,
}

/// Filter part of a task rule.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SpanFilter {
    pub platform_type: PlatformType,
    pub span_list_type: SpanListType,
    /// User-defined predicates, ANDed with the built-in ones.
    #[serde(default)]
    pub filters: FilterGroup,
}

/// The automation rule of a task.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskRule {
    pub span_filter: SpanFilter,
    pub effective_time: EffectiveTime,
    #[serde(default)]
    pub backfill_effective_time: Option<EffectiveTime>,
    pub sampler: Sampler,
}

/// Counters synced from the counter store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunDetail {
    pub success_count: i64,
    pub failed_count: i64,
    pub total_count: i64,
}

/// Progress of a backfill run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackfillDetail {
    pub success_count: i64,
    pub failed_count: i64,
    pub total_count: i64,
    /// Token that fetches the first page not yet flushed.
    #[serde(default)]
    pub last_page_token: Option<String>,
}

/// A persisted automation rule plus its lifecycle state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub workspace_id: WorkspaceId,
    pub name: String,
    pub task_type: TaskType,
    pub status: TaskStatus,
    pub rule: TaskRule,
    /// Type-specific configuration, opaque to the orchestration core.
    #[serde(default)]
    pub config: serde_json::Value,
    pub created_by: String,
    pub created_at: i64,
    pub updated_at: i64,
    #[serde(default)]
    pub runs: Vec<TaskRun>,
}

impl Task {
    /// Create a new, unstarted Task.
    pub fn new(
        workspace_id: impl Into<WorkspaceId>,
        name: impl Into<String>,
        task_type: TaskType,
        rule: TaskRule,
    ) -> Self {
        Self {
            id: TaskId::generate(),
            workspace_id: workspace_id.into(),
            name: name.into(),
            task_type,
            status: TaskStatus::Unstarted,
            rule,
            config: serde_json::Value::Null,
            created_by: String::new(),
            created_at: 0,
            updated_at: 0,
            runs: Vec::new(),
        }
    }

    /// Builder method to set a specific ID (useful for testing).
    pub fn with_id(mut self, id: impl Into<TaskId>) -> Self {
        self.id = id.into();
        self
    }

    /// Builder method to set the status.
    pub fn with_status(mut self, status: TaskStatus) -> Self {
        self.status = status;
        self
    }

    pub fn sampler(&self) -> &Sampler {
        &self.rule.sampler
    }

    pub fn effective_time(&self) -> &EffectiveTime {
        &self.rule.effective_time
    }

    /// Check if the task is in a terminal state.
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Window of the first new-data run: the whole effective window, or its
    /// first cycle for cyclic samplers.
    pub fn initial_run_window(&self) -> (i64, i64) {
        let start = self.rule.effective_time.start_at;
        if self.rule.sampler.is_cycle {
            (start, start.saturating_add(self.rule.sampler.cycle_length_ms()))
        } else {
            (start, self.rule.effective_time.end_at)
        }
    }

    /// Backfill window, if the task asks for one.
    pub fn backfill_window(&self) -> Option<EffectiveTime> {
        self.rule.backfill_effective_time.filter(EffectiveTime::is_valid)
    }

    pub fn should_trigger_backfill(&self) -> bool {
        self.backfill_window().is_some()
    }

    /// True once the live window is valid and its start has been reached.
    pub fn should_trigger_new_data(&self, now_ms: i64) -> bool {
        let window = &self.rule.effective_time;
        window.is_valid() && window.has_started(now_ms)
    }

    /// The open new-data run, if any.
    pub fn current_run(&self) -> Option<&TaskRun> {
        self.runs
            .iter()
            .find(|r| r.run_type == RunType::NewData && r.status == RunStatus::Running)
    }

    /// The backfill run, if one was created.
    pub fn backfill_run(&self) -> Option<&TaskRun> {
        self.runs.iter().find(|r| r.run_type == RunType::BackFill)
    }

    /// Validate the rule. Called before a task is persisted.
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.name.trim().is_empty() {
            return Err(CoreError::InvalidInput("task name is required".to_string()));
        }
        if !self.rule.effective_time.is_valid() {
            return Err(CoreError::InvalidInput(
                "effective start must be before effective end".to_string(),
            ));
        }
        if let Some(backfill) = &self.rule.backfill_effective_time {
            if !backfill.is_valid() {
                return Err(CoreError::InvalidInput(
                    "backfill start must be before backfill end".to_string(),
                ));
            }
        }
        self.rule.sampler.validate()?;
        if self.rule.sampler.is_cycle
            && self
                .rule
                .effective_time
                .start_at
                .checked_add(self.rule.sampler.cycle_length_ms())
                .is_none()
        {
            return Err(CoreError::InvalidInput(
                "first cycle ends past the representable time range".to_string(),
            ));
        }
        self.rule.span_filter.filters.validate()
    }

    /// Change the live window. Unstarted tasks may move both ends, running
    /// or pending tasks only the end. A changed end must not be in the past.
    pub fn set_effective_time(
        &mut self,
        window: EffectiveTime,
        now_ms: i64,
    ) -> Result<(), CoreError> {
        if window.start_at >= window.end_at {
            return Err(CoreError::InvalidInput(
                "start time must be before end time".to_string(),
            ));
        }
        let current = self.rule.effective_time;
        if current.start_at != window.start_at && window.start_at < now_ms {
            return Err(CoreError::InvalidInput(
                "new start time must not be in the past".to_string(),
            ));
        }
        if current.end_at != window.end_at && window.end_at < now_ms {
            return Err(CoreError::InvalidInput(
                "new end time must not be in the past".to_string(),
            ));
        }
        match self.status {
            TaskStatus::Unstarted => {
                self.rule.effective_time = window;
            }
            TaskStatus::Running | TaskStatus::Pending => {
                if current.start_at != window.start_at {
                    return Err(CoreError::InvalidInput(
                        "start time is fixed once the task has started".to_string(),
                    ));
                }
                self.rule.effective_time.end_at = window.end_at;
            }
            status => {
                return Err(CoreError::InvalidInput(format!(
                    "cannot change the window of a {status} task"
                )));
            }
        }
        Ok(())
    }

    /// Move to `to`, returning the previous status when something changed.
    pub fn set_status(&mut self, to: TaskStatus) -> Result<Option<TaskStatus>, CoreError> {
        let from = self.status;
        self.status = from.transition(to)?;
        Ok((from != to).then_some(from))
    }
}

/// One execution window instance of a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRun {
    pub id: RunId,
    pub task_id: TaskId,
    pub workspace_id: WorkspaceId,
    pub run_type: RunType,
    pub status: RunStatus,
    pub run_start_at: i64,
    pub run_end_at: i64,
    #[serde(default)]
    pub run_detail: RunDetail,
    #[serde(default)]
    pub backfill_detail: Option<BackfillDetail>,
    /// Optimistic concurrency version, bumped on every detail update.
    #[serde(default)]
    pub version: u64,
    pub created_at: i64,
    pub updated_at: i64,
}

impl TaskRun {
    /// Create a new running TaskRun for `task`.
    pub fn new(task: &Task, run_type: RunType, run_start_at: i64, run_end_at: i64) -> Self {
        Self {
            id: RunId::generate(),
            task_id: task.id.clone(),
            workspace_id: task.workspace_id.clone(),
            run_type,
            status: RunStatus::Running,
            run_start_at,
            run_end_at,
            run_detail: RunDetail::default(),
            backfill_detail: (run_type == RunType::BackFill).then(BackfillDetail::default),
            version: 0,
            created_at: 0,
            updated_at: 0,
        }
    }

    /// Whether `ts` lies in `[run_start_at, run_end_at)`.
    pub fn contains(&self, ts: i64) -> bool {
        self.run_start_at <= ts && ts < self.run_end_at
    }

    pub fn has_ended(&self, now_ms: i64) -> bool {
        now_ms > self.run_end_at
    }

    /// The window that follows this one, of equal length.
    pub fn next_window(&self) -> (i64, i64) {
        let len = self.run_end_at.saturating_sub(self.run_start_at);
        (self.run_end_at, self.run_end_at.saturating_add(len))
    }

    /// Committed backfill cursor, if any.
    pub fn last_page_token(&self) -> Option<&str> {
        self.backfill_detail
            .as_ref()
            .and_then(|d| d.last_page_token.as_deref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const T: i64 = 1_700_000_000_000;

    fn rule(sampler: Sampler) -> TaskRule {
        TaskRule {
            effective_time: EffectiveTime::new(T, T + 30 * DAY_MS),
            sampler,
            ..Default::default()
        }
    }

    #[test]
    fn test_initial_window_non_cyclic() {
        let task = Task::new("ws", "t", TaskType::AutoEvaluate, rule(Sampler::default()));
        assert_eq!(task.initial_run_window(), (T, T + 30 * DAY_MS));
    }

    #[test]
    fn test_initial_window_cyclic() {
        let week = Sampler::default().cyclic(2, TimeUnit::Week, 10);
        let task = Task::new("ws", "t", TaskType::AutoEvaluate, rule(week));
        assert_eq!(task.initial_run_window(), (T, T + 14 * DAY_MS));

        let null_unit = Sampler::default().cyclic(1, TimeUnit::Null, 10);
        let task = Task::new("ws", "t", TaskType::AutoEvaluate, rule(null_unit));
        assert_eq!(task.initial_run_window(), (T, T + 10 * MINUTE_MS));
    }

    #[test]
    fn test_next_window_shifts_by_one_cycle() {
        let task = Task::new("ws", "t", TaskType::AutoEvaluate, rule(Sampler::default()));
        let run = TaskRun::new(&task, RunType::NewData, T, T + DAY_MS);
        assert_eq!(run.next_window(), (T + DAY_MS, T + 2 * DAY_MS));
        assert!(run.contains(T));
        assert!(!run.contains(T + DAY_MS));
        assert!(run.backfill_detail.is_none());
    }

    #[test]
    fn test_validate() {
        let mut task = Task::new("ws", "t", TaskType::AutoEvaluate, rule(Sampler::default()));
        assert!(task.validate().is_ok());

        task.rule.sampler.sample_rate = 1.5;
        assert!(task.validate().is_err());

        task.rule.sampler.sample_rate = 0.5;
        task.rule.effective_time = EffectiveTime::new(T + 1, T);
        assert!(task.validate().is_err());

        task.rule.effective_time = EffectiveTime::new(T, T + 1);
        task.rule.backfill_effective_time = Some(EffectiveTime::new(T, T));
        assert!(task.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_overflowing_cycle() {
        let huge = Sampler::default().cyclic(i64::MAX / 1000, TimeUnit::Day, 0);
        let task = Task::new("ws", "t", TaskType::AutoEvaluate, rule(huge));
        assert!(matches!(task.validate(), Err(CoreError::InvalidInput(_))));

        let late = Sampler::default().cyclic(i64::MAX / DAY_MS - 1, TimeUnit::Day, 0);
        let task = Task::new("ws", "t", TaskType::AutoEvaluate, rule(late));
        assert!(task.validate().is_err());
        assert_eq!(task.initial_run_window().1, i64::MAX);

        let run = TaskRun::new(&task, RunType::NewData, T, i64::MAX - 1);
        assert_eq!(run.next_window(), (i64::MAX - 1, i64::MAX));
    }

    #[test]
    fn test_set_effective_time_rules() {
        let mut task = Task::new("ws", "t", TaskType::AutoEvaluate, rule(Sampler::default()));
        let now = T - DAY_MS;

        task.set_effective_time(EffectiveTime::new(T + 1, T + 2 * DAY_MS), now)
            .unwrap();
        assert_eq!(task.effective_time().start_at, T + 1);

        task.status = TaskStatus::Running;
        let moved_start = task.set_effective_time(EffectiveTime::new(T + 2, T + 3 * DAY_MS), now);
        assert!(moved_start.is_err());
        task.set_effective_time(EffectiveTime::new(T + 1, T + 3 * DAY_MS), now)
            .unwrap();
        assert_eq!(task.effective_time().end_at, T + 3 * DAY_MS);

        let past_end = task.set_effective_time(EffectiveTime::new(T + 1, now - 1), now);
        assert!(past_end.is_err());

        task.status = TaskStatus::Success;
        assert!(task
            .set_effective_time(EffectiveTime::new(T + 1, T + 4 * DAY_MS), now)
            .is_err());
    }

    #[test]
    fn test_set_status_reports_change() {
        let mut task = Task::new("ws", "t", TaskType::AutoEvaluate, rule(Sampler::default()));
        assert_eq!(
            task.set_status(TaskStatus::Running).unwrap(),
            Some(TaskStatus::Unstarted)
        );
        assert_eq!(task.set_status(TaskStatus::Running).unwrap(), None);
    }
}
