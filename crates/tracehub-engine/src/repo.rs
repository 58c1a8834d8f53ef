//! Task repository interface.
//!
//! The repository owns durable task and run state plus the cumulative
//! counters used for cap checks. The engine only ever reads reconstructible
//! views of it.

use async_trait::async_trait;

use tracehub_core::{BackfillDetail, RunDetail, RunId, RunStatus, Task, TaskId, TaskRun, TaskStatus};

use crate::EngineError;

/// Filters for a paginated task listing.
#[derive(Debug, Clone, Default)]
pub struct TaskQuery {
    /// Only tasks in one of these statuses. Empty means any.
    pub statuses: Vec<TaskStatus>,
    /// Only tasks updated at or after this instant (ms).
    pub updated_after: Option<i64>,
    pub limit: usize,
    pub offset: usize,
}

impl TaskQuery {
    pub fn with_statuses(statuses: &[TaskStatus], limit: usize) -> Self {
        Self {
            statuses: statuses.to_vec(),
            limit,
            ..Default::default()
        }
    }
}

/// Fields of a run updated under optimistic concurrency.
#[derive(Debug, Clone, Default)]
pub struct RunPatch {
    pub status: Option<RunStatus>,
    pub run_detail: Option<RunDetail>,
    pub backfill_detail: Option<BackfillDetail>,
}

/// Durable store of tasks, runs and counters.
///
/// Tasks returned by `get_task` and `list_tasks` carry their runs.
#[async_trait]
pub trait TaskRepository: Send + Sync {
    async fn list_tasks(&self, query: &TaskQuery) -> Result<Vec<Task>, EngineError>;

    async fn get_task(&self, task_id: &TaskId) -> Result<Option<Task>, EngineError>;

    async fn create_task(&self, task: Task) -> Result<Task, EngineError>;

    async fn update_task(&self, task: &Task) -> Result<(), EngineError>;

    /// Most recently started new-data run of a task, whatever its status.
    async fn latest_new_data_run(&self, task_id: &TaskId) -> Result<Option<TaskRun>, EngineError>;

    async fn backfill_run(&self, task_id: &TaskId) -> Result<Option<TaskRun>, EngineError>;

    /// Create a run unless the task already has one of the same type for
    /// the same window start (any backfill run counts). Returns the stored
    /// run either way.
    async fn create_run(&self, run: TaskRun) -> Result<TaskRun, EngineError>;

    /// Unconditional update; bumps the run version.
    async fn update_run(&self, run: &TaskRun) -> Result<(), EngineError>;

    /// Apply `patch` only if the stored version is `expected_version`.
    /// Returns the new version.
    async fn update_run_with_occ(
        &self,
        run_id: &RunId,
        expected_version: u64,
        patch: RunPatch,
    ) -> Result<u64, EngineError>;

    async fn incr_task_count(&self, task_id: &TaskId) -> Result<i64, EngineError>;
    async fn decr_task_count(&self, task_id: &TaskId) -> Result<i64, EngineError>;
    async fn task_count(&self, task_id: &TaskId) -> Result<i64, EngineError>;

    async fn incr_run_count(&self, task_id: &TaskId, run_id: &RunId) -> Result<i64, EngineError>;
    async fn decr_run_count(&self, task_id: &TaskId, run_id: &RunId) -> Result<i64, EngineError>;
    async fn run_count(&self, task_id: &TaskId, run_id: &RunId) -> Result<i64, EngineError>;

    async fn incr_run_success_count(&self, task_id: &TaskId, run_id: &RunId)
        -> Result<i64, EngineError>;
    async fn incr_run_failed_count(&self, task_id: &TaskId, run_id: &RunId)
        -> Result<i64, EngineError>;
    async fn run_success_count(&self, task_id: &TaskId, run_id: &RunId) -> Result<i64, EngineError>;
    async fn run_failed_count(&self, task_id: &TaskId, run_id: &RunId) -> Result<i64, EngineError>;
}

/// Page through `query` until a short page comes back.
pub async fn list_all_tasks(
    repo: &dyn TaskRepository,
    mut query: TaskQuery,
) -> Result<Vec<Task>, EngineError> {
    let page_size = query.limit.max(1);
    query.limit = page_size;
    query.offset = 0;
    let mut tasks = Vec::new();
    loop {
        let page = repo.list_tasks(&query).await?;
        let len = page.len();
        tasks.extend(page);
        if len < page_size {
            return Ok(tasks);
        }
        query.offset += len;
    }
}
