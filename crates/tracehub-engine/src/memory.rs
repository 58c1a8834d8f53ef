//! In-memory implementations of the repository and span store.
//!
//! Used by the `tracehub` binary for local runs and as test doubles.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use tracehub_core::{RunId, RunType, Span, Task, TaskId, TaskRun};

use crate::clock::Clock;
use crate::repo::{RunPatch, TaskQuery, TaskRepository};
use crate::span_query::{ListSpansParam, SpanPage, SpanQuery};
use crate::EngineError;

#[derive(Default)]
struct Store {
    tasks: HashMap<TaskId, Task>,
    runs: HashMap<RunId, TaskRun>,
    counters: HashMap<String, i64>,
}

impl Store {
    fn with_runs(&self, task: &Task) -> Task {
        let mut task = task.clone();
        let mut runs: Vec<TaskRun> = self
            .runs
            .values()
            .filter(|r| r.task_id == task.id)
            .cloned()
            .collect();
        runs.sort_by(|a, b| {
            (a.run_start_at, a.created_at, a.id.as_str()).cmp(&(b.run_start_at, b.created_at, b.id.as_str()))
        });
        task.runs = runs;
        task
    }

    fn latest_run(&self, task_id: &TaskId, run_type: RunType) -> Option<TaskRun> {
        self.runs
            .values()
            .filter(|r| &r.task_id == task_id && r.run_type == run_type)
            .max_by_key(|r| (r.run_start_at, r.created_at))
            .cloned()
    }

    fn add(&mut self, key: String, delta: i64) -> i64 {
        let value = self.counters.entry(key).or_insert(0);
        *value += delta;
        *value
    }

    fn get(&self, key: &str) -> i64 {
        self.counters.get(key).copied().unwrap_or(0)
    }
}

fn task_key(task_id: &TaskId) -> String {
    format!("task_count:{task_id}")
}

fn run_key(kind: &str, task_id: &TaskId, run_id: &RunId) -> String {
    format!("{kind}:{task_id}:{run_id}")
}

/// Task repository backed by process memory.
pub struct MemoryTaskRepository {
    store: RwLock<Store>,
    clock: Arc<dyn Clock>,
}

impl MemoryTaskRepository {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            store: RwLock::new(Store::default()),
            clock,
        }
    }

    /// Number of stored tasks.
    pub async fn task_total(&self) -> usize {
        self.store.read().await.tasks.len()
    }

    async fn bump(&self, key: String, delta: i64) -> Result<i64, EngineError> {
        Ok(self.store.write().await.add(key, delta))
    }

    async fn read(&self, key: String) -> Result<i64, EngineError> {
        Ok(self.store.read().await.get(&key))
    }
}

#[async_trait]
impl TaskRepository for MemoryTaskRepository {
    async fn list_tasks(&self, query: &TaskQuery) -> Result<Vec<Task>, EngineError> {
        let store = self.store.read().await;
        let mut tasks: Vec<&Task> = store
            .tasks
            .values()
            .filter(|t| query.statuses.is_empty() || query.statuses.contains(&t.status))
            .filter(|t| query.updated_after.map_or(true, |after| t.updated_at >= after))
            .collect();
        tasks.sort_by(|a, b| (a.created_at, a.id.as_str()).cmp(&(b.created_at, b.id.as_str())));
        let limit = if query.limit == 0 { usize::MAX } else { query.limit };
        Ok(tasks
            .into_iter()
            .skip(query.offset)
            .take(limit)
            .map(|t| store.with_runs(t))
            .collect())
    }

    async fn get_task(&self, task_id: &TaskId) -> Result<Option<Task>, EngineError> {
        let store = self.store.read().await;
        Ok(store.tasks.get(task_id).map(|t| store.with_runs(t)))
    }

    async fn create_task(&self, mut task: Task) -> Result<Task, EngineError> {
        let now = self.clock.now_ms();
        task.created_at = now;
        task.updated_at = now;
        task.runs.clear();
        let mut store = self.store.write().await;
        if store.tasks.contains_key(&task.id) {
            return Err(EngineError::Repository(format!("task {} already exists", task.id)));
        }
        store.tasks.insert(task.id.clone(), task.clone());
        Ok(task)
    }

    async fn update_task(&self, task: &Task) -> Result<(), EngineError> {
        let mut store = self.store.write().await;
        if !store.tasks.contains_key(&task.id) {
            return Err(EngineError::TaskNotFound(task.id.clone()));
        }
        let mut stored = task.clone();
        stored.runs.clear();
        stored.updated_at = self.clock.now_ms();
        store.tasks.insert(stored.id.clone(), stored);
        Ok(())
    }

    async fn latest_new_data_run(&self, task_id: &TaskId) -> Result<Option<TaskRun>, EngineError> {
        Ok(self.store.read().await.latest_run(task_id, RunType::NewData))
    }

    async fn backfill_run(&self, task_id: &TaskId) -> Result<Option<TaskRun>, EngineError> {
        Ok(self.store.read().await.latest_run(task_id, RunType::BackFill))
    }

    async fn create_run(&self, run: TaskRun) -> Result<TaskRun, EngineError> {
        let mut store = self.store.write().await;
        if !store.tasks.contains_key(&run.task_id) {
            return Err(EngineError::TaskNotFound(run.task_id.clone()));
        }
        let existing = store.runs.values().find(|r| {
            r.task_id == run.task_id
                && r.run_type == run.run_type
                && (r.run_type == RunType::BackFill || r.run_start_at == run.run_start_at)
        });
        if let Some(existing) = existing {
            return Ok(existing.clone());
        }
        store.runs.insert(run.id.clone(), run.clone());
        Ok(run)
    }

    async fn update_run(&self, run: &TaskRun) -> Result<(), EngineError> {
        let mut store = self.store.write().await;
        let version = store
            .runs
            .get(&run.id)
            .map(|r| r.version)
            .ok_or_else(|| EngineError::Repository(format!("run {} not found", run.id)))?;
        let mut stored = run.clone();
        stored.version = version + 1;
        store.runs.insert(stored.id.clone(), stored);
        Ok(())
    }

    async fn update_run_with_occ(
        &self,
        run_id: &RunId,
        expected_version: u64,
        patch: RunPatch,
    ) -> Result<u64, EngineError> {
        let now = self.clock.now_ms();
        let mut store = self.store.write().await;
        let run = store
            .runs
            .get_mut(run_id)
            .ok_or_else(|| EngineError::Repository(format!("run {run_id} not found")))?;
        if run.version != expected_version {
            return Err(EngineError::VersionConflict {
                run_id: run_id.clone(),
                expected: expected_version,
            });
        }
        if let Some(status) = patch.status {
            run.status = status;
        }
        if let Some(detail) = patch.run_detail {
            run.run_detail = detail;
        }
        if let Some(detail) = patch.backfill_detail {
            run.backfill_detail = Some(detail);
        }
        run.version += 1;
        run.updated_at = now;
        Ok(run.version)
    }

    async fn incr_task_count(&self, task_id: &TaskId) -> Result<i64, EngineError> {
        self.bump(task_key(task_id), 1).await
    }

    async fn decr_task_count(&self, task_id: &TaskId) -> Result<i64, EngineError> {
        self.bump(task_key(task_id), -1).await
    }

    async fn task_count(&self, task_id: &TaskId) -> Result<i64, EngineError> {
        self.read(task_key(task_id)).await
    }

    async fn incr_run_count(&self, task_id: &TaskId, run_id: &RunId) -> Result<i64, EngineError> {
        self.bump(run_key("run_count", task_id, run_id), 1).await
    }

    async fn decr_run_count(&self, task_id: &TaskId, run_id: &RunId) -> Result<i64, EngineError> {
        self.bump(run_key("run_count", task_id, run_id), -1).await
    }

    async fn run_count(&self, task_id: &TaskId, run_id: &RunId) -> Result<i64, EngineError> {
        self.read(run_key("run_count", task_id, run_id)).await
    }

    async fn incr_run_success_count(
        &self,
        task_id: &TaskId,
        run_id: &RunId,
    ) -> Result<i64, EngineError> {
        self.bump(run_key("run_success", task_id, run_id), 1).await
    }

    async fn incr_run_failed_count(
        &self,
        task_id: &TaskId,
        run_id: &RunId,
    ) -> Result<i64, EngineError> {
        self.bump(run_key("run_failed", task_id, run_id), 1).await
    }

    async fn run_success_count(&self, task_id: &TaskId, run_id: &RunId) -> Result<i64, EngineError> {
        self.read(run_key("run_success", task_id, run_id)).await
    }

    async fn run_failed_count(&self, task_id: &TaskId, run_id: &RunId) -> Result<i64, EngineError> {
        self.read(run_key("run_failed", task_id, run_id)).await
    }
}

/// Span store backed by process memory. Page tokens encode an offset into
/// the filtered, ordered result. Tenants are not modelled.
#[derive(Default)]
pub struct MemorySpanStore {
    spans: RwLock<Vec<Span>>,
}

impl MemorySpanStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, span: Span) {
        self.spans.write().await.push(span);
    }
}

#[async_trait]
impl SpanQuery for MemorySpanStore {
    async fn list_spans(&self, param: &ListSpansParam) -> Result<SpanPage, EngineError> {
        let offset = match &param.page_token {
            Some(token) => token
                .parse::<usize>()
                .map_err(|_| EngineError::SpanQuery(format!("malformed page token '{token}'")))?,
            None => 0,
        };

        let spans = self.spans.read().await;
        let mut matched: Vec<&Span> = spans
            .iter()
            .filter(|s| param.start_at <= s.start_time && s.start_time < param.end_at)
            .filter(|s| param.filters.satisfied(s))
            .collect();
        matched.sort_by(|a, b| (a.start_time, &a.span_id).cmp(&(b.start_time, &b.span_id)));
        if param.desc_by_start_time {
            matched.reverse();
        }

        let limit = param.limit.max(1);
        let end = (offset + limit).min(matched.len());
        let page: Vec<Span> = matched
            .get(offset..end)
            .unwrap_or_default()
            .iter()
            .map(|s| (*s).clone())
            .collect();
        let has_more = end < matched.len();
        Ok(SpanPage {
            spans: page,
            has_more,
            page_token: has_more.then(|| end.to_string()),
        })
    }
}
