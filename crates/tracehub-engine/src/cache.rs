//! Snapshot of the active tasks used to filter live spans.

use std::collections::HashSet;
use std::sync::Arc;

use arc_swap::ArcSwap;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use tracehub_core::{CoreError, FilterGroup, QueryType, Task, TaskStatus, WorkspaceId};

use crate::clock::Clock;
use crate::filter_builder::FilterBuilder;
use crate::repo::{list_all_tasks, TaskQuery, TaskRepository};
use crate::EngineError;

/// A cached task and its predicate tree, compiled when the snapshot was
/// built.
#[derive(Debug, Clone)]
pub struct CachedTask {
    pub task: Task,
    /// The validated tree, or why the task's rule cannot be evaluated.
    pub filter: Result<FilterGroup, CoreError>,
}

/// Immutable view of the non-terminal tasks at `update_time`.
#[derive(Debug, Clone, Default)]
pub struct TaskCacheSnapshot {
    pub workspace_ids: HashSet<WorkspaceId>,
    pub bot_ids: HashSet<String>,
    pub tasks: Vec<CachedTask>,
    pub update_time: i64,
}

impl TaskCacheSnapshot {
    pub fn from_tasks(tasks: Vec<Task>, filters: &dyn FilterBuilder, update_time: i64) -> Self {
        let workspace_ids = tasks.iter().map(|t| t.workspace_id.clone()).collect();
        let mut bot_ids = HashSet::new();
        for task in &tasks {
            collect_bot_ids(&task.rule.span_filter.filters, &mut bot_ids);
        }
        let tasks = tasks
            .into_iter()
            .map(|task| {
                let tree = filters.build(&task);
                let filter = tree.validate().map(|()| tree);
                if let Err(e) = &filter {
                    debug!(task_id = %task.id, error = %e, "Task filter cannot be evaluated");
                }
                CachedTask { task, filter }
            })
            .collect();
        Self {
            workspace_ids,
            bot_ids,
            tasks,
            update_time,
        }
    }
}

fn collect_bot_ids(group: &FilterGroup, out: &mut HashSet<String>) {
    for field in &group.fields {
        if field.field_name == tracehub_core::span::BOT_ID_TAG
            && matches!(field.query_type, Some(QueryType::Eq | QueryType::In))
        {
            out.extend(field.values.iter().cloned());
        }
        if let Some(sub) = &field.sub_filter {
            collect_bot_ids(sub, out);
        }
    }
}

/// Readers never block; writers serialize among themselves only.
pub struct TaskCache {
    current: ArcSwap<TaskCacheSnapshot>,
    refresh: Mutex<()>,
}

impl TaskCache {
    pub fn new() -> Self {
        Self {
            current: ArcSwap::from_pointee(TaskCacheSnapshot::default()),
            refresh: Mutex::new(()),
        }
    }

    pub fn load(&self) -> Arc<TaskCacheSnapshot> {
        self.current.load_full()
    }

    /// Swap in a prepared snapshot.
    pub fn replace(&self, snapshot: TaskCacheSnapshot) {
        self.current.store(Arc::new(snapshot));
    }

    /// Reload the non-terminal tasks. On failure the previous snapshot stays.
    pub async fn refresh(
        &self,
        repo: &dyn TaskRepository,
        filters: &dyn FilterBuilder,
        clock: &dyn Clock,
        page_size: usize,
    ) -> Result<(), EngineError> {
        let _writer = self.refresh.lock().await;
        let query = TaskQuery::with_statuses(&TaskStatus::NON_TERMINAL, page_size);
        match list_all_tasks(repo, query).await {
            Ok(tasks) => {
                let snapshot = TaskCacheSnapshot::from_tasks(tasks, filters, clock.now_ms());
                debug!(
                    tasks = snapshot.tasks.len(),
                    workspaces = snapshot.workspace_ids.len(),
                    bots = snapshot.bot_ids.len(),
                    "Task cache refreshed"
                );
                self.replace(snapshot);
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "Task cache refresh failed, keeping previous snapshot");
                Err(e)
            }
        }
    }
}

impl Default for TaskCache {
    fn default() -> Self {
        Self::new()
    }
}
