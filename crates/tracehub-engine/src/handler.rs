//! Per-task-type handlers.
//!
//! The engine decides *when* a task or run changes state; a [`TaskHandler`]
//! performs the change and the type-specific reaction to accepted spans.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info};

use tracehub_core::{RunStatus, RunType, Span, Task, TaskRun, TaskStatus, TaskType};

use crate::clock::Clock;
use crate::repo::TaskRepository;
use crate::EngineError;

/// Capability interface implemented once per task type.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    /// Check the type-specific part of a task before it is persisted.
    async fn validate_config(&self, config: &serde_json::Value) -> Result<(), EngineError>;

    /// React to one accepted span.
    async fn invoke(&self, task: &Task, span: &Span, run: &TaskRun) -> Result<(), EngineError>;

    async fn on_task_created(&self, task: &Task) -> Result<(), EngineError>;

    /// Move `task` to `status`.
    async fn on_task_updated(&self, task: &Task, status: TaskStatus) -> Result<(), EngineError>;

    /// Finish `run`, and the whole task when `is_finish` is set.
    async fn on_task_finished(
        &self,
        task: &Task,
        run: &TaskRun,
        is_finish: bool,
    ) -> Result<(), EngineError>;

    /// Open a run of `run_type` covering `[start_at, end_at)`.
    async fn on_task_run_created(
        &self,
        task: &Task,
        run_type: RunType,
        start_at: i64,
        end_at: i64,
    ) -> Result<(), EngineError>;

    async fn on_task_run_finished(&self, task: &Task, run: &TaskRun) -> Result<(), EngineError>;
}

/// Handler for task types nothing was registered for.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopHandler;

#[async_trait]
impl TaskHandler for NoopHandler {
    async fn validate_config(&self, _config: &serde_json::Value) -> Result<(), EngineError> {
        Ok(())
    }

    async fn invoke(&self, _task: &Task, _span: &Span, _run: &TaskRun) -> Result<(), EngineError> {
        Ok(())
    }

    async fn on_task_created(&self, _task: &Task) -> Result<(), EngineError> {
        Ok(())
    }

    async fn on_task_updated(&self, _task: &Task, _status: TaskStatus) -> Result<(), EngineError> {
        Ok(())
    }

    async fn on_task_finished(
        &self,
        _task: &Task,
        _run: &TaskRun,
        _is_finish: bool,
    ) -> Result<(), EngineError> {
        Ok(())
    }

    async fn on_task_run_created(
        &self,
        _task: &Task,
        _run_type: RunType,
        _start_at: i64,
        _end_at: i64,
    ) -> Result<(), EngineError> {
        Ok(())
    }

    async fn on_task_run_finished(&self, _task: &Task, _run: &TaskRun) -> Result<(), EngineError> {
        Ok(())
    }
}

/// Handlers keyed by task type, with a no-op fallback.
///
/// Built once at startup and shared read-only afterwards.
#[derive(Clone)]
pub struct HandlerRegistry {
    handlers: HashMap<TaskType, Arc<dyn TaskHandler>>,
    fallback: Arc<dyn TaskHandler>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
            fallback: Arc::new(NoopHandler),
        }
    }

    /// Builder method to register the handler of one task type.
    pub fn register(mut self, task_type: TaskType, handler: Arc<dyn TaskHandler>) -> Self {
        self.handlers.insert(task_type, handler);
        self
    }

    pub fn get(&self, task_type: TaskType) -> Arc<dyn TaskHandler> {
        self.handlers
            .get(&task_type)
            .cloned()
            .unwrap_or_else(|| self.fallback.clone())
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Handler that persists lifecycle changes through the repository and
/// counts accepted spans against the task's caps.
pub struct StoreHandler {
    repo: Arc<dyn TaskRepository>,
    clock: Arc<dyn Clock>,
}

impl StoreHandler {
    pub fn new(repo: Arc<dyn TaskRepository>, clock: Arc<dyn Clock>) -> Self {
        Self { repo, clock }
    }

    async fn finish_run(&self, run: &TaskRun) -> Result<(), EngineError> {
        let Some(mut stored) = self.stored_run(run).await? else {
            return Ok(());
        };
        if stored.status.is_done() {
            return Ok(());
        }
        stored.status = RunStatus::Done;
        stored.updated_at = self.clock.now_ms();
        self.repo.update_run(&stored).await?;
        info!(task_id = %run.task_id, run_id = %run.id, run_type = %run.run_type, "Run finished");
        Ok(())
    }

    async fn stored_run(&self, run: &TaskRun) -> Result<Option<TaskRun>, EngineError> {
        let task = self.repo.get_task(&run.task_id).await?;
        Ok(task.and_then(|t| t.runs.into_iter().find(|r| r.id == run.id)))
    }

    async fn set_status(&self, task: &Task, status: TaskStatus) -> Result<(), EngineError> {
        let mut stored = self
            .repo
            .get_task(&task.id)
            .await?
            .ok_or_else(|| EngineError::TaskNotFound(task.id.clone()))?;
        if let Some(from) = stored.set_status(status)? {
            stored.updated_at = self.clock.now_ms();
            self.repo.update_task(&stored).await?;
            info!(task_id = %task.id, from = %from, to = %status, "Task status changed");
        }
        Ok(())
    }
}

#[async_trait]
impl TaskHandler for StoreHandler {
    async fn validate_config(&self, config: &serde_json::Value) -> Result<(), EngineError> {
        if config.is_null() || config.is_object() {
            Ok(())
        } else {
            Err(tracehub_core::CoreError::InvalidInput(
                "task config must be a JSON object".to_string(),
            )
            .into())
        }
    }

    async fn invoke(&self, task: &Task, span: &Span, run: &TaskRun) -> Result<(), EngineError> {
        let sampler = task.sampler();
        let task_count = self.repo.incr_task_count(&task.id).await?;
        let run_count = self.repo.incr_run_count(&task.id, &run.id).await?;

        let over_task_cap = task_count > sampler.sample_size;
        let over_cycle_cap = sampler.is_cycle && sampler.cycle_count > 0 && run_count > sampler.cycle_count;
        if over_task_cap || over_cycle_cap {
            self.repo.decr_task_count(&task.id).await?;
            self.repo.decr_run_count(&task.id, &run.id).await?;
            debug!(
                task_id = %task.id,
                span_id = %span.span_id,
                task_count,
                run_count,
                "Span dropped, cap reached"
            );
            return Ok(());
        }

        self.repo.incr_run_success_count(&task.id, &run.id).await?;
        debug!(
            task_id = %task.id,
            run_id = %run.id,
            trace_id = %span.trace_id,
            span_id = %span.span_id,
            "Span accepted"
        );
        Ok(())
    }

    async fn on_task_created(&self, task: &Task) -> Result<(), EngineError> {
        info!(task_id = %task.id, task_type = %task.task_type, "Task created");
        Ok(())
    }

    async fn on_task_updated(&self, task: &Task, status: TaskStatus) -> Result<(), EngineError> {
        self.set_status(task, status).await
    }

    async fn on_task_finished(
        &self,
        task: &Task,
        run: &TaskRun,
        is_finish: bool,
    ) -> Result<(), EngineError> {
        self.finish_run(run).await?;
        if !is_finish {
            return Ok(());
        }
        let current = self.repo.get_task(&task.id).await?;
        match current {
            Some(t) if t.is_terminal() => {
                debug!(task_id = %task.id, status = %t.status, "Task already terminal");
                Ok(())
            }
            Some(_) => self.set_status(task, TaskStatus::Success).await,
            None => Err(EngineError::TaskNotFound(task.id.clone())),
        }
    }

    async fn on_task_run_created(
        &self,
        task: &Task,
        run_type: RunType,
        start_at: i64,
        end_at: i64,
    ) -> Result<(), EngineError> {
        let mut run = TaskRun::new(task, run_type, start_at, end_at);
        let now = self.clock.now_ms();
        run.created_at = now;
        run.updated_at = now;
        let run = self.repo.create_run(run).await?;
        info!(
            task_id = %task.id,
            run_id = %run.id,
            run_type = %run_type,
            start_at,
            end_at,
            "Run created"
        );
        Ok(())
    }

    async fn on_task_run_finished(&self, _task: &Task, run: &TaskRun) -> Result<(), EngineError> {
        self.finish_run(run).await
    }
}
