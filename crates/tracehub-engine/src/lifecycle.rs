//! Task and run lifecycle decisions.
//!
//! The advancer decides when a run is opened, rolled or finished and when a
//! task starts or ends. It never writes task or run rows itself; every
//! change goes through the task type's [`TaskHandler`].

use std::sync::Arc;

use tracing::{debug, info, warn};

use tracehub_core::{RunStatus, RunType, Task, TaskId, TaskRun, TaskStatus};

use crate::clock::Clock;
use crate::error::ErrorList;
use crate::handler::TaskHandler;
use crate::repo::TaskRepository;
use crate::subscriber::Subscriber;
use crate::EngineError;

pub struct LifecycleAdvancer {
    repo: Arc<dyn TaskRepository>,
    clock: Arc<dyn Clock>,
}

impl LifecycleAdvancer {
    pub fn new(repo: Arc<dyn TaskRepository>, clock: Arc<dyn Clock>) -> Self {
        Self { repo, clock }
    }

    /// Advance every subscriber. Subscribers whose advancement failed are
    /// dropped from the returned list so nothing is dispatched to them.
    pub async fn advance_all(&self, subs: Vec<Subscriber>) -> (Vec<Subscriber>, ErrorList) {
        let mut kept = Vec::with_capacity(subs.len());
        let mut errors = ErrorList::new();
        for mut sub in subs {
            match self.advance(&mut sub).await {
                Ok(()) => kept.push(sub),
                Err(e) => {
                    warn!(task_id = %sub.task_id(), error = %e, "Lifecycle advance failed");
                    errors.push(e);
                }
            }
        }
        (kept, errors)
    }

    /// Live pre-dispatch for one subscriber.
    pub async fn advance(&self, sub: &mut Subscriber) -> Result<(), EngineError> {
        let now = self.clock.now_ms();

        if sub.status() == TaskStatus::Unstarted {
            if !sub.task.should_trigger_new_data(now) {
                debug!(task_id = %sub.task_id(), "Task not yet effective");
                return Ok(());
            }
            let status = self.first_touch(&sub.task, sub.handler.as_ref(), false).await?;
            sub.set_status(status);
        }
        if sub.status().is_terminal() {
            return Ok(());
        }

        let Some(run) = self.current_run(&sub.task, sub.handler.as_ref()).await? else {
            debug!(task_id = %sub.task_id(), "No run to advance");
            return Ok(());
        };

        if sub.task.effective_time().has_ended(now) {
            info!(task_id = %sub.task_id(), "Task window ended");
            return self.finish_task(sub, &run).await;
        }

        if self.cap_reached(sub, &run).await? {
            return Ok(());
        }

        if sub.task.sampler().is_cycle {
            self.roll_run(&sub.task, sub.handler.as_ref(), &run, now).await?;
        }
        Ok(())
    }

    /// Open the first runs of an unstarted task and move it to `Running`.
    ///
    /// Safe to repeat against a stale task: existing runs are reused and the
    /// transition is only requested while the stored task is still
    /// `Unstarted`. Returns the task's status afterwards.
    pub async fn first_touch(
        &self,
        task: &Task,
        handler: &dyn TaskHandler,
        with_backfill: bool,
    ) -> Result<TaskStatus, EngineError> {
        let stored = self.stored_task(&task.id).await?;
        if stored.status != TaskStatus::Unstarted {
            return Ok(stored.status);
        }

        if stored.rule.effective_time.is_valid()
            && self.repo.latest_new_data_run(&stored.id).await?.is_none()
        {
            let (start, end) = stored.initial_run_window();
            handler
                .on_task_run_created(&stored, RunType::NewData, start, end)
                .await?;
        }

        if with_backfill {
            if let Some(window) = stored.backfill_window() {
                if self.repo.backfill_run(&stored.id).await?.is_none() {
                    handler
                        .on_task_run_created(&stored, RunType::BackFill, window.start_at, window.end_at)
                        .await?;
                }
            }
        }

        handler.on_task_updated(&stored, TaskStatus::Running).await?;
        info!(task_id = %stored.id, "Task started");
        Ok(TaskStatus::Running)
    }

    /// The task's latest new-data run, opened with the initial window when
    /// none exists yet.
    pub async fn current_run(
        &self,
        task: &Task,
        handler: &dyn TaskHandler,
    ) -> Result<Option<TaskRun>, EngineError> {
        if let Some(run) = self.repo.latest_new_data_run(&task.id).await? {
            return Ok(Some(run));
        }
        let (start, end) = task.initial_run_window();
        handler
            .on_task_run_created(task, RunType::NewData, start, end)
            .await?;
        self.repo.latest_new_data_run(&task.id).await
    }

    /// Finish `run` once its window has passed and, for cyclic samplers,
    /// open the next window while the task's own window is still open.
    /// Returns whether anything was rolled.
    pub async fn roll_run(
        &self,
        task: &Task,
        handler: &dyn TaskHandler,
        run: &TaskRun,
        now_ms: i64,
    ) -> Result<bool, EngineError> {
        if !run.has_ended(now_ms) {
            return Ok(false);
        }
        if run.status == RunStatus::Running {
            handler.on_task_finished(task, run, false).await?;
        }
        if task.sampler().is_cycle && !task.effective_time().has_ended(now_ms) {
            let latest = self.repo.latest_new_data_run(&task.id).await?;
            if latest.is_some_and(|l| l.run_start_at >= run.run_end_at) {
                debug!(task_id = %task.id, run_id = %run.id, "Next cycle already open");
                return Ok(true);
            }
            let (start, end) = run.next_window();
            handler
                .on_task_run_created(task, RunType::NewData, start, end)
                .await?;
            info!(task_id = %task.id, start_at = start, end_at = end, "Cycle rolled");
        }
        Ok(true)
    }

    /// Task-wide sample cap, the only cap that applies to backfill.
    pub async fn task_cap_reached(
        &self,
        sub: &mut Subscriber,
        run: &TaskRun,
    ) -> Result<bool, EngineError> {
        let task_count = self.count_or_zero(self.repo.task_count(sub.task_id()).await, sub.task_id());
        if task_count + 1 > sub.task.sampler().sample_size {
            info!(task_id = %sub.task_id(), task_count, "Sample size reached");
            self.finish_task(sub, run).await?;
            return Ok(true);
        }
        Ok(false)
    }

    async fn cap_reached(&self, sub: &mut Subscriber, run: &TaskRun) -> Result<bool, EngineError> {
        if self.task_cap_reached(sub, run).await? {
            return Ok(true);
        }
        let sampler = sub.task.sampler();
        if !sampler.is_cycle || sampler.cycle_count <= 0 || run.status != RunStatus::Running {
            return Ok(false);
        }
        let run_count = self.count_or_zero(
            self.repo.run_count(sub.task_id(), &run.id).await,
            sub.task_id(),
        );
        if run_count + 1 > sampler.cycle_count {
            info!(task_id = %sub.task_id(), run_id = %run.id, run_count, "Cycle count reached");
            sub.handler.on_task_finished(&sub.task, run, false).await?;
            return Ok(true);
        }
        Ok(false)
    }

    async fn finish_task(&self, sub: &mut Subscriber, run: &TaskRun) -> Result<(), EngineError> {
        sub.handler.on_task_finished(&sub.task, run, true).await?;
        sub.set_status(TaskStatus::Success);
        Ok(())
    }

    async fn stored_task(&self, task_id: &TaskId) -> Result<Task, EngineError> {
        self.repo
            .get_task(task_id)
            .await?
            .ok_or_else(|| EngineError::TaskNotFound(task_id.clone()))
    }

    fn count_or_zero(&self, count: Result<i64, EngineError>, task_id: &TaskId) -> i64 {
        count.unwrap_or_else(|e| {
            warn!(task_id = %task_id, error = %e, "Counter read failed, assuming zero");
            0
        })
    }
}
