//! Timer-driven status reconciliation and counter synchronization.
//!
//! The reconciler is the time-driven twin of the live pre-dispatch path: it
//! starts, rolls and finishes tasks that receive no live traffic. Both sweeps
//! run on every replica but only the replica holding the sweep lock acts.

use std::sync::Arc;

use tracing::{debug, info, warn};

use tracehub_core::{BackfillEvent, RunDetail, RunStatus, Task, TaskRun, TaskStatus};

use crate::clock::{duration_ms, Clock};
use crate::config::{backfill_lock_key, Config};
use crate::error::ErrorList;
use crate::handler::{HandlerRegistry, TaskHandler};
use crate::lifecycle::LifecycleAdvancer;
use crate::lock::LockClient;
use crate::producer::BackfillProducer;
use crate::repo::{list_all_tasks, RunPatch, TaskQuery, TaskRepository};
use crate::EngineError;

/// Outcome of one sweep.
#[derive(Debug, Default)]
pub struct SweepReport {
    /// False when another replica held the lock.
    pub acquired: bool,
    /// Tasks (or runs, for counter sync) visited.
    pub visited: usize,
    pub errors: ErrorList,
}

pub struct Reconciler {
    config: Arc<Config>,
    repo: Arc<dyn TaskRepository>,
    handlers: Arc<HandlerRegistry>,
    advancer: Arc<LifecycleAdvancer>,
    locks: LockClient,
    producer: Arc<dyn BackfillProducer>,
    clock: Arc<dyn Clock>,
}

impl Reconciler {
    pub fn new(
        config: Arc<Config>,
        repo: Arc<dyn TaskRepository>,
        handlers: Arc<HandlerRegistry>,
        advancer: Arc<LifecycleAdvancer>,
        locks: LockClient,
        producer: Arc<dyn BackfillProducer>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            config,
            repo,
            handlers,
            advancer,
            locks,
            producer,
            clock,
        }
    }

    /// One status sweep over every non-terminal task.
    pub async fn run_once(&self) -> SweepReport {
        let mut report = SweepReport::default();
        if !self
            .locks
            .try_lock(&self.config.reconcile_lock_key, self.config.reconcile_lock_ttl)
            .await
        {
            debug!("Status sweep skipped, lock held elsewhere");
            return report;
        }
        report.acquired = true;

        let query = TaskQuery::with_statuses(&TaskStatus::NON_TERMINAL, self.config.task_page_size);
        let tasks = match list_all_tasks(self.repo.as_ref(), query).await {
            Ok(tasks) => tasks,
            Err(e) => {
                warn!(error = %e, "Listing tasks for status sweep failed");
                report.errors.push(e);
                return report;
            }
        };

        for task in &tasks {
            report.visited += 1;
            if let Err(e) = self.reconcile_task(task).await {
                warn!(task_id = %task.id, error = %e, "Task reconciliation failed");
                report.errors.push(e);
            }
        }
        info!(
            tasks = report.visited,
            errors = report.errors.len(),
            "Status sweep finished"
        );
        report
    }

    async fn reconcile_task(&self, task: &Task) -> Result<(), EngineError> {
        let now = self.clock.now_ms();
        let handler = self.handlers.get(task.task_type);
        let handler = handler.as_ref();

        match task.status {
            TaskStatus::Unstarted => {
                if task.should_trigger_new_data(now) {
                    self.advancer.first_touch(task, handler, true).await?;
                }
                Ok(())
            }
            TaskStatus::Running | TaskStatus::Pending => {
                if task.should_trigger_backfill() {
                    if self.reconcile_backfill(task, handler, now).await? {
                        return Ok(());
                    }
                } else if task.effective_time().has_ended(now) {
                    return self.finish_ended_task(task, handler).await;
                }

                let Some(run) = self.repo.latest_new_data_run(&task.id).await? else {
                    warn!(task_id = %task.id, status = %task.status, "Task has no current run");
                    return Ok(());
                };
                self.advancer.roll_run(task, handler, &run, now).await?;
                Ok(())
            }
            _ => Ok(()),
        }
    }

    async fn finish_ended_task(&self, task: &Task, handler: &dyn TaskHandler) -> Result<(), EngineError> {
        match self.repo.latest_new_data_run(&task.id).await? {
            Some(run) => {
                info!(task_id = %task.id, "Task window ended");
                handler.on_task_finished(task, &run, true).await
            }
            None => {
                warn!(task_id = %task.id, "Ended task has no run to finish");
                Ok(())
            }
        }
    }

    /// Returns true when the task was finished.
    async fn reconcile_backfill(
        &self,
        task: &Task,
        handler: &dyn TaskHandler,
        now: i64,
    ) -> Result<bool, EngineError> {
        let Some(backfill) = self.repo.backfill_run(&task.id).await? else {
            self.request_backfill(task).await;
            return Ok(false);
        };

        if backfill.status.is_done() {
            let live = task.effective_time();
            if live.is_valid() && !live.has_ended(now) {
                return Ok(false);
            }
            let run = self.run_to_finish(task, backfill).await?;
            info!(task_id = %task.id, "Backfill done and live window closed");
            handler.on_task_finished(task, &run, true).await?;
            return Ok(true);
        }

        let key = backfill_lock_key(&task.id);
        if self.locks.try_lock(&key, self.config.backfill_lock_ttl).await {
            self.locks.unlock(&key).await;
        } else {
            self.request_backfill(task).await;
        }
        Ok(false)
    }

    /// The open live run if there is one, otherwise the backfill run.
    async fn run_to_finish(&self, task: &Task, backfill: TaskRun) -> Result<TaskRun, EngineError> {
        let live = self.repo.latest_new_data_run(&task.id).await?;
        Ok(live
            .filter(|r| r.status == RunStatus::Running)
            .unwrap_or(backfill))
    }

    async fn request_backfill(&self, task: &Task) {
        let event = BackfillEvent::new(task.workspace_id.clone(), task.id.clone()).retried();
        match self.producer.send_backfill(event).await {
            Ok(()) => info!(task_id = %task.id, "Backfill retry requested"),
            Err(e) => warn!(task_id = %task.id, error = %e, "Backfill retry request failed"),
        }
    }

    /// Copy run counters of recently finished tasks into their runs.
    pub async fn sync_counters(&self) -> SweepReport {
        let mut report = SweepReport::default();
        if !self
            .locks
            .try_lock(&self.config.counter_sync_lock_key, self.config.counter_sync_lock_ttl)
            .await
        {
            debug!("Counter sync skipped, lock held elsewhere");
            return report;
        }
        report.acquired = true;

        let since = self.clock.now_ms() - duration_ms(self.config.recent_terminal_window);
        let query = TaskQuery {
            updated_after: Some(since),
            ..TaskQuery::with_statuses(&TaskStatus::TERMINAL, self.config.task_page_size)
        };
        let tasks = match list_all_tasks(self.repo.as_ref(), query).await {
            Ok(tasks) => tasks,
            Err(e) => {
                warn!(error = %e, "Listing tasks for counter sync failed");
                report.errors.push(e);
                return report;
            }
        };

        let runs: Vec<TaskRun> = tasks.into_iter().flat_map(|t| t.runs).collect();
        for (batch_no, batch) in runs.chunks(self.config.counter_sync_batch_size.max(1)).enumerate() {
            for run in batch {
                report.visited += 1;
                self.sync_run(run).await;
            }
            debug!(batch = batch_no, runs = batch.len(), "Counter batch synced");
        }
        info!(runs = report.visited, "Counter sync finished");
        report
    }

    async fn sync_run(&self, run: &TaskRun) {
        let success = self.repo.run_success_count(&run.task_id, &run.id).await;
        let failed = self.repo.run_failed_count(&run.task_id, &run.id).await;
        let (success_count, failed_count) = match (success, failed) {
            (Ok(s), Ok(f)) => (s, f),
            (Err(e), _) | (_, Err(e)) => {
                warn!(run_id = %run.id, error = %e, "Reading run counters failed");
                return;
            }
        };
        let detail = RunDetail {
            success_count,
            failed_count,
            total_count: success_count + failed_count,
        };
        if detail == run.run_detail {
            return;
        }
        let patch = RunPatch {
            run_detail: Some(detail),
            ..Default::default()
        };
        if let Err(e) = self.repo.update_run_with_occ(&run.id, run.version, patch).await {
            warn!(run_id = %run.id, error = %e, "Updating run counters failed");
        }
    }
}
