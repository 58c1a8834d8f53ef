//! Historical backfill.
//!
//! One invocation replays a task's backfill window through the live dispatch
//! logic. A pager walks the span store page by page and feeds a bounded
//! queue; a single flush consumer samples each page, dispatches its spans and
//! commits the page cursor. Cursors only move forward after a page was fully
//! processed, so an interrupted backfill resumes at the first page that was
//! not committed.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use tracehub_core::{
    BackfillDetail, BackfillEvent, EffectiveTime, RunType, Span, Task, TaskId, TaskRun, TaskStatus,
};

use crate::clock::Clock;
use crate::config::{backfill_lock_key, Config};
use crate::dispatcher::Dispatcher;
use crate::error::ErrorList;
use crate::filter_builder::FilterBuilder;
use crate::handler::{HandlerRegistry, TaskHandler};
use crate::lifecycle::LifecycleAdvancer;
use crate::lock::LockClient;
use crate::producer::BackfillProducer;
use crate::repo::{RunPatch, TaskRepository};
use crate::sampler::sample_page;
use crate::span_query::{ListSpansParam, SpanQuery};
use crate::subscriber::Subscriber;
use crate::EngineError;

/// One page travelling from the pager to the flush consumer.
struct Batch {
    spans: Vec<Span>,
    /// Cursor of the page after this one.
    next_token: Option<String>,
}

/// Consumer-side state of one invocation.
struct FlushState {
    errors: ErrorList,
    detail: BackfillDetail,
    version: u64,
    /// Set once a page failed; no later cursor is committed.
    cursor_frozen: bool,
    task_finished: bool,
}

pub struct BackfillPipeline {
    config: Arc<Config>,
    repo: Arc<dyn TaskRepository>,
    spans: Arc<dyn SpanQuery>,
    filters: Arc<dyn FilterBuilder>,
    handlers: Arc<HandlerRegistry>,
    advancer: Arc<LifecycleAdvancer>,
    dispatcher: Arc<Dispatcher>,
    locks: LockClient,
    producer: Arc<dyn BackfillProducer>,
    clock: Arc<dyn Clock>,
}

impl BackfillPipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Arc<Config>,
        repo: Arc<dyn TaskRepository>,
        spans: Arc<dyn SpanQuery>,
        filters: Arc<dyn FilterBuilder>,
        handlers: Arc<HandlerRegistry>,
        advancer: Arc<LifecycleAdvancer>,
        dispatcher: Arc<Dispatcher>,
        locks: LockClient,
        producer: Arc<dyn BackfillProducer>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            config,
            repo,
            spans,
            filters,
            handlers,
            advancer,
            dispatcher,
            locks,
            producer,
            clock,
        }
    }

    /// Run the backfill `event` asks for. Completes with the first error of
    /// the invocation, after every page has been given a chance; a retry
    /// request is published when anything failed.
    pub async fn run(&self, event: &BackfillEvent, parent: &CancellationToken) -> Result<(), EngineError> {
        let token = parent.child_token();
        let _cancel_on_exit = token.clone().drop_guard();

        let result = self.run_locked(event, &token).await;
        if let Err(e) = &result {
            warn!(task_id = %event.task_id, error = %e, "Backfill finished with errors");
            self.request_retry(event);
        }
        result
    }

    async fn run_locked(&self, event: &BackfillEvent, token: &CancellationToken) -> Result<(), EngineError> {
        let task = self
            .repo
            .get_task(&event.task_id)
            .await?
            .ok_or_else(|| EngineError::TaskNotFound(event.task_id.clone()))?;
        if task.is_terminal() {
            debug!(task_id = %task.id, status = %task.status, "Backfill skipped for finished task");
            return Ok(());
        }
        let Some(window) = task.backfill_window() else {
            debug!(task_id = %task.id, "Task has no backfill window");
            return Ok(());
        };
        let key = backfill_lock_key(&task.id);
        let Some(guard) = self
            .locks
            .lock_with_renew(
                &key,
                self.config.backfill_lock_ttl,
                self.config.backfill_lock_max_hold,
                token.clone(),
            )
            .await
        else {
            info!(task_id = %task.id, "Backfill already running elsewhere");
            return Ok(());
        };

        let result = self.run_with_lock(&task, window, token).await;
        guard.release().await;
        result
    }

    /// Open or resume the backfill run and pump it. The caller holds the
    /// task's backfill lock.
    async fn run_with_lock(
        &self,
        task: &Task,
        window: EffectiveTime,
        token: &CancellationToken,
    ) -> Result<(), EngineError> {
        let handler = self.handlers.get(task.task_type);
        let Some(run) = self.backfill_run(task, handler.as_ref(), window).await? else {
            warn!(task_id = %task.id, "Backfill run could not be opened");
            return Ok(());
        };
        if run.status.is_done() {
            debug!(task_id = %task.id, run_id = %run.id, "Backfill already done");
            return Ok(());
        }

        info!(
            task_id = %task.id,
            run_id = %run.id,
            start_at = run.run_start_at,
            end_at = run.run_end_at,
            resume = run.last_page_token().is_some(),
            "Backfill started"
        );
        self.pump(task, &run, handler, token).await
    }

    async fn backfill_run(
        &self,
        task: &Task,
        handler: &dyn TaskHandler,
        window: EffectiveTime,
    ) -> Result<Option<TaskRun>, EngineError> {
        if let Some(run) = self.repo.backfill_run(&task.id).await? {
            return Ok(Some(run));
        }
        handler
            .on_task_run_created(task, RunType::BackFill, window.start_at, window.end_at)
            .await?;
        self.repo.backfill_run(&task.id).await
    }

    async fn pump(
        &self,
        task: &Task,
        run: &TaskRun,
        handler: Arc<dyn TaskHandler>,
        token: &CancellationToken,
    ) -> Result<(), EngineError> {
        let (tx, rx) = mpsc::channel(self.config.backfill_queue_capacity.max(1));
        let deadline = Instant::now() + self.config.backfill_timeout;

        let (paged, flushed) = tokio::join!(
            self.page(task, run, tx, token, deadline),
            self.flush(&task.id, run, handler.clone(), rx, token),
        );

        let mut errors = flushed.errors;
        let completed = paged.is_ok() && !token.is_cancelled();
        match paged {
            Err(e) => errors.push(e),
            Ok(()) if token.is_cancelled() => errors.push(EngineError::Cancelled),
            Ok(()) => {}
        }

        if completed && !flushed.cursor_frozen && !flushed.task_finished {
            if let Err(e) = self.finish(task, handler.as_ref()).await {
                errors.push(e);
            }
        }
        info!(
            task_id = %task.id,
            processed = flushed.detail.total_count,
            failed = flushed.detail.failed_count,
            errors = errors.len(),
            "Backfill stopped"
        );
        errors.into_first()
    }

    async fn page(
        &self,
        task: &Task,
        run: &TaskRun,
        tx: mpsc::Sender<Batch>,
        token: &CancellationToken,
        deadline: Instant,
    ) -> Result<(), EngineError> {
        let mut param = ListSpansParam {
            tenants: self.filters.tenants(task.rule.span_filter.platform_type),
            filters: self.filters.build(task),
            start_at: run.run_start_at,
            end_at: run.run_end_at,
            limit: self.config.backfill_page_size,
            desc_by_start_time: true,
            page_token: run.last_page_token().map(str::to_string),
        };

        loop {
            let page = tokio::select! {
                biased;
                _ = token.cancelled() => return Err(EngineError::Cancelled),
                _ = tokio::time::sleep_until(deadline) => {
                    token.cancel();
                    return Err(EngineError::DeadlineExceeded);
                }
                page = self.spans.list_spans(&param) => page?,
            };
            let more = page.has_more && page.page_token.is_some();
            debug!(task_id = %task.id, spans = page.spans.len(), more, "Backfill page listed");

            if !page.spans.is_empty() {
                let batch = Batch {
                    spans: page.spans,
                    next_token: page.page_token.clone(),
                };
                tokio::select! {
                    biased;
                    _ = token.cancelled() => return Err(EngineError::Cancelled),
                    _ = tokio::time::sleep_until(deadline) => {
                        token.cancel();
                        return Err(EngineError::DeadlineExceeded);
                    }
                    sent = tx.send(batch) => {
                        if sent.is_err() {
                            return Ok(());
                        }
                    }
                }
            }
            if !more {
                return Ok(());
            }
            param.page_token = page.page_token;
        }
    }

    async fn flush(
        &self,
        task_id: &TaskId,
        run: &TaskRun,
        handler: Arc<dyn TaskHandler>,
        mut rx: mpsc::Receiver<Batch>,
        token: &CancellationToken,
    ) -> FlushState {
        let mut state = FlushState {
            errors: ErrorList::new(),
            detail: run.backfill_detail.clone().unwrap_or_default(),
            version: run.version,
            cursor_frozen: false,
            task_finished: false,
        };
        loop {
            let batch = tokio::select! {
                biased;
                _ = token.cancelled() => break,
                batch = rx.recv() => match batch {
                    Some(batch) => batch,
                    None => break,
                },
            };
            if state.task_finished {
                continue;
            }
            self.flush_batch(task_id, run, &handler, batch, &mut state).await;
        }
        state
    }

    async fn flush_batch(
        &self,
        task_id: &TaskId,
        run: &TaskRun,
        handler: &Arc<dyn TaskHandler>,
        batch: Batch,
        state: &mut FlushState,
    ) {
        let task = match self.repo.get_task(task_id).await {
            Ok(Some(task)) => task,
            Ok(None) => {
                state.errors.push(EngineError::TaskNotFound(task_id.clone()));
                state.cursor_frozen = true;
                return;
            }
            Err(e) => {
                state.errors.push(e);
                state.cursor_frozen = true;
                return;
            }
        };
        if task.is_terminal() {
            state.task_finished = true;
            return;
        }

        let spans = sample_page(batch.spans, task.sampler().sample_rate);
        let mut sub = Subscriber::new(task, RunType::BackFill, handler.clone());
        sub.set_status(TaskStatus::Running);

        let mut page_failed = false;
        for span in &spans {
            match self.advancer.task_cap_reached(&mut sub, run).await {
                Ok(false) => {}
                Ok(true) => {
                    state.task_finished = true;
                    return;
                }
                Err(e) => {
                    state.errors.push(e);
                    page_failed = true;
                    break;
                }
            }
            let errors = self.dispatcher.dispatch(span, std::slice::from_ref(&sub)).await;
            state.detail.total_count += 1;
            if errors.is_empty() {
                state.detail.success_count += 1;
            } else {
                state.detail.failed_count += 1;
                page_failed = true;
                state.errors.extend(errors);
            }
        }

        if page_failed && !state.cursor_frozen {
            warn!(task_id = %task_id, "Backfill page failed, cursor frozen");
            state.cursor_frozen = true;
        }
        if state.cursor_frozen {
            return;
        }

        if let Some(next) = batch.next_token {
            state.detail.last_page_token = Some(next);
        }
        let patch = RunPatch {
            backfill_detail: Some(state.detail.clone()),
            ..Default::default()
        };
        match self.repo.update_run_with_occ(&run.id, state.version, patch).await {
            Ok(version) => {
                state.version = version;
                debug!(task_id = %task_id, version, "Backfill cursor committed");
            }
            Err(e) => {
                warn!(task_id = %task_id, error = %e, "Backfill cursor commit failed");
                state.errors.push(e);
                state.cursor_frozen = true;
            }
        }
    }

    async fn finish(&self, task: &Task, handler: &dyn TaskHandler) -> Result<(), EngineError> {
        let Some(run) = self.repo.backfill_run(&task.id).await? else {
            return Ok(());
        };
        if run.status.is_done() {
            return Ok(());
        }
        handler.on_task_finished(task, &run, false).await?;
        info!(task_id = %task.id, run_id = %run.id, at = self.clock.now_ms(), "Backfill completed");
        Ok(())
    }

    fn request_retry(&self, event: &BackfillEvent) {
        let producer = self.producer.clone();
        let event = event.clone().retried();
        tokio::spawn(async move {
            if let Err(e) = producer.send_backfill(event).await {
                warn!(error = %e, "Backfill retry request failed");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{Harness, DAY, T};
    use std::time::Duration;
    use tracehub_core::Sampler;

    const FROM: i64 = T - 3 * DAY;

    fn config(page_size: usize) -> Config {
        Config {
            backfill_page_size: page_size,
            backfill_queue_capacity: 2,
            ..Config::default()
        }
    }

    async fn seed(h: &Harness, n: i64) {
        for i in 0..n {
            h.spans
                .insert(Span::new("ws", "trace", format!("s{i}"), FROM + 1_000 * (i + 1)))
                .await;
        }
    }

    async fn backfill_task(h: &Harness, sampler: Sampler) -> Task {
        h.create_task_with(
            EffectiveTime::new(T - 1, T + DAY),
            Some(EffectiveTime::new(FROM, T - 2 * DAY)),
            sampler,
        )
        .await
    }

    fn event(task: &Task) -> BackfillEvent {
        BackfillEvent::new(task.workspace_id.clone(), task.id.clone())
    }

    #[tokio::test]
    async fn test_backfill_processes_all_pages_and_finishes_run() {
        let h = Harness::new();
        seed(&h, 5).await;
        let task = backfill_task(&h, Sampler::default()).await;

        h.backfill(config(2))
            .run(&event(&task), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(h.handler.invoked(), ["s4", "s3", "s2", "s1", "s0"]);
        let run = h.repo.backfill_run(&task.id).await.unwrap().unwrap();
        assert!(run.status.is_done());
        let detail = run.backfill_detail.unwrap();
        assert_eq!(detail.success_count, 5);
        assert_eq!(detail.last_page_token.as_deref(), Some("4"));
        assert!(!h.lock.is_held(&backfill_lock_key(&task.id)).await);
    }

    #[tokio::test]
    async fn test_done_run_is_a_no_op() {
        let h = Harness::new();
        seed(&h, 3).await;
        let task = backfill_task(&h, Sampler::default()).await;
        let pipeline = h.backfill(config(10));
        pipeline.run(&event(&task), &CancellationToken::new()).await.unwrap();
        let calls = h.handler.invoked().len();

        pipeline.run(&event(&task), &CancellationToken::new()).await.unwrap();

        assert_eq!(h.handler.invoked().len(), calls);
    }

    #[tokio::test]
    async fn test_page_sampling_keeps_a_stable_prefix() {
        let h = Harness::new();
        seed(&h, 10).await;
        let sampler = Sampler {
            sample_rate: 0.3,
            ..Sampler::default()
        };
        let first = backfill_task(&h, sampler.clone()).await;
        let second = backfill_task(&h, sampler).await;
        let pipeline = h.backfill(config(10));

        pipeline.run(&event(&first), &CancellationToken::new()).await.unwrap();
        let once = h.handler.invoked();
        pipeline.run(&event(&second), &CancellationToken::new()).await.unwrap();

        assert_eq!(once, ["s9", "s8", "s7"]);
        assert_eq!(h.handler.invoked()[3..], once[..]);
    }

    #[tokio::test]
    async fn test_failed_page_freezes_cursor_and_resume_skips_flushed_pages() {
        let h = Harness::new();
        seed(&h, 6).await;
        let task = backfill_task(&h, Sampler::default()).await;
        let pipeline = h.backfill(config(2));
        h.handler.fail_once("s3");

        let first = pipeline.run(&event(&task), &CancellationToken::new()).await;
        assert!(matches!(first, Err(EngineError::Handler { .. })));
        let run = h.repo.backfill_run(&task.id).await.unwrap().unwrap();
        assert!(!run.status.is_done());
        assert_eq!(run.last_page_token(), Some("2"));

        let retry = tokio::time::timeout(Duration::from_secs(5), h.next_event())
            .await
            .unwrap()
            .unwrap();
        assert!(retry.retry);

        pipeline.run(&retry, &CancellationToken::new()).await.unwrap();

        let invoked = h.handler.invoked();
        let count = |id: &str| invoked.iter().filter(|s| s.as_str() == id).count();
        assert_eq!(count("s5"), 1);
        assert_eq!(count("s4"), 1);
        assert_eq!(count("s3"), 1);
        assert_eq!(count("s0"), 2);
        assert!(h.repo.backfill_run(&task.id).await.unwrap().unwrap().status.is_done());
    }

    #[tokio::test]
    async fn test_sample_size_reached_mid_page_finishes_task() {
        let h = Harness::new();
        seed(&h, 5).await;
        let sampler = Sampler {
            sample_size: 2,
            ..Sampler::default()
        };
        let task = backfill_task(&h, sampler).await;

        h.backfill(config(10))
            .run(&event(&task), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(h.handler.invoked().len(), 2);
        assert_eq!(h.stored(&task.id).await.status, TaskStatus::Success);
    }

    #[tokio::test]
    async fn test_lock_held_elsewhere_skips() {
        let h = Harness::new();
        seed(&h, 2).await;
        let task = backfill_task(&h, Sampler::default()).await;
        let key = backfill_lock_key(&task.id);
        assert!(h.lock_client().try_lock(&key, Duration::from_secs(60)).await);

        h.backfill(config(10))
            .run(&event(&task), &CancellationToken::new())
            .await
            .unwrap();

        assert!(h.handler.invoked().is_empty());
    }

    #[tokio::test]
    async fn test_deadline_aborts_without_finishing() {
        let h = Harness::new();
        seed(&h, 2).await;
        let task = backfill_task(&h, Sampler::default()).await;
        let config = Config {
            backfill_timeout: Duration::ZERO,
            ..config(10)
        };

        let result = h.backfill(config).run(&event(&task), &CancellationToken::new()).await;

        assert!(matches!(result, Err(EngineError::DeadlineExceeded)));
        assert!(!h.repo.backfill_run(&task.id).await.unwrap().unwrap().status.is_done());
        assert!(!h.lock.is_held(&backfill_lock_key(&task.id)).await);
    }

    #[tokio::test]
    async fn test_cancelled_parent_stops_backfill() {
        let h = Harness::new();
        seed(&h, 2).await;
        let task = backfill_task(&h, Sampler::default()).await;
        let parent = CancellationToken::new();
        parent.cancel();

        let result = h.backfill(config(10)).run(&event(&task), &parent).await;

        assert!(matches!(result, Err(EngineError::Cancelled)));
        assert!(h.handler.invoked().is_empty());
    }

    #[tokio::test]
    async fn test_cancel_lets_dequeued_page_finish() {
        let h = Harness::new();
        seed(&h, 4).await;
        let task = backfill_task(&h, Sampler::default()).await;
        let parent = CancellationToken::new();
        h.handler.cancel_after_invoke(parent.clone());

        let result = h.backfill(config(2)).run(&event(&task), &parent).await;

        assert!(matches!(result, Err(EngineError::Cancelled)));
        assert_eq!(h.handler.invoked(), ["s3", "s2"]);
        let run = h.repo.backfill_run(&task.id).await.unwrap().unwrap();
        assert!(!run.status.is_done());
        assert_eq!(run.last_page_token(), Some("2"));
    }

    #[tokio::test]
    async fn test_lock_held_elsewhere_opens_no_run() {
        let h = Harness::new();
        seed(&h, 2).await;
        let task = backfill_task(&h, Sampler::default()).await;
        let key = backfill_lock_key(&task.id);
        assert!(h.lock_client().try_lock(&key, Duration::from_secs(60)).await);

        h.backfill(config(10))
            .run(&event(&task), &CancellationToken::new())
            .await
            .unwrap();

        assert!(h.repo.backfill_run(&task.id).await.unwrap().is_none());
        assert_eq!(h.handler.calls("run_created"), 0);
    }

    #[tokio::test]
    async fn test_concurrent_requests_open_one_backfill_run() {
        let h = Harness::new();
        seed(&h, 4).await;
        let task = backfill_task(&h, Sampler::default()).await;
        let first = h.backfill(config(2));
        let second = h.backfill(config(2));
        let token = CancellationToken::new();
        let (ea, eb) = (event(&task), event(&task));

        let (a, b) = tokio::join!(first.run(&ea, &token), second.run(&eb, &token));
        a.unwrap();
        b.unwrap();

        let runs = h.stored(&task.id).await.runs;
        let backfill = runs.iter().filter(|r| r.run_type == RunType::BackFill).count();
        assert_eq!(backfill, 1);
        let mut invoked = h.handler.invoked();
        invoked.sort();
        assert_eq!(invoked, ["s0", "s1", "s2", "s3"]);
    }
}
