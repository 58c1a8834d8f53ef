//! The trace hub: entry points for spans, backfill requests and task
//! management, plus the periodic timers.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use tracehub_core::{BackfillEvent, EffectiveTime, Span, Task, TaskId, TaskStatus};

use crate::backfill::BackfillPipeline;
use crate::cache::TaskCache;
use crate::clock::Clock;
use crate::config::Config;
use crate::dispatcher::Dispatcher;
use crate::error::ErrorList;
use crate::filter_builder::FilterBuilder;
use crate::handler::HandlerRegistry;
use crate::lifecycle::LifecycleAdvancer;
use crate::lock::{DistributedLock, LockClient};
use crate::matcher::Matcher;
use crate::producer::BackfillProducer;
use crate::reconciler::Reconciler;
use crate::repo::TaskRepository;
use crate::sampler;
use crate::span_query::SpanQuery;
use crate::EngineError;

/// External systems the hub is wired to.
pub struct Collaborators {
    pub repo: Arc<dyn TaskRepository>,
    pub spans: Arc<dyn SpanQuery>,
    pub lock: Arc<dyn DistributedLock>,
    pub producer: Arc<dyn BackfillProducer>,
    pub filters: Arc<dyn FilterBuilder>,
    pub handlers: HandlerRegistry,
    pub clock: Arc<dyn Clock>,
}

pub struct TraceHub {
    config: Arc<Config>,
    repo: Arc<dyn TaskRepository>,
    clock: Arc<dyn Clock>,
    cache: Arc<TaskCache>,
    filters: Arc<dyn FilterBuilder>,
    handlers: Arc<HandlerRegistry>,
    producer: Arc<dyn BackfillProducer>,
    matcher: Matcher,
    advancer: Arc<LifecycleAdvancer>,
    dispatcher: Arc<Dispatcher>,
    reconciler: Reconciler,
    backfill: BackfillPipeline,
    shutdown: CancellationToken,
}

impl TraceHub {
    pub fn new(config: Config, c: Collaborators) -> Arc<Self> {
        let config = Arc::new(config);
        let cache = Arc::new(TaskCache::new());
        let handlers = Arc::new(c.handlers);
        let advancer = Arc::new(LifecycleAdvancer::new(c.repo.clone(), c.clock.clone()));
        let dispatcher = Arc::new(Dispatcher::new(c.repo.clone(), c.clock.clone()));

        let reconciler = Reconciler::new(
            config.clone(),
            c.repo.clone(),
            handlers.clone(),
            advancer.clone(),
            LockClient::new(c.lock.clone()),
            c.producer.clone(),
            c.clock.clone(),
        );
        let backfill = BackfillPipeline::new(
            config.clone(),
            c.repo.clone(),
            c.spans,
            c.filters.clone(),
            handlers.clone(),
            advancer.clone(),
            dispatcher.clone(),
            LockClient::new(c.lock),
            c.producer.clone(),
            c.clock.clone(),
        );

        Arc::new(Self {
            matcher: Matcher::new(cache.clone(), handlers.clone()),
            config,
            repo: c.repo,
            clock: c.clock,
            cache,
            filters: c.filters,
            handlers,
            producer: c.producer,
            advancer,
            dispatcher,
            reconciler,
            backfill,
            shutdown: CancellationToken::new(),
        })
    }

    pub fn cache(&self) -> &TaskCache {
        &self.cache
    }

    pub fn reconciler(&self) -> &Reconciler {
        &self.reconciler
    }

    pub async fn refresh_cache(&self) -> Result<(), EngineError> {
        self.cache
            .refresh(
                self.repo.as_ref(),
                self.filters.as_ref(),
                self.clock.as_ref(),
                self.config.task_page_size,
            )
            .await
    }

    /// Route one live span to every task it matches.
    ///
    /// Matching tasks are sampled, advanced through their lifecycle and then
    /// dispatched to. Errors from individual tasks are collected; the
    /// remaining tasks still see the span.
    pub async fn on_span(&self, span: &Span) -> Result<(), ErrorList> {
        let (tasks, mut errors) = self.matcher.candidates(span);
        let admitted: Vec<Task> = tasks
            .into_iter()
            .filter(|task| {
                let keep = sampler::admit(task.sampler().sample_rate);
                if !keep {
                    debug!(task_id = %task.id, span_id = %span.span_id, "Span not sampled");
                }
                keep
            })
            .collect();
        if admitted.is_empty() {
            return errors.into_result();
        }

        let subs = self.matcher.subscribe(admitted);
        let (subs, advance_errors) = self.advancer.advance_all(subs).await;
        errors.extend(advance_errors);
        errors.extend(self.dispatcher.dispatch(span, &subs).await);

        if !errors.is_empty() {
            warn!(
                span_id = %span.span_id,
                trace_id = %span.trace_id,
                errors = errors.len(),
                "Span handled with errors"
            );
        }
        errors.into_result()
    }

    /// Process one backfill request. Stops early when the hub shuts down.
    pub async fn on_backfill_request(&self, event: &BackfillEvent) -> Result<(), EngineError> {
        info!(task_id = %event.task_id, retry = event.retry, "Backfill requested");
        self.backfill.run(event, &self.shutdown).await
    }

    /// Validate and persist a new task, then request its backfill if it
    /// has a backfill window.
    pub async fn create_task(&self, mut task: Task) -> Result<Task, EngineError> {
        task.validate()?;
        let handler = self.handlers.get(task.task_type);
        handler.validate_config(&task.config).await?;

        let now = self.clock.now_ms();
        task.status = TaskStatus::Unstarted;
        task.runs.clear();
        task.created_at = now;
        task.updated_at = now;
        let task = self.repo.create_task(task).await?;
        handler.on_task_created(&task).await?;
        info!(task_id = %task.id, workspace_id = %task.workspace_id, "Task registered");

        if task.should_trigger_backfill() {
            let event = BackfillEvent::new(task.workspace_id.clone(), task.id.clone());
            if let Err(e) = self.producer.send_backfill(event).await {
                warn!(task_id = %task.id, error = %e, "Backfill request failed");
            }
        }
        // Make the task matchable before the next periodic refresh.
        self.refresh_now(&task.id).await;
        Ok(task)
    }

    /// Replace a task's live window.
    pub async fn update_effective_time(
        &self,
        task_id: &TaskId,
        window: EffectiveTime,
    ) -> Result<Task, EngineError> {
        let mut task = self.task(task_id).await?;
        task.set_effective_time(window, self.clock.now_ms())?;
        task.updated_at = self.clock.now_ms();
        self.repo.update_task(&task).await?;
        info!(
            task_id = %task_id,
            start_at = window.start_at,
            end_at = window.end_at,
            "Task window updated"
        );
        self.refresh_now(task_id).await;
        Ok(task)
    }

    /// Move a task to `status` through its handler.
    pub async fn set_task_status(
        &self,
        task_id: &TaskId,
        status: TaskStatus,
    ) -> Result<Task, EngineError> {
        let task = self.task(task_id).await?;
        task.status.transition(status)?;
        self.handlers
            .get(task.task_type)
            .on_task_updated(&task, status)
            .await?;
        self.refresh_now(task_id).await;
        self.task(task_id).await
    }

    /// Out-of-band cache refresh after a task change. A failure leaves the
    /// previous snapshot until the next timer tick.
    async fn refresh_now(&self, task_id: &TaskId) {
        if let Err(e) = self.refresh_cache().await {
            debug!(task_id = %task_id, error = %e, "Cache refresh after task change failed");
        }
    }

    async fn task(&self, task_id: &TaskId) -> Result<Task, EngineError> {
        self.repo
            .get_task(task_id)
            .await?
            .ok_or_else(|| EngineError::TaskNotFound(task_id.clone()))
    }

    /// Spawn the reconciliation, counter sync and cache refresh timers.
    /// They stop, together with running backfills, once `token` is
    /// cancelled.
    pub fn start(self: &Arc<Self>, token: CancellationToken) -> Vec<JoinHandle<()>> {
        let shutdown = self.shutdown.clone();
        let watch = token.clone();
        tokio::spawn(async move {
            watch.cancelled().await;
            shutdown.cancel();
        });

        let config = &self.config;
        let refresh = self.spawn_timer(
            "cache_refresh",
            config.cache_refresh_interval,
            token.clone(),
            |hub| async move {
                if let Err(e) = hub.refresh_cache().await {
                    debug!(error = %e, "Periodic cache refresh failed");
                }
            },
        );
        let reconcile = self.spawn_timer(
            "reconcile",
            config.reconcile_interval,
            token.clone(),
            |hub| async move {
                let report = hub.reconciler.run_once().await;
                if !report.errors.is_empty() {
                    warn!(errors = %report.errors, "Reconciliation finished with errors");
                }
            },
        );
        let counters = self.spawn_timer(
            "counter_sync",
            config.counter_sync_interval,
            token,
            |hub| async move {
                let report = hub.reconciler.sync_counters().await;
                if !report.errors.is_empty() {
                    warn!(errors = %report.errors, "Counter sync finished with errors");
                }
            },
        );
        vec![refresh, reconcile, counters]
    }

    fn spawn_timer<F, Fut>(
        self: &Arc<Self>,
        name: &'static str,
        period: Duration,
        token: CancellationToken,
        tick: F,
    ) -> JoinHandle<()>
    where
        F: Fn(Arc<TraceHub>) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let hub = self.clone();
        let period = period.max(Duration::from_millis(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(timer = name, period_ms = period.as_millis() as u64, "Timer started");
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => tick(hub.clone()).await,
                }
            }
            info!(timer = name, "Timer stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{Harness, DAY, T};
    use tracehub_core::{Sampler, TimeUnit};

    fn task(live: EffectiveTime, backfill: Option<EffectiveTime>, sampler: Sampler) -> Task {
        Harness::task(live, backfill, sampler)
    }

    #[tokio::test]
    async fn test_sample_size_one_dispatches_once() {
        let h = Harness::new();
        let hub = h.hub(h.config());
        let sampler = Sampler {
            sample_size: 1,
            ..Sampler::default()
        };
        let created = hub
            .create_task(task(EffectiveTime::new(T - 1, T + DAY), None, sampler))
            .await
            .unwrap();

        hub.on_span(&Span::new("ws", "trace", "s1", T)).await.unwrap();
        hub.on_span(&Span::new("ws", "trace", "s2", T)).await.unwrap();

        assert_eq!(h.handler.invoked(), ["s1"]);
        assert_eq!(h.stored(&created.id).await.status, TaskStatus::Success);
    }

    #[tokio::test]
    async fn test_span_from_other_workspace_is_ignored() {
        let h = Harness::new();
        let hub = h.hub(h.config());
        hub.create_task(task(EffectiveTime::new(T - 1, T + DAY), None, Sampler::default()))
            .await
            .unwrap();

        hub.on_span(&Span::new("other", "trace", "s1", T)).await.unwrap();

        assert!(h.handler.invoked().is_empty());
    }

    #[tokio::test]
    async fn test_create_task_with_backfill_publishes_request() {
        let h = Harness::new();
        let hub = h.hub(h.config());
        let created = hub
            .create_task(task(
                EffectiveTime::new(T - 1, T + DAY),
                Some(EffectiveTime::new(T - 3 * DAY, T - 2 * DAY)),
                Sampler::default(),
            ))
            .await
            .unwrap();

        let event = h.next_event().await.unwrap();
        assert_eq!(event.task_id, created.id);
        assert!(!event.retry);
        assert_eq!(h.handler.calls("created"), 1);
    }

    #[tokio::test]
    async fn test_invalid_task_is_not_persisted() {
        let h = Harness::new();
        let hub = h.hub(h.config());

        let result = hub
            .create_task(task(EffectiveTime::new(T + DAY, T), None, Sampler::default()))
            .await;

        assert!(matches!(result, Err(EngineError::Core(_))));
        assert_eq!(h.repo.task_total().await, 0);
    }

    #[tokio::test]
    async fn test_set_task_status_rejects_invalid_transition() {
        let h = Harness::new();
        let hub = h.hub(h.config());
        let created = hub
            .create_task(task(EffectiveTime::new(T - 1, T + DAY), None, Sampler::default()))
            .await
            .unwrap();

        let disabled = hub.set_task_status(&created.id, TaskStatus::Disabled).await.unwrap();
        assert_eq!(disabled.status, TaskStatus::Disabled);

        let again = hub.set_task_status(&created.id, TaskStatus::Running).await;
        assert!(matches!(again, Err(EngineError::Core(_))));
    }

    #[tokio::test]
    async fn test_overflowing_cycle_is_rejected_at_creation() {
        let h = Harness::new();
        let hub = h.hub(h.config());
        let sampler = Sampler::default().cyclic(i64::MAX / 1000, TimeUnit::Day, 0);

        let result = hub
            .create_task(task(EffectiveTime::new(T - 1, T + DAY), None, sampler))
            .await;

        assert!(matches!(result, Err(EngineError::Core(_))));
        assert_eq!(h.repo.task_total().await, 0);
        hub.on_span(&Span::new("ws", "trace", "s1", T)).await.unwrap();
        assert!(h.handler.invoked().is_empty());
    }

    #[tokio::test]
    async fn test_disabled_task_stops_matching_immediately() {
        let h = Harness::new();
        let hub = h.hub(h.config());
        let created = hub
            .create_task(task(EffectiveTime::new(T - 1, T + DAY), None, Sampler::default()))
            .await
            .unwrap();
        hub.on_span(&Span::new("ws", "trace", "s1", T)).await.unwrap();

        hub.set_task_status(&created.id, TaskStatus::Disabled).await.unwrap();
        hub.on_span(&Span::new("ws", "trace", "s2", T)).await.unwrap();

        assert_eq!(h.handler.invoked(), ["s1"]);
        assert!(hub.cache().load().tasks.is_empty());
    }

    #[tokio::test]
    async fn test_update_effective_time_persists_window() {
        let h = Harness::new();
        let hub = h.hub(h.config());
        let created = hub
            .create_task(task(EffectiveTime::new(T + DAY, T + 2 * DAY), None, Sampler::default()))
            .await
            .unwrap();

        let window = EffectiveTime::new(T + DAY, T + 5 * DAY);
        hub.update_effective_time(&created.id, window).await.unwrap();

        assert_eq!(h.stored(&created.id).await.rule.effective_time, window);
    }

    #[tokio::test]
    async fn test_timers_stop_on_cancel() {
        let h = Harness::new();
        let config = Config {
            reconcile_interval: Duration::from_millis(10),
            counter_sync_interval: Duration::from_millis(10),
            cache_refresh_interval: Duration::from_millis(10),
            ..h.config()
        };
        let hub = h.hub(config);
        let task = h.create_task(T - 1, T + DAY, Sampler::default()).await;
        let token = CancellationToken::new();

        let handles = hub.start(token.clone());
        tokio::time::sleep(Duration::from_millis(50)).await;
        token.cancel();
        for handle in handles {
            tokio::time::timeout(Duration::from_secs(1), handle)
                .await
                .unwrap()
                .unwrap();
        }

        assert_eq!(h.stored(&task.id).await.status, TaskStatus::Running);
        assert_eq!(hub.cache().load().tasks.len(), 1);
    }
}
