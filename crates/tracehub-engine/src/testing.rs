//! In-memory fixtures shared by the engine's unit tests.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use tracehub_core::{
    BackfillEvent, EffectiveTime, RunType, Sampler, Span, SpanFilter, SpanListType, Task, TaskId,
    TaskRule, TaskRun, TaskStatus, TaskType,
};

use crate::backfill::BackfillPipeline;
use crate::clock::{Clock, ManualClock};
use crate::config::Config;
use crate::dispatcher::Dispatcher;
use crate::filter_builder::DefaultFilterBuilder;
use crate::handler::{HandlerRegistry, StoreHandler, TaskHandler};
use crate::hub::{Collaborators, TraceHub};
use crate::lifecycle::LifecycleAdvancer;
use crate::lock::{LockClient, MemoryLock};
use crate::memory::{MemorySpanStore, MemoryTaskRepository};
use crate::producer::ChannelBackfillProducer;
use crate::reconciler::Reconciler;
use crate::repo::TaskRepository;
use crate::subscriber::Subscriber;
use crate::EngineError;

pub(crate) const T: i64 = 1_700_000_000_000;
pub(crate) const DAY: i64 = 86_400_000;

/// [`StoreHandler`] that records every call and can be told to fail.
pub(crate) struct RecordingHandler {
    inner: StoreHandler,
    calls: Mutex<HashMap<&'static str, usize>>,
    invoked: Mutex<Vec<String>>,
    fail: Mutex<HashSet<String>>,
    cancel: Mutex<Option<CancellationToken>>,
}

impl RecordingHandler {
    fn new(repo: Arc<dyn TaskRepository>, clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: StoreHandler::new(repo, clock),
            calls: Mutex::new(HashMap::new()),
            invoked: Mutex::new(Vec::new()),
            fail: Mutex::new(HashSet::new()),
            cancel: Mutex::new(None),
        }
    }

    fn record(&self, name: &'static str) {
        *self.calls.lock().unwrap().entry(name).or_default() += 1;
    }

    pub(crate) fn calls(&self, name: &str) -> usize {
        self.calls.lock().unwrap().get(name).copied().unwrap_or(0)
    }

    /// Span ids of successful invocations, in call order.
    pub(crate) fn invoked(&self) -> Vec<String> {
        self.invoked.lock().unwrap().clone()
    }

    /// Make the next invocation for `span_id` fail.
    pub(crate) fn fail_once(&self, span_id: &str) {
        self.fail.lock().unwrap().insert(span_id.to_string());
    }

    /// Cancel `token` right after the next successful invocation.
    pub(crate) fn cancel_after_invoke(&self, token: CancellationToken) {
        *self.cancel.lock().unwrap() = Some(token);
    }
}

#[async_trait]
impl TaskHandler for RecordingHandler {
    async fn validate_config(&self, config: &serde_json::Value) -> Result<(), EngineError> {
        self.record("validate");
        self.inner.validate_config(config).await
    }

    async fn invoke(&self, task: &Task, span: &Span, run: &TaskRun) -> Result<(), EngineError> {
        self.record("invoke");
        if self.fail.lock().unwrap().remove(&span.span_id) {
            return Err(EngineError::Handler {
                task_id: task.id.clone(),
                message: format!("injected failure for {}", span.span_id),
            });
        }
        self.inner.invoke(task, span, run).await?;
        self.invoked.lock().unwrap().push(span.span_id.clone());
        if let Some(token) = self.cancel.lock().unwrap().take() {
            token.cancel();
        }
        Ok(())
    }

    async fn on_task_created(&self, task: &Task) -> Result<(), EngineError> {
        self.record("created");
        self.inner.on_task_created(task).await
    }

    async fn on_task_updated(&self, task: &Task, status: TaskStatus) -> Result<(), EngineError> {
        self.record("updated");
        self.inner.on_task_updated(task, status).await
    }

    async fn on_task_finished(
        &self,
        task: &Task,
        run: &TaskRun,
        is_finish: bool,
    ) -> Result<(), EngineError> {
        self.record("finished");
        self.inner.on_task_finished(task, run, is_finish).await
    }

    async fn on_task_run_created(
        &self,
        task: &Task,
        run_type: RunType,
        start_at: i64,
        end_at: i64,
    ) -> Result<(), EngineError> {
        self.record("run_created");
        self.inner
            .on_task_run_created(task, run_type, start_at, end_at)
            .await
    }

    async fn on_task_run_finished(&self, task: &Task, run: &TaskRun) -> Result<(), EngineError> {
        self.record("run_finished");
        self.inner.on_task_run_finished(task, run).await
    }
}

/// A complete in-memory engine stack around a manual clock set to [`T`].
pub(crate) struct Harness {
    pub clock: Arc<ManualClock>,
    pub repo: Arc<MemoryTaskRepository>,
    pub spans: Arc<MemorySpanStore>,
    pub lock: Arc<MemoryLock>,
    pub handler: Arc<RecordingHandler>,
    pub producer: Arc<ChannelBackfillProducer>,
    events: tokio::sync::Mutex<mpsc::Receiver<BackfillEvent>>,
}

impl Harness {
    pub(crate) fn new() -> Self {
        let clock = Arc::new(ManualClock::new(T));
        let repo = Arc::new(MemoryTaskRepository::new(clock.clone()));
        let handler = Arc::new(RecordingHandler::new(repo.clone(), clock.clone()));
        let (producer, events) = ChannelBackfillProducer::new(64);
        Self {
            lock: Arc::new(MemoryLock::new(clock.clone())),
            spans: Arc::new(MemorySpanStore::new()),
            producer: Arc::new(producer),
            events: tokio::sync::Mutex::new(events),
            clock,
            repo,
            handler,
        }
    }

    /// Default configuration with sweep locks that expire immediately, so
    /// consecutive sweeps at the same instant are not skipped.
    pub(crate) fn config(&self) -> Config {
        Config {
            reconcile_lock_ttl: Duration::ZERO,
            counter_sync_lock_ttl: Duration::ZERO,
            ..Config::default()
        }
    }

    pub(crate) fn registry(&self) -> HandlerRegistry {
        HandlerRegistry::new().register(TaskType::AutoEvaluate, self.handler.clone())
    }

    pub(crate) fn advancer(&self) -> LifecycleAdvancer {
        LifecycleAdvancer::new(self.repo.clone(), self.clock.clone())
    }

    pub(crate) fn dispatcher(&self) -> Dispatcher {
        Dispatcher::new(self.repo.clone(), self.clock.clone())
    }

    pub(crate) fn lock_client(&self) -> LockClient {
        LockClient::new(self.lock.clone())
    }

    pub(crate) fn subscriber(&self, task: &Task) -> Subscriber {
        Subscriber::new(task.clone(), RunType::NewData, self.handler.clone())
    }

    pub(crate) async fn create_task(&self, start_at: i64, end_at: i64, sampler: Sampler) -> Task {
        self.create_task_with(EffectiveTime::new(start_at, end_at), None, sampler)
            .await
    }

    pub(crate) async fn create_task_with_backfill(
        &self,
        live: EffectiveTime,
        backfill: EffectiveTime,
    ) -> Task {
        self.create_task_with(live, Some(backfill), Sampler::default())
            .await
    }

    pub(crate) async fn create_task_with(
        &self,
        live: EffectiveTime,
        backfill: Option<EffectiveTime>,
        sampler: Sampler,
    ) -> Task {
        self.repo
            .create_task(Self::task(live, backfill, sampler))
            .await
            .unwrap()
    }

    pub(crate) fn task(live: EffectiveTime, backfill: Option<EffectiveTime>, sampler: Sampler) -> Task {
        let rule = TaskRule {
            span_filter: SpanFilter {
                span_list_type: SpanListType::AllSpan,
                ..SpanFilter::default()
            },
            effective_time: live,
            backfill_effective_time: backfill,
            sampler,
        };
        Task::new("ws", "evaluate answers", TaskType::AutoEvaluate, rule)
    }

    pub(crate) async fn stored(&self, task_id: &TaskId) -> Task {
        self.repo.get_task(task_id).await.unwrap().unwrap()
    }

    /// Next published backfill request, if one arrives within a second.
    pub(crate) async fn next_event(&self) -> Option<BackfillEvent> {
        let mut events = self.events.lock().await;
        tokio::time::timeout(Duration::from_secs(1), events.recv())
            .await
            .ok()
            .flatten()
    }

    pub(crate) fn reconciler(&self, config: Config) -> Reconciler {
        Reconciler::new(
            Arc::new(config),
            self.repo.clone(),
            Arc::new(self.registry()),
            Arc::new(self.advancer()),
            self.lock_client(),
            self.producer.clone(),
            self.clock.clone(),
        )
    }

    pub(crate) fn backfill(&self, config: Config) -> BackfillPipeline {
        BackfillPipeline::new(
            Arc::new(config),
            self.repo.clone(),
            self.spans.clone(),
            Arc::new(DefaultFilterBuilder),
            Arc::new(self.registry()),
            Arc::new(self.advancer()),
            Arc::new(self.dispatcher()),
            self.lock_client(),
            self.producer.clone(),
            self.clock.clone(),
        )
    }

    pub(crate) fn hub(&self, config: Config) -> Arc<TraceHub> {
        TraceHub::new(
            config,
            Collaborators {
                repo: self.repo.clone(),
                spans: self.spans.clone(),
                lock: self.lock.clone(),
                producer: self.producer.clone(),
                filters: Arc::new(DefaultFilterBuilder),
                handlers: self.registry(),
                clock: self.clock.clone(),
            },
        )
    }
}
