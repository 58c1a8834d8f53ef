//! Hands accepted spans to task handlers.

use std::sync::Arc;

use tracing::{debug, warn};

use tracehub_core::{RunType, Span};

use crate::clock::Clock;
use crate::error::ErrorList;
use crate::repo::TaskRepository;
use crate::subscriber::Subscriber;
use crate::EngineError;

pub struct Dispatcher {
    repo: Arc<dyn TaskRepository>,
    clock: Arc<dyn Clock>,
}

impl Dispatcher {
    pub fn new(repo: Arc<dyn TaskRepository>, clock: Arc<dyn Clock>) -> Self {
        Self { repo, clock }
    }

    /// Invoke the handler of every running subscriber. One subscriber's
    /// failure does not stop the others.
    pub async fn dispatch(&self, span: &Span, subs: &[Subscriber]) -> ErrorList {
        let mut errors = ErrorList::new();
        for sub in subs.iter().filter(|s| s.is_running()) {
            if let Err(e) = self.dispatch_one(span, sub).await {
                warn!(
                    task_id = %sub.task_id(),
                    span_id = %span.span_id,
                    error = %e,
                    "Dispatch failed"
                );
                errors.push(e);
            }
        }
        errors
    }

    async fn dispatch_one(&self, span: &Span, sub: &Subscriber) -> Result<(), EngineError> {
        let run = match sub.run_type {
            RunType::NewData => self.repo.latest_new_data_run(sub.task_id()).await?,
            RunType::BackFill => self.repo.backfill_run(sub.task_id()).await?,
        };
        let Some(run) = run else {
            debug!(task_id = %sub.task_id(), run_type = %sub.run_type, "No run for span");
            return Ok(());
        };
        if run.status.is_done() {
            return Ok(());
        }
        let accepting = match sub.run_type {
            RunType::NewData => run.contains(self.clock.now_ms()),
            RunType::BackFill => run.contains(span.start_time),
        };
        if !accepting || span.start_time < run.run_start_at {
            debug!(
                task_id = %sub.task_id(),
                run_id = %run.id,
                span_id = %span.span_id,
                "Span outside run window"
            );
            return Ok(());
        }
        sub.handler.invoke(&sub.task, span, &run).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{Harness, DAY, T};
    use tracehub_core::{Sampler, TaskStatus};

    #[tokio::test]
    async fn test_dispatches_to_running_subscribers_only() {
        let h = Harness::new();
        let task = h.create_task(T - DAY, T + DAY, Sampler::default()).await;
        let mut sub = h.subscriber(&task);
        h.advancer().advance(&mut sub).await.unwrap();
        let mut paused = h.subscriber(&task);
        paused.set_status(TaskStatus::Pending);

        let span = Span::new("ws", "trace", "s1", T);
        let errors = h.dispatcher().dispatch(&span, &[sub, paused]).await;

        assert!(errors.is_empty());
        assert_eq!(h.handler.invoked(), vec!["s1".to_string()]);
    }

    #[tokio::test]
    async fn test_late_span_is_skipped() {
        let h = Harness::new();
        let task = h.create_task(T - DAY, T + DAY, Sampler::default()).await;
        let mut sub = h.subscriber(&task);
        h.advancer().advance(&mut sub).await.unwrap();

        let late = Span::new("ws", "trace", "s0", T - 2 * DAY);
        assert!(h.dispatcher().dispatch(&late, &[sub]).await.is_empty());
        assert!(h.handler.invoked().is_empty());
    }

    #[tokio::test]
    async fn test_running_subscriber_without_run_is_skipped() {
        let h = Harness::new();
        let task = h.create_task(T - DAY, T + DAY, Sampler::default()).await;
        let mut sub = h.subscriber(&task);
        sub.set_status(TaskStatus::Running);
        let mut backfill = Subscriber::new(task.clone(), RunType::BackFill, h.handler.clone());
        backfill.set_status(TaskStatus::Running);

        let span = Span::new("ws", "trace", "s1", T);
        let errors = h.dispatcher().dispatch(&span, &[sub, backfill]).await;

        assert!(errors.is_empty());
        assert_eq!(h.handler.calls("invoke"), 0);
        assert!(h.stored(&task.id).await.runs.is_empty());
    }

    #[tokio::test]
    async fn test_failure_does_not_block_other_subscribers() {
        let h = Harness::new();
        let a = h.create_task(T - DAY, T + DAY, Sampler::default()).await;
        let b = h.create_task(T - DAY, T + DAY, Sampler::default()).await;
        let (mut sa, mut sb) = (h.subscriber(&a), h.subscriber(&b));
        h.advancer().advance(&mut sa).await.unwrap();
        h.advancer().advance(&mut sb).await.unwrap();
        h.handler.fail_once("s1");

        let span = Span::new("ws", "trace", "s1", T);
        let errors = h.dispatcher().dispatch(&span, &[sa, sb]).await;

        assert_eq!(errors.len(), 1);
        assert_eq!(h.handler.invoked(), vec!["s1".to_string()]);
    }
}
