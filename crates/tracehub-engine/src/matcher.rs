//! Live span matching.

use std::sync::Arc;

use tracing::debug;

use tracehub_core::{RunType, Span, Task};

use crate::cache::{TaskCache, TaskCacheSnapshot};
use crate::error::ErrorList;
use crate::handler::HandlerRegistry;
use crate::subscriber::Subscriber;
use crate::EngineError;

/// Finds the cached tasks whose filter rule a span satisfies.
pub struct Matcher {
    cache: Arc<TaskCache>,
    handlers: Arc<HandlerRegistry>,
}

impl Matcher {
    pub fn new(cache: Arc<TaskCache>, handlers: Arc<HandlerRegistry>) -> Self {
        Self { cache, handlers }
    }

    /// Tasks matched by `span`, plus the errors of tasks whose filter could
    /// not be evaluated.
    pub fn candidates(&self, span: &Span) -> (Vec<Task>, ErrorList) {
        let snapshot = self.cache.load();
        let mut errors = ErrorList::new();
        if !passes_prefilter(&snapshot, span) {
            return (Vec::new(), errors);
        }

        let mut matched = Vec::new();
        for cached in &snapshot.tasks {
            let task = &cached.task;
            if task.is_terminal() || task.rule.effective_time.start_at > span.start_time {
                continue;
            }
            match &cached.filter {
                Ok(filter) if filter.satisfied(span) => matched.push(task.clone()),
                Ok(_) => {}
                Err(e) => errors.push(EngineError::from(e.clone())),
            }
        }
        debug!(
            trace_id = %span.trace_id,
            span_id = %span.span_id,
            matched = matched.len(),
            "Span matched"
        );
        (matched, errors)
    }

    /// Bind matched tasks to their handlers for the live path.
    pub fn subscribe(&self, tasks: Vec<Task>) -> Vec<Subscriber> {
        tasks
            .into_iter()
            .map(|task| {
                let handler = self.handlers.get(task.task_type);
                Subscriber::new(task, RunType::NewData, handler)
            })
            .collect()
    }
}

/// Cheap rejection before any filter is evaluated.
fn passes_prefilter(snapshot: &TaskCacheSnapshot, span: &Span) -> bool {
    if span.is_evaluator_originated() {
        return false;
    }
    snapshot.workspace_ids.contains(&span.workspace_id)
        || span.bot_id().is_some_and(|bot| snapshot.bot_ids.contains(bot))
}
