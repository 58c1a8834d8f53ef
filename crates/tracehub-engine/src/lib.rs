//! TraceHub Engine Library
//!
//! This crate routes observed spans to automation tasks and keeps those
//! tasks' lifecycles moving: matching and sampling live spans, opening and
//! rolling runs, replaying historical windows and the periodic sweeps that
//! reconcile task status and run counters.

pub mod backfill;
pub mod cache;
pub mod clock;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod filter_builder;
pub mod handler;
pub mod hub;
pub mod lifecycle;
pub mod lock;
pub mod matcher;
pub mod memory;
pub mod producer;
pub mod reconciler;
pub mod repo;
pub mod sampler;
pub mod span_query;
pub mod subscriber;

#[cfg(test)]
pub(crate) mod testing;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::Config;
pub use error::{EngineError, ErrorList};
pub use handler::{HandlerRegistry, StoreHandler, TaskHandler};
pub use hub::{Collaborators, TraceHub};
pub use lock::{DistributedLock, LockClient, MemoryLock};
pub use memory::{MemorySpanStore, MemoryTaskRepository};
pub use producer::{BackfillProducer, ChannelBackfillProducer};
pub use repo::TaskRepository;
pub use span_query::SpanQuery;
