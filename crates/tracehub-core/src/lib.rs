//! TraceHub Core Domain Types
//!
//! This crate contains pure domain types with no dependencies on:
//! - Network/messaging
//! - Database or counter stores
//! - Runtime specifics
//!
//! All types here describe automation tasks, their runs, and the spans
//! those tasks react to.

pub mod error;
pub mod event;
pub mod filter;
pub mod ids;
pub mod span;
pub mod status;
pub mod task;

// Re-export commonly used types
pub use error::CoreError;
pub use event::BackfillEvent;
pub use filter::{FieldType, FilterField, FilterGroup, QueryType, Relation};
pub use ids::{RunId, TaskId, WorkspaceId};
pub use span::{Span, EVALUATOR_CALL_TYPE};
pub use status::{RunStatus, RunType, TaskStatus, TaskType};
pub use task::{
    BackfillDetail, EffectiveTime, PlatformType, RunDetail, Sampler, SpanFilter, SpanListType,
    Task, TaskRule, TaskRun, TimeUnit,
};
