//! Historical span query interface.

use async_trait::async_trait;

use tracehub_core::{FilterGroup, Span};

use crate::EngineError;

/// Parameters of one page request.
#[derive(Debug, Clone, Default)]
pub struct ListSpansParam {
    /// Storage tenants the platform maps to.
    pub tenants: Vec<String>,
    pub filters: FilterGroup,
    /// Inclusive lower bound on span start time (ms).
    pub start_at: i64,
    /// Exclusive upper bound on span start time (ms).
    pub end_at: i64,
    pub limit: usize,
    pub desc_by_start_time: bool,
    /// Resume point returned by the previous page.
    pub page_token: Option<String>,
}

/// One page of spans.
#[derive(Debug, Clone, Default)]
pub struct SpanPage {
    pub spans: Vec<Span>,
    pub has_more: bool,
    /// Token fetching the page after this one.
    pub page_token: Option<String>,
}

/// Paginated access to stored spans.
#[async_trait]
pub trait SpanQuery: Send + Sync {
    async fn list_spans(&self, param: &ListSpansParam) -> Result<SpanPage, EngineError>;
}
