//! Trace spans as seen by the automation pipeline.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::WorkspaceId;

/// Call type stamped on spans produced by evaluators themselves. Such spans
/// never feed back into automation tasks.
pub const EVALUATOR_CALL_TYPE: &str = "Evaluator";

/// Tag key carrying the bot identifier of a span.
pub const BOT_ID_TAG: &str = "bot_id";

/// A single recorded unit of work in a trace.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Span {
    pub trace_id: String,
    pub span_id: String,
    /// Empty or `"0"` for root spans.
    pub parent_id: String,
    pub log_id: String,
    pub workspace_id: WorkspaceId,
    pub call_type: String,
    pub span_type: String,
    pub span_name: String,
    /// Unix milliseconds.
    pub start_time: i64,
    /// Microseconds.
    pub duration: i64,
    pub status_code: i32,
    pub input: String,
    pub output: String,
    pub tags_string: HashMap<String, String>,
    pub tags_long: HashMap<String, i64>,
    pub tags_double: HashMap<String, f64>,
    pub tags_bool: HashMap<String, bool>,
}

/// A borrowed value looked up on a span by field name.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FieldValue<'a> {
    Str(&'a str),
    Long(i64),
    Double(f64),
    Bool(bool),
}

impl FieldValue<'_> {
    /// Render the value the way filter values are written.
    pub fn render(&self) -> String {
        match self {
            FieldValue::Str(s) => (*s).to_string(),
            FieldValue::Long(v) => v.to_string(),
            FieldValue::Double(v) => v.to_string(),
            FieldValue::Bool(v) => v.to_string(),
        }
    }

    /// Numeric view of the value, if it has one.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            FieldValue::Str(s) => s.parse().ok(),
            FieldValue::Long(v) => Some(*v as f64),
            FieldValue::Double(v) => Some(*v),
            FieldValue::Bool(_) => None,
        }
    }
}

impl Span {
    /// Create a span with the identifying fields set.
    pub fn new(
        workspace_id: impl Into<WorkspaceId>,
        trace_id: impl Into<String>,
        span_id: impl Into<String>,
        start_time: i64,
    ) -> Self {
        Self {
            workspace_id: workspace_id.into(),
            trace_id: trace_id.into(),
            span_id: span_id.into(),
            start_time,
            ..Default::default()
        }
    }

    /// Builder method to add a string tag.
    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags_string.insert(key.into(), value.into());
        self
    }

    /// Builder method to set the span type.
    pub fn with_span_type(mut self, span_type: impl Into<String>) -> Self {
        self.span_type = span_type.into();
        self
    }

    /// Builder method to set the call type.
    pub fn with_call_type(mut self, call_type: impl Into<String>) -> Self {
        self.call_type = call_type.into();
        self
    }

    /// Bot that produced this span, if tagged.
    pub fn bot_id(&self) -> Option<&str> {
        self.tags_string.get(BOT_ID_TAG).map(String::as_str)
    }

    pub fn is_root(&self) -> bool {
        self.parent_id.is_empty() || self.parent_id == "0"
    }

    /// Spans emitted by evaluators must not trigger automation again.
    pub fn is_evaluator_originated(&self) -> bool {
        self.call_type == EVALUATOR_CALL_TYPE
    }

    /// Look up a column or tag by name. Built-in columns win over tags.
    pub fn field(&self, name: &str) -> Option<FieldValue<'_>> {
        let builtin = match name {
            "trace_id" => Some(FieldValue::Str(&self.trace_id)),
            "span_id" => Some(FieldValue::Str(&self.span_id)),
            "parent_id" => Some(FieldValue::Str(&self.parent_id)),
            "log_id" => Some(FieldValue::Str(&self.log_id)),
            "workspace_id" | "space_id" => Some(FieldValue::Str(self.workspace_id.as_str())),
            "call_type" => Some(FieldValue::Str(&self.call_type)),
            "span_type" => Some(FieldValue::Str(&self.span_type)),
            "span_name" => Some(FieldValue::Str(&self.span_name)),
            "input" => Some(FieldValue::Str(&self.input)),
            "output" => Some(FieldValue::Str(&self.output)),
            "start_time" => Some(FieldValue::Long(self.start_time)),
            "duration" => Some(FieldValue::Long(self.duration)),
            "status_code" => Some(FieldValue::Long(i64::from(self.status_code))),
            _ => None,
        };
        if builtin.is_some() {
            return builtin;
        }
        if let Some(v) = self.tags_string.get(name) {
            return Some(FieldValue::Str(v));
        }
        if let Some(v) = self.tags_long.get(name) {
            return Some(FieldValue::Long(*v));
        }
        if let Some(v) = self.tags_double.get(name) {
            return Some(FieldValue::Double(*v));
        }
        self.tags_bool.get(name).map(|v| FieldValue::Bool(*v))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_field_lookup_prefers_columns() {
        let span = Span::new("ws-1", "t-1", "s-1", 1_000)
            .with_tag("span_type", "shadowed")
            .with_span_type("model");
        assert_eq!(span.field("span_type"), Some(FieldValue::Str("model")));
        assert_eq!(span.field("start_time"), Some(FieldValue::Long(1_000)));
        assert_eq!(span.field("missing"), None);
    }

    #[test]
    fn test_bot_and_root() {
        let span = Span::new("ws-1", "t-1", "s-1", 0).with_tag(BOT_ID_TAG, "bot-7");
        assert_eq!(span.bot_id(), Some("bot-7"));
        assert!(span.is_root());
        assert!(!span.is_evaluator_originated());
        assert!(span.with_call_type("Evaluator").is_evaluator_originated());
    }
}
