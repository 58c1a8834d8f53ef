//! Compiles task rules into predicate trees.

use tracehub_core::{FilterField, FilterGroup, PlatformType, SpanListType, Task};

/// Span types counted as model calls.
const LLM_SPAN_TYPES: [&str; 2] = ["model", "LLMCall"];

/// Turns a task's filter rule into the tree evaluated against spans.
pub trait FilterBuilder: Send + Sync {
    fn build(&self, task: &Task) -> FilterGroup;

    /// Storage tenants holding spans of `platform`.
    fn tenants(&self, platform: PlatformType) -> Vec<String>;
}

/// Workspace scope AND span-list predicate AND the task's own predicates.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultFilterBuilder;

impl FilterBuilder for DefaultFilterBuilder {
    fn build(&self, task: &Task) -> FilterGroup {
        let span_filter = &task.rule.span_filter;
        let mut fields = vec![FilterField::eq("workspace_id", task.workspace_id.as_str())];

        match span_filter.span_list_type {
            SpanListType::RootSpan => fields.push(FilterField::in_values("parent_id", ["", "0"])),
            SpanListType::LlmSpan => fields.push(FilterField::in_values("span_type", LLM_SPAN_TYPES)),
            SpanListType::AllSpan => {}
        }

        if !span_filter.filters.is_empty() {
            fields.push(FilterField::group(span_filter.filters.clone()));
        }
        FilterGroup::and(fields)
    }

    fn tenants(&self, platform: PlatformType) -> Vec<String> {
        let tenant = match platform {
            PlatformType::Cozeloop => "cozeloop",
            PlatformType::Prompt => "prompt",
            PlatformType::Evaluator => "evaluator",
            PlatformType::Workflow => "workflow",
        };
        vec![tenant.to_string()]
    }
}
