//! Structured span predicates.
//!
//! A task's filter rule compiles into a [`FilterGroup`] tree. The same tree is
//! evaluated in-process against live spans and handed to the historical span
//! query during backfill, so evaluation here must agree with what a storage
//! backend would return for the same predicate.

use serde::{Deserialize, Serialize};

use crate::span::{FieldValue, Span};
use crate::CoreError;

/// How the members of a group combine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Relation {
    #[default]
    And,
    Or,
}

/// Declared type of the field a predicate looks at.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    #[default]
    String,
    Long,
    Double,
    Bool,
}

impl FieldType {
    fn is_numeric(&self) -> bool {
        matches!(self, Self::Long | Self::Double)
    }
}

/// Comparison applied by a single predicate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryType {
    Eq,
    NotEq,
    In,
    NotIn,
    Match,
    NotMatch,
    Gt,
    Gte,
    Lt,
    Lte,
    Exist,
    NotExist,
    AlwaysTrue,
}

/// One predicate, optionally carrying a nested group.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FilterField {
    /// Empty when the field only wraps `sub_filter`.
    #[serde(default)]
    pub field_name: String,
    #[serde(default)]
    pub field_type: FieldType,
    #[serde(default)]
    pub query_type: Option<QueryType>,
    #[serde(default)]
    pub values: Vec<String>,
    #[serde(default)]
    pub sub_filter: Option<Box<FilterGroup>>,
}

/// A list of predicates joined by one relation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FilterGroup {
    #[serde(default)]
    pub relation: Relation,
    #[serde(default)]
    pub fields: Vec<FilterField>,
}

impl FilterField {
    /// Create a leaf predicate.
    pub fn new(
        field_name: impl Into<String>,
        field_type: FieldType,
        query_type: QueryType,
        values: Vec<String>,
    ) -> Self {
        Self {
            field_name: field_name.into(),
            field_type,
            query_type: Some(query_type),
            values,
            sub_filter: None,
        }
    }

    /// Shorthand for a string equality predicate.
    pub fn eq(field_name: impl Into<String>, value: impl Into<String>) -> Self {
        Self::new(field_name, FieldType::String, QueryType::Eq, vec![value.into()])
    }

    /// Shorthand for a string membership predicate.
    pub fn in_values<I, S>(field_name: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(
            field_name,
            FieldType::String,
            QueryType::In,
            values.into_iter().map(Into::into).collect(),
        )
    }

    /// Wrap a whole group as a member of another group.
    pub fn group(sub_filter: FilterGroup) -> Self {
        Self {
            sub_filter: Some(Box::new(sub_filter)),
            ..Default::default()
        }
    }

    fn validate(&self) -> Result<(), CoreError> {
        if let Some(sub) = &self.sub_filter {
            sub.validate()?;
        }
        if self.field_name.is_empty() {
            if self.sub_filter.is_none() {
                return Err(self.invalid("predicate has neither a field nor a sub filter"));
            }
            return Ok(());
        }
        let query_type = self
            .query_type
            .ok_or_else(|| self.invalid("missing query type"))?;
        match query_type {
            QueryType::Match | QueryType::NotMatch if self.field_type != FieldType::String => {
                Err(self.invalid("match queries only apply to string fields"))
            }
            QueryType::Eq | QueryType::NotEq | QueryType::In | QueryType::Match
                if self.values.is_empty() =>
            {
                Err(self.invalid("query requires at least one value"))
            }
            QueryType::Gt | QueryType::Gte | QueryType::Lt | QueryType::Lte => {
                if !self.field_type.is_numeric() {
                    return Err(self.invalid("range queries need a numeric field"));
                }
                match self.values.first() {
                    Some(v) if v.parse::<f64>().is_ok() => Ok(()),
                    _ => Err(self.invalid("range queries need one numeric value")),
                }
            }
            _ => Ok(()),
        }
    }

    fn invalid(&self, reason: &str) -> CoreError {
        CoreError::InvalidFilter {
            field: self.field_name.clone(),
            reason: reason.to_string(),
        }
    }

    /// Evaluate this predicate (and its nested group) against a span.
    pub fn satisfied(&self, span: &Span) -> bool {
        let own = if self.field_name.is_empty() {
            true
        } else {
            self.leaf_satisfied(span.field(&self.field_name))
        };
        own && self.sub_filter.as_ref().map_or(true, |sub| sub.satisfied(span))
    }

    fn leaf_satisfied(&self, value: Option<FieldValue<'_>>) -> bool {
        let Some(query_type) = self.query_type else {
            return false;
        };
        match query_type {
            QueryType::AlwaysTrue => true,
            QueryType::Exist => value.is_some(),
            QueryType::NotExist => value.is_none(),
            QueryType::Eq => value.is_some_and(|v| self.values.iter().any(|e| self.equals(&v, e))),
            QueryType::NotEq => value.map_or(true, |v| !self.values.iter().any(|e| self.equals(&v, e))),
            QueryType::In => value.is_some_and(|v| self.values.iter().any(|e| self.equals(&v, e))),
            QueryType::NotIn => {
                self.values.is_empty()
                    || value.map_or(true, |v| !self.values.iter().any(|e| self.equals(&v, e)))
            }
            QueryType::Match => value.is_some_and(|v| {
                let rendered = v.render();
                self.values.iter().any(|e| rendered.contains(e.as_str()))
            }),
            QueryType::NotMatch => {
                self.values.is_empty()
                    || value.map_or(true, |v| {
                        let rendered = v.render();
                        !self.values.iter().any(|e| rendered.contains(e.as_str()))
                    })
            }
            QueryType::Gt | QueryType::Gte | QueryType::Lt | QueryType::Lte => {
                let (Some(actual), Some(bound)) = (
                    value.and_then(|v| v.as_f64()),
                    self.values.first().and_then(|b| b.parse::<f64>().ok()),
                ) else {
                    return false;
                };
                match query_type {
                    QueryType::Gt => actual > bound,
                    QueryType::Gte => actual >= bound,
                    QueryType::Lt => actual < bound,
                    _ => actual <= bound,
                }
            }
        }
    }

    fn equals(&self, value: &FieldValue<'_>, expected: &str) -> bool {
        if self.field_type.is_numeric() {
            if let (Some(a), Ok(b)) = (value.as_f64(), expected.parse::<f64>()) {
                return a == b;
            }
        }
        value.render() == expected
    }
}

impl FilterGroup {
    /// Group with AND semantics.
    pub fn and(fields: Vec<FilterField>) -> Self {
        Self {
            relation: Relation::And,
            fields,
        }
    }

    /// Group with OR semantics.
    pub fn or(fields: Vec<FilterField>) -> Self {
        Self {
            relation: Relation::Or,
            fields,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Check the tree is well-formed before it is persisted or evaluated.
    pub fn validate(&self) -> Result<(), CoreError> {
        self.fields.iter().try_for_each(FilterField::validate)
    }

    /// Evaluate the tree. An empty group matches everything.
    pub fn satisfied(&self, span: &Span) -> bool {
        if self.fields.is_empty() {
            return true;
        }
        match self.relation {
            Relation::And => self.fields.iter().all(|f| f.satisfied(span)),
            Relation::Or => self.fields.iter().any(|f| f.satisfied(span)),
        }
    }
}
