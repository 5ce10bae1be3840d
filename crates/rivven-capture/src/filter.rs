//! Filter chain for change events
//!
//! Filters are global: every source's events run through the same chain.
//!
//! - **Inclusion** filters (`include: true`) reject events they do not match
//! - **Exclusion** filters (`include: false`) reject events they do match
//! - Evaluation order is priority descending, ties by insertion order
//!
//! Because every enabled filter must pass, the accept/reject outcome does not
//! depend on ordering; ordering only decides which filter is blamed.
//!
//! # Example
//!
//! ```rust
//! use rivven_capture::{Filter, FilterChain, FilterCondition, FilterKind};
//!
//! let chain = FilterChain::new();
//! chain
//!     .add(
//!         Filter::new("no-audit", FilterKind::Table, FilterCondition::Tables(vec!["audit_*".into()]))
//!             .exclude()
//!             .with_priority(10),
//!     )
//!     .unwrap();
//! ```

use crate::error::{CaptureError, Result};
use crate::event::{ChangeEvent, EventKind};
use parking_lot::RwLock;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

/// What a filter inspects
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterKind {
    Table,
    Column,
    Condition,
    EventKind,
    Custom,
}

/// Comparison operator of a field condition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompareOp {
    Equals,
    NotEquals,
    Greater,
    Less,
    In,
    NotIn,
}

/// `{field, op, value}` test against the row images.
///
/// `field` may be a dotted path into nested objects.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldCondition {
    pub field: String,
    pub op: CompareOp,
    pub value: Value,
}

impl FieldCondition {
    pub fn new(field: impl Into<String>, op: CompareOp, value: Value) -> Self {
        Self {
            field: field.into(),
            op,
            value,
        }
    }

    fn holds(&self, event: &ChangeEvent) -> bool {
        let found = [event.after.as_ref(), event.before.as_ref()]
            .into_iter()
            .flatten()
            .find_map(|image| lookup(image, &self.field));

        match (self.op, found) {
            (CompareOp::Equals, Some(v)) => values_equal(v, &self.value),
            (CompareOp::NotEquals, Some(v)) => !values_equal(v, &self.value),
            (CompareOp::NotEquals, None) => true,
            (CompareOp::Greater, Some(v)) => compare(v, &self.value) == Some(Ordering::Greater),
            (CompareOp::Less, Some(v)) => compare(v, &self.value) == Some(Ordering::Less),
            (CompareOp::In, Some(v)) => self
                .value
                .as_array()
                .is_some_and(|items| items.iter().any(|i| values_equal(v, i))),
            (CompareOp::NotIn, Some(v)) => self
                .value
                .as_array()
                .is_some_and(|items| !items.iter().any(|i| values_equal(v, i))),
            (CompareOp::NotIn, None) => true,
            (_, None) => false,
        }
    }
}

fn lookup<'a>(image: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(image, |v, key| v.get(key))
}

fn values_equal(a: &Value, b: &Value) -> bool {
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) if a.is_number() && b.is_number() => x == y,
        _ => a == b,
    }
}

fn compare(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

/// Arbitrary event predicate.
#[derive(Clone)]
pub struct CustomPredicate(Arc<dyn Fn(&ChangeEvent) -> bool + Send + Sync>);

impl CustomPredicate {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&ChangeEvent) -> bool + Send + Sync + 'static,
    {
        Self(Arc::new(f))
    }

    pub fn matches(&self, event: &ChangeEvent) -> bool {
        (self.0)(event)
    }
}

impl fmt::Debug for CustomPredicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("CustomPredicate")
    }
}

/// Filter condition, one variant per [`FilterKind`]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterCondition {
    /// Table names or glob patterns, matched against `table` and `database.table`
    Tables(Vec<String>),
    /// Columns that must all be present in the row image
    Columns(Vec<String>),
    /// Field comparisons that must all hold
    Fields(Vec<FieldCondition>),
    /// Event kinds
    EventKinds(Vec<EventKind>),
    /// Code-only predicate; not loadable from configuration
    #[serde(skip)]
    Custom(CustomPredicate),
}

impl FilterCondition {
    pub fn kind(&self) -> FilterKind {
        match self {
            Self::Tables(_) => FilterKind::Table,
            Self::Columns(_) => FilterKind::Column,
            Self::Fields(_) => FilterKind::Condition,
            Self::EventKinds(_) => FilterKind::EventKind,
            Self::Custom(_) => FilterKind::Custom,
        }
    }

    pub fn custom<F>(f: F) -> Self
    where
        F: Fn(&ChangeEvent) -> bool + Send + Sync + 'static,
    {
        Self::Custom(CustomPredicate::new(f))
    }
}

fn default_true() -> bool {
    true
}

/// A filter definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Filter {
    pub id: String,
    pub kind: FilterKind,
    pub condition: FilterCondition,
    /// `true`: keep only matching events. `false`: drop matching events.
    #[serde(default = "default_true")]
    pub include: bool,
    #[serde(default)]
    pub priority: i32,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl Filter {
    /// Create an enabled inclusion filter with priority 0.
    pub fn new(id: impl Into<String>, kind: FilterKind, condition: FilterCondition) -> Self {
        Self {
            id: id.into(),
            kind,
            condition,
            include: true,
            priority: 0,
            enabled: true,
            description: None,
        }
    }

    /// Turn this into an exclusion filter.
    pub fn exclude(mut self) -> Self {
        self.include = false;
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Check the filter is well-formed.
    pub fn validate(&self) -> Result<()> {
        self.compile().map(|_| ())
    }

    fn compile(&self) -> Result<Vec<Regex>> {
        let invalid = |reason: String| CaptureError::invalid_filter(&self.id, reason);

        if self.id.trim().is_empty() {
            return Err(invalid("id must not be empty".into()));
        }
        if self.condition.kind() != self.kind {
            return Err(invalid(format!(
                "condition is a {:?} condition but filter kind is {:?}",
                self.condition.kind(),
                self.kind
            )));
        }

        match &self.condition {
            FilterCondition::Tables(tables) => {
                if tables.is_empty() {
                    return Err(invalid("table list is empty".into()));
                }
                tables
                    .iter()
                    .map(|p| {
                        if p.is_empty() {
                            return Err(invalid("empty table pattern".into()));
                        }
                        glob_to_regex(p)
                            .map_err(|e| invalid(format!("bad table pattern '{}': {}", p, e)))
                    })
                    .collect()
            }
            FilterCondition::Columns(columns) => {
                if columns.is_empty() {
                    return Err(invalid("column list is empty".into()));
                }
                Ok(Vec::new())
            }
            FilterCondition::Fields(conditions) => {
                if conditions.is_empty() {
                    return Err(invalid("condition list is empty".into()));
                }
                for c in conditions {
                    if c.field.is_empty() {
                        return Err(invalid("condition field is empty".into()));
                    }
                    if matches!(c.op, CompareOp::In | CompareOp::NotIn) && !c.value.is_array() {
                        return Err(invalid(format!(
                            "'{:?}' on '{}' requires an array value",
                            c.op, c.field
                        )));
                    }
                }
                Ok(Vec::new())
            }
            FilterCondition::EventKinds(kinds) => {
                if kinds.is_empty() {
                    return Err(invalid("event kind list is empty".into()));
                }
                Ok(Vec::new())
            }
            FilterCondition::Custom(_) => Ok(Vec::new()),
        }
    }
}

/// Convert a glob pattern to regex
fn glob_to_regex(pattern: &str) -> std::result::Result<Regex, regex::Error> {
    let escaped = regex::escape(pattern);
    let regex_pattern = escaped.replace(r"\*", ".*").replace(r"\?", ".");
    Regex::new(&format!("^{}$", regex_pattern))
}

/// Outcome of running an event through the chain
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilterDecision {
    Accept,
    Reject { filter_id: String },
}

impl FilterDecision {
    pub fn is_accept(&self) -> bool {
        matches!(self, Self::Accept)
    }
}

#[derive(Clone)]
struct CompiledFilter {
    filter: Filter,
    seq: u64,
    table_patterns: Vec<Regex>,
}

impl CompiledFilter {
    fn matches(&self, event: &ChangeEvent) -> bool {
        match &self.filter.condition {
            FilterCondition::Tables(_) => {
                let Some(table) = event.table.as_deref() else {
                    return false;
                };
                let qualified = event.database.as_deref().map(|db| format!("{}.{}", db, table));
                self.table_patterns.iter().any(|p| {
                    p.is_match(table) || qualified.as_deref().is_some_and(|q| p.is_match(q))
                })
            }
            FilterCondition::Columns(columns) => event
                .row()
                .and_then(Value::as_object)
                .is_some_and(|row| columns.iter().all(|c| row.contains_key(c))),
            FilterCondition::Fields(conditions) => conditions.iter().all(|c| c.holds(event)),
            FilterCondition::EventKinds(kinds) => kinds.contains(&event.kind),
            FilterCondition::Custom(predicate) => predicate.matches(event),
        }
    }
}

#[derive(Default)]
struct ChainState {
    filters: Arc<Vec<CompiledFilter>>,
    next_seq: u64,
}

/// Ordered, copy-on-write filter registry.
///
/// Evaluation works on an `Arc` snapshot, so admin changes never block or
/// disturb an in-flight evaluation.
#[derive(Default)]
pub struct FilterChain {
    state: RwLock<ChainState>,
}

impl FilterChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a filter. Fails on invalid definitions or duplicate ids.
    pub fn add(&self, filter: Filter) -> Result<()> {
        let table_patterns = filter.compile()?;

        let mut state = self.state.write();
        if state.filters.iter().any(|f| f.filter.id == filter.id) {
            return Err(CaptureError::DuplicateFilter(filter.id));
        }

        let seq = state.next_seq;
        state.next_seq += 1;

        let mut next: Vec<CompiledFilter> = state.filters.as_ref().clone();
        next.push(CompiledFilter {
            filter,
            seq,
            table_patterns,
        });
        next.sort_by(|a, b| {
            b.filter
                .priority
                .cmp(&a.filter.priority)
                .then(a.seq.cmp(&b.seq))
        });
        state.filters = Arc::new(next);
        Ok(())
    }

    /// Unregister a filter, returning its definition.
    pub fn remove(&self, id: &str) -> Result<Filter> {
        let mut state = self.state.write();
        let Some(idx) = state.filters.iter().position(|f| f.filter.id == id) else {
            return Err(CaptureError::UnknownFilter(id.to_string()));
        };

        let mut next: Vec<CompiledFilter> = state.filters.as_ref().clone();
        let removed = next.remove(idx);
        state.filters = Arc::new(next);
        Ok(removed.filter)
    }

    /// Filter definitions in evaluation order.
    pub fn list(&self) -> Vec<Filter> {
        self.snapshot().iter().map(|f| f.filter.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn snapshot(&self) -> Arc<Vec<CompiledFilter>> {
        self.state.read().filters.clone()
    }

    /// Run `event` through every enabled filter.
    pub fn evaluate(&self, event: &ChangeEvent) -> FilterDecision {
        for compiled in self.snapshot().iter() {
            if !compiled.filter.enabled {
                continue;
            }
            if compiled.matches(event) != compiled.filter.include {
                return FilterDecision::Reject {
                    filter_id: compiled.filter.id.clone(),
                };
            }
        }
        FilterDecision::Accept
    }
}

impl fmt::Debug for FilterChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FilterChain")
            .field("filters", &self.list().iter().map(|f| &f.id).collect::<Vec<_>>())
            .finish()
    }
}
