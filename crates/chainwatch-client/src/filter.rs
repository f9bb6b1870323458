//! Client-side event filter.
//!
//! A filter is a conjunction of equality predicates written as
//! `key:value;key:value`. Keys are dotted paths into an event's detail
//! (`bk_host_innerip`, `metadata.label.env`). Values compare against the
//! detail's string form: strings by content, everything else by its JSON
//! rendering, so `bk_host_id:7` matches the number `7`.

use chainwatch_types::WatchEventDetail;
use serde_json::Value;
use thiserror::Error;

/// Errors raised while parsing a filter expression.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FilterError {
    /// A predicate has no `:` separator.
    #[error("predicate {0:?} is not of the form key:value")]
    MissingSeparator(String),

    /// A predicate has an empty key.
    #[error("predicate {0:?} has an empty key")]
    EmptyKey(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Predicate {
    path: Vec<String>,
    expected: String,
}

/// Conjunction of field equality predicates over event details.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventFilter {
    predicates: Vec<Predicate>,
}

impl EventFilter {
    /// Parses `k1:v1;k2:v2`. Empty segments are ignored; the value may
    /// itself contain `:`.
    ///
    /// # Errors
    ///
    /// Returns `FilterError` for a segment without `:` or with an empty key.
    pub fn parse(expr: &str) -> Result<Self, FilterError> {
        let mut predicates = Vec::new();
        for segment in expr.split(';').map(str::trim).filter(|s| !s.is_empty()) {
            let (key, value) = segment
                .split_once(':')
                .ok_or_else(|| FilterError::MissingSeparator(segment.to_string()))?;
            let key = key.trim();
            if key.is_empty() || key.split('.').any(str::is_empty) {
                return Err(FilterError::EmptyKey(segment.to_string()));
            }
            predicates.push(Predicate {
                path: key.split('.').map(str::to_string).collect(),
                expected: value.trim().to_string(),
            });
        }
        Ok(Self { predicates })
    }

    /// Whether the filter accepts everything.
    pub fn is_empty(&self) -> bool {
        self.predicates.is_empty()
    }

    /// Whether `event` satisfies every predicate. Events without a detail
    /// only pass an empty filter.
    pub fn matches(&self, event: &WatchEventDetail) -> bool {
        if self.is_empty() {
            return true;
        }
        let Some(detail) = &event.bk_detail else {
            return false;
        };
        self.predicates.iter().all(|p| {
            lookup(detail, &p.path).is_some_and(|actual| render(actual) == p.expected)
        })
    }
}

fn lookup<'a>(value: &'a Value, path: &[String]) -> Option<&'a Value> {
    path.iter().try_fold(value, |current, key| current.get(key.as_str()))
}

fn render(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
