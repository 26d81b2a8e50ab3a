//! The document predicate language accepted by the record store. Filters are
//! mapping-encoded: each key names a (possibly dotted) path, each value is
//! either a literal to compare for equality or an operator object such as
//! `{"$gt": 5}`. `$and` / `$or` take lists of sub-filters.
//!
//! The same surface is evaluated in-process by the memory store and translated
//! to SQL by the postgres store, and is what the API accepts as `extra_filter`.

use std::cmp::Ordering;

use serde_json::Value;

use crate::document::{path_get, Document};
use crate::error::{Error, Result};

/// A filter is just a predicate document.
pub type Filter = Document;

/// Build a filter from key/value pairs.
pub fn filter_from(pairs: impl IntoIterator<Item = (&'static str, Value)>) -> Filter {
    pairs
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect()
}

/// Conjoin two filters. Colliding keys are pushed into an `$and` clause so
/// user-supplied predicates cannot overwrite the engine's scoping.
pub fn and(base: Filter, extra: Filter) -> Filter {
    if extra.is_empty() {
        return base;
    }
    let mut out = Filter::new();
    out.insert(
        "$and".to_string(),
        Value::Array(vec![Value::Object(base), Value::Object(extra)]),
    );
    out
}

/// Evaluate a filter against a document.
pub fn matches(filter: &Filter, doc: &Document) -> Result<bool> {
    for (key, condition) in filter {
        let ok = match key.as_str() {
            "$and" => {
                let clauses = sub_filters(key, condition)?;
                let mut all = true;
                for clause in clauses {
                    all &= matches(&clause, doc)?;
                }
                all
            }
            "$or" => {
                let clauses = sub_filters(key, condition)?;
                let mut any = false;
                for clause in clauses {
                    any |= matches(&clause, doc)?;
                }
                any
            }
            path => matches_condition(path_get(doc, path), condition)?,
        };
        if !ok {
            return Ok(false);
        }
    }
    Ok(true)
}

fn sub_filters(key: &str, condition: &Value) -> Result<Vec<Filter>> {
    let list = condition
        .as_array()
        .ok_or_else(|| Error::Validation(format!("{key} expects a list of filters")))?;
    list.iter()
        .map(|clause| {
            clause
                .as_object()
                .cloned()
                .ok_or_else(|| Error::Validation(format!("{key} expects a list of filters")))
        })
        .collect()
}

fn matches_condition(actual: Option<&Value>, condition: &Value) -> Result<bool> {
    match condition {
        Value::Object(ops) if ops.keys().any(|k| k.starts_with('$')) => {
            for (op, operand) in ops {
                if !apply_operator(actual, op, operand)? {
                    return Ok(false);
                }
            }
            Ok(true)
        }
        literal => Ok(actual == Some(literal)),
    }
}

fn apply_operator(actual: Option<&Value>, op: &str, operand: &Value) -> Result<bool> {
    match op {
        "$eq" => Ok(actual == Some(operand)),
        "$ne" => Ok(actual != Some(operand)),
        "$exists" => {
            let wanted = operand.as_bool().unwrap_or(true);
            Ok(actual.is_some() == wanted)
        }
        "$in" | "$nin" => {
            let list = operand
                .as_array()
                .ok_or_else(|| Error::Validation(format!("{op} expects a list")))?;
            let found = actual.is_some_and(|v| list.contains(v));
            Ok(if op == "$in" { found } else { !found })
        }
        "$gt" | "$gte" | "$lt" | "$lte" => {
            let Some(actual) = actual else {
                return Ok(false);
            };
            let Some(ordering) = compare_values(actual, operand) else {
                return Ok(false);
            };
            Ok(match op {
                "$gt" => ordering == Ordering::Greater,
                "$gte" => ordering != Ordering::Less,
                "$lt" => ordering == Ordering::Less,
                _ => ordering != Ordering::Greater,
            })
        }
        unknown => Err(Error::Validation(format!(
            "unsupported filter operator {unknown:?}"
        ))),
    }
}

/// Total order over comparable JSON scalars; `None` for mixed or
/// non-comparable types.
pub fn compare_values(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        (Value::Null, Value::Null) => Some(Ordering::Equal),
        _ => None,
    }
}
