//! Loose value semantics used by lookups: truthiness, numeric coercion,
//! partial matching, and the ordering used by `sort_by`.

use crate::graph::{Joined, RowRef};
use serde_json::{Map, Value};
use std::cmp::Ordering;

/// Whether a resolved value counts as present. Missing, null, false, 0,
/// NaN and "" are falsy; rows, row lists, arrays and objects are truthy.
pub fn is_truthy(resolved: Option<&Joined<'_>>) -> bool {
    match resolved {
        None => false,
        Some(Joined::Row(_)) | Some(Joined::Rows(_)) => true,
        Some(Joined::Value(value)) => match value {
            Value::Null => false,
            Value::Bool(b) => *b,
            Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0 && !f.is_nan()),
            Value::String(s) => !s.is_empty(),
            Value::Array(_) | Value::Object(_) => true,
        },
    }
}

/// Numeric reading of a resolved value: numbers, numeric strings, and booleans.
pub fn as_number(resolved: &Joined<'_>) -> Option<f64> {
    match resolved.as_value()? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        _ => None,
    }
}

/// Text a pattern can be tested against. Only scalars have one.
pub fn as_text(resolved: &Joined<'_>) -> Option<String> {
    match resolved.as_value()? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Null => Some("null".to_string()),
        _ => None,
    }
}

/// Scalar equality where numbers compare by value (`1` == `1.0`).
pub fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        _ => a == b,
    }
}

/// Does every key of `pattern` match on `row`? Nested objects match
/// partially, arrays match when every pattern element is matched by
/// some element, scalars must be equal.
pub fn row_matches(row: &RowRef<'_>, pattern: &Map<String, Value>) -> bool {
    pattern
        .iter()
        .all(|(key, expected)| match row.get(key) {
            Some(actual) => joined_matches(&actual, expected),
            None => false,
        })
}

fn joined_matches(actual: &Joined<'_>, expected: &Value) -> bool {
    match (actual, expected) {
        (Joined::Row(row), Value::Object(pattern)) => row_matches(row, pattern),
        (Joined::Rows(rows), Value::Array(items)) => items.iter().all(|item| match item {
            Value::Object(pattern) => rows.iter().any(|r| row_matches(r, pattern)),
            _ => false,
        }),
        (Joined::Value(value), _) => value_matches(value, expected),
        _ => false,
    }
}

fn value_matches(actual: &Value, expected: &Value) -> bool {
    match (actual, expected) {
        (Value::Object(map), Value::Object(pattern)) => pattern.iter().all(|(k, v)| {
            map.get(k).is_some_and(|a| value_matches(a, v))
        }),
        (Value::Array(items), Value::Array(pattern)) => pattern
            .iter()
            .all(|p| items.iter().any(|item| value_matches(item, p))),
        _ => values_equal(actual, expected),
    }
}

/// Total order for sorting resolved values: missing first, then
/// booleans, numbers, strings; anything else compares equal.
pub fn compare_for_sort(a: Option<&Joined<'_>>, b: Option<&Joined<'_>>) -> Ordering {
    fn rank(v: Option<&Joined<'_>>) -> u8 {
        match v.and_then(|j| j.as_value()) {
            None | Some(Value::Null) => 0,
            Some(Value::Bool(_)) => 1,
            Some(Value::Number(_)) => 2,
            Some(Value::String(_)) => 3,
            Some(_) => 4,
        }
    }

    let (ra, rb) = (rank(a), rank(b));
    if ra != rb {
        return ra.cmp(&rb);
    }
    match (a.and_then(|j| j.as_value()), b.and_then(|j| j.as_value())) {
        (Some(Value::Bool(x)), Some(Value::Bool(y))) => x.cmp(y),
        (Some(Value::Number(x)), Some(Value::Number(y))) => {
            let (x, y) = (x.as_f64().unwrap_or(0.0), y.as_f64().unwrap_or(0.0));
            x.partial_cmp(&y).unwrap_or(Ordering::Equal)
        }
        (Some(Value::String(x)), Some(Value::String(y))) => x.cmp(y),
        _ => Ordering::Equal,
    }
}
