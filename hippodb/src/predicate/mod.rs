//! Compiles `(field, criterion)` pairs into row predicates.
//!
//! Text criteria are tried in order: comparison shorthand (`>30`,
//! `<=2.5k`, `!=0`), strict inequality (`!Bob`), pattern match
//! (`^Al`), and finally the empty string, which asks for rows where the
//! field is truthy.

pub mod value;

use crate::error::{HippoDbError, Result};
use crate::graph::RowRef;
use crate::query::SearchOptions;
use regex::RegexBuilder;
use serde_json::{Map, Value};
use std::fmt;
use std::rc::Rc;
use std::sync::OnceLock;

pub use value::{as_number, as_text, compare_for_sort, is_truthy, row_matches, values_equal};

/// A compiled row predicate.
pub type RowFilter = Rc<dyn Fn(&RowRef<'_>) -> bool>;

/// Wrap a closure as a [`RowFilter`].
pub fn filter<F>(f: F) -> RowFilter
where
    F: Fn(&RowRef<'_>) -> bool + 'static,
{
    Rc::new(f)
}

/// Comparison operators accepted by the shorthand and by `count(...)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
}

impl CmpOp {
    pub fn parse(token: &str) -> Option<CmpOp> {
        match token {
            "<" => Some(CmpOp::Lt),
            "<=" => Some(CmpOp::Le),
            ">" => Some(CmpOp::Gt),
            ">=" => Some(CmpOp::Ge),
            "=" | "==" => Some(CmpOp::Eq),
            "!=" => Some(CmpOp::Ne),
            _ => None,
        }
    }

    pub fn apply(&self, lhs: f64, rhs: f64) -> bool {
        match self {
            CmpOp::Lt => lhs < rhs,
            CmpOp::Le => lhs <= rhs,
            CmpOp::Gt => lhs > rhs,
            CmpOp::Ge => lhs >= rhs,
            CmpOp::Eq => lhs == rhs,
            CmpOp::Ne => lhs != rhs,
        }
    }
}

/// The value side of a lookup pair.
#[derive(Clone)]
pub enum Criterion {
    Text(String),
    Number(f64),
    Bool(bool),
    /// Matched partially against the whole row.
    Object(Map<String, Value>),
    /// Every element must hold.
    List(Vec<Criterion>),
    /// Used as the predicate directly; the field is ignored.
    Filter(RowFilter),
}

impl Criterion {
    pub fn filter<F>(f: F) -> Self
    where
        F: Fn(&RowRef<'_>) -> bool + 'static,
    {
        Criterion::Filter(filter(f))
    }
}

impl fmt::Debug for Criterion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Criterion::Text(s) => f.debug_tuple("Text").field(s).finish(),
            Criterion::Number(n) => f.debug_tuple("Number").field(n).finish(),
            Criterion::Bool(b) => f.debug_tuple("Bool").field(b).finish(),
            Criterion::Object(m) => f.debug_tuple("Object").field(m).finish(),
            Criterion::List(items) => f.debug_tuple("List").field(items).finish(),
            Criterion::Filter(_) => f.write_str("Filter(..)"),
        }
    }
}

impl From<Value> for Criterion {
    fn from(value: Value) -> Self {
        match value {
            Value::String(s) => Criterion::Text(s),
            Value::Number(n) => Criterion::Number(n.as_f64().unwrap_or(f64::NAN)),
            Value::Bool(b) => Criterion::Bool(b),
            Value::Array(items) => Criterion::List(items.into_iter().map(Criterion::from).collect()),
            Value::Object(map) => Criterion::Object(map),
            Value::Null => Criterion::Object(Map::new()),
        }
    }
}

impl From<&str> for Criterion {
    fn from(s: &str) -> Self {
        Criterion::Text(s.to_string())
    }
}

impl From<String> for Criterion {
    fn from(s: String) -> Self {
        Criterion::Text(s)
    }
}

impl From<i64> for Criterion {
    fn from(n: i64) -> Self {
        Criterion::Number(n as f64)
    }
}

impl From<f64> for Criterion {
    fn from(n: f64) -> Self {
        Criterion::Number(n)
    }
}

impl From<bool> for Criterion {
    fn from(b: bool) -> Self {
        Criterion::Bool(b)
    }
}

/// `>30`, `<=2.5k`, `!=0`: operator, number, optional magnitude suffix.
fn shorthand_pattern() -> &'static regex::Regex {
    static PATTERN: OnceLock<regex::Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        regex::Regex::new(r"^(<=?|>=?|!=)([0-9]*\.?[0-9]+)([kmbtKMBT])?$")
            .expect("shorthand pattern is valid")
    })
}

fn magnitude(suffix: &str) -> f64 {
    match suffix.to_ascii_lowercase().as_str() {
        "k" => 1e3,
        "m" => 1e6,
        "b" => 1e9,
        "t" => 1e12,
        _ => 1.0,
    }
}

/// Parse comparison shorthand into an operator and a literal.
pub fn parse_shorthand(text: &str) -> Option<(CmpOp, f64)> {
    let caps = shorthand_pattern().captures(text)?;
    let op = CmpOp::parse(caps.get(1)?.as_str())?;
    let number: f64 = caps.get(2)?.as_str().parse().ok()?;
    let scale = caps.get(3).map(|m| magnitude(m.as_str())).unwrap_or(1.0);
    Some((op, number * scale))
}

/// Rows where `field` resolves to something truthy.
pub fn truthy_key(field: &str) -> RowFilter {
    let field = field.to_string();
    filter(move |row| is_truthy(row.resolve(&field).as_ref()))
}

/// Compile one lookup pair. The returned predicates are a conjunction.
pub fn compile(field: &str, criterion: &Criterion, options: &SearchOptions) -> Result<Vec<RowFilter>> {
    let field_owned = field.to_string();

    let predicates = match criterion {
        Criterion::Text(text) => vec![compile_text(field, text, options)?],
        Criterion::Filter(f) => vec![f.clone()],
        Criterion::List(items) => {
            let mut all = Vec::new();
            for item in items {
                all.extend(compile(field, item, options)?);
            }
            all
        }
        Criterion::Bool(true) => vec![truthy_key(field)],
        Criterion::Bool(false) => {
            vec![filter(move |row| !is_truthy(row.resolve(&field_owned).as_ref()))]
        }
        Criterion::Object(pattern) => {
            let pattern = pattern.clone();
            vec![filter(move |row| row_matches(row, &pattern))]
        }
        Criterion::Number(expected) => {
            let expected = *expected;
            vec![filter(move |row| {
                row.resolve(&field_owned)
                    .and_then(|v| v.as_value().and_then(Value::as_f64))
                    .is_some_and(|actual| actual == expected)
            })]
        }
    };

    Ok(predicates)
}

fn compile_text(field: &str, text: &str, options: &SearchOptions) -> Result<RowFilter> {
    let field_owned = field.to_string();

    if let Some((op, literal)) = parse_shorthand(text) {
        return Ok(filter(move |row| {
            match row.resolve(&field_owned).as_ref().and_then(as_number) {
                Some(actual) => op.apply(actual, literal),
                // an unreadable value is only ever "not equal"
                None => op == CmpOp::Ne,
            }
        }));
    }

    if let Some(rest) = text.strip_prefix('!') {
        let rest = rest.to_string();
        return Ok(filter(move |row| {
            match row.resolve(&field_owned).as_ref().and_then(|v| v.as_value()) {
                Some(Value::String(s)) => *s != rest,
                _ => true,
            }
        }));
    }

    if !text.is_empty() {
        let source = if options.exact_match {
            format!("^(?:{text})$")
        } else {
            text.to_string()
        };
        let pattern = RegexBuilder::new(&source)
            .case_insensitive(options.ignore_case)
            .build()
            .map_err(|e| HippoDbError::Lookup(format!("Invalid pattern `{text}` for `{field}`: {e}")))?;
        return Ok(filter(move |row| {
            row.resolve(&field_owned)
                .as_ref()
                .and_then(as_text)
                .is_some_and(|t| pattern.is_match(&t))
        }));
    }

    Ok(truthy_key(field))
}
