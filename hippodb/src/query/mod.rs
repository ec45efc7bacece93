//! Query executor: normalizes lookups, narrows a live table through
//! compiled predicates, and wraps the matches in a [`QueryResult`].

use crate::error::{HippoDbError, Result};
use crate::graph::{JoinGraph, RowKey, RowRef};
use crate::predicate::{self, compare_for_sort, is_truthy, CmpOp, Criterion, RowFilter};
use regex::Regex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::OnceLock;

/// Options applied to a search.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchOptions {
    /// Anchor text patterns at both ends.
    pub exact_match: bool,
    pub ignore_case: bool,
    pub limit: Option<usize>,
    /// Field paths to sort by, most significant first.
    pub sort_by: Vec<String>,
}

impl Default for SearchOptions {
    fn default() -> Self {
        SearchOptions {
            exact_match: false,
            ignore_case: true,
            limit: None,
            sort_by: Vec::new(),
        }
    }
}

impl SearchOptions {
    pub fn exact(mut self) -> Self {
        self.exact_match = true;
        self
    }

    pub fn case_sensitive(mut self) -> Self {
        self.ignore_case = false;
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn with_sort_by(mut self, field: &str) -> Self {
        self.sort_by.push(field.to_string());
        self
    }
}

/// What to look for.
#[derive(Clone, Debug)]
pub enum Lookup {
    /// A row id. `find` uses it directly; `search` treats it as `{id: ..}`.
    Id(RowKey),
    /// `*`, a key name, `!key`, or `count(field)<op><n>`.
    Text(String),
    /// Field/criterion pairs, applied in order.
    Pairs(Vec<(String, Criterion)>),
    Filter(FilterLookup),
}

/// Wrapper so `Lookup` can derive `Debug`.
#[derive(Clone)]
pub struct FilterLookup(pub RowFilter);

impl std::fmt::Debug for FilterLookup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("FilterLookup(..)")
    }
}

impl Lookup {
    pub fn all() -> Self {
        Lookup::Text("*".to_string())
    }

    pub fn filter<F>(f: F) -> Self
    where
        F: Fn(&RowRef<'_>) -> bool + 'static,
    {
        Lookup::Filter(FilterLookup(predicate::filter(f)))
    }

    pub fn pairs<I, K, C>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, C)>,
        K: Into<String>,
        C: Into<Criterion>,
    {
        Lookup::Pairs(
            pairs
                .into_iter()
                .map(|(k, c)| (k.into(), c.into()))
                .collect(),
        )
    }

    /// Read a lookup from JSON: strings are string lookups, integers
    /// ids, objects field/criterion pairs. An array may hold objects
    /// or `[field, criterion]` pairs, which are concatenated.
    pub fn from_json(value: Value) -> Result<Self> {
        match value {
            Value::String(s) => Ok(Lookup::Text(s)),
            Value::Number(n) => n
                .as_i64()
                .map(|id| Lookup::Id(RowKey::Int(id)))
                .ok_or_else(|| HippoDbError::Lookup(format!("Not a row id: {n}"))),
            Value::Object(map) => Ok(Lookup::Pairs(
                map.into_iter().map(|(k, v)| (k, Criterion::from(v))).collect(),
            )),
            Value::Array(items) => {
                let mut pairs = Vec::new();
                for item in items {
                    match item {
                        Value::Object(map) => {
                            pairs.extend(map.into_iter().map(|(k, v)| (k, Criterion::from(v))));
                        }
                        Value::Array(mut pair) if pair.len() == 2 => {
                            let criterion = pair.pop().unwrap_or(Value::Null);
                            match pair.pop() {
                                Some(Value::String(field)) => {
                                    pairs.push((field, Criterion::from(criterion)))
                                }
                                other => {
                                    return Err(HippoDbError::Lookup(format!(
                                        "Lookup pair needs a field name, got {other:?}"
                                    )))
                                }
                            }
                        }
                        other => {
                            return Err(HippoDbError::Lookup(format!(
                                "Unsupported lookup element: {other}"
                            )))
                        }
                    }
                }
                Ok(Lookup::Pairs(pairs))
            }
            other => Err(HippoDbError::Lookup(format!("Unsupported lookup: {other}"))),
        }
    }

    /// `0`, `""` and empty ids count as no lookup at all.
    fn is_falsy(&self) -> bool {
        match self {
            Lookup::Id(RowKey::Int(0)) => true,
            Lookup::Id(RowKey::Str(s)) | Lookup::Text(s) => s.is_empty(),
            _ => false,
        }
    }
}

impl From<&str> for Lookup {
    fn from(s: &str) -> Self {
        Lookup::Text(s.to_string())
    }
}

impl From<String> for Lookup {
    fn from(s: String) -> Self {
        Lookup::Text(s)
    }
}

impl From<i64> for Lookup {
    fn from(id: i64) -> Self {
        Lookup::Id(RowKey::Int(id))
    }
}

impl From<RowKey> for Lookup {
    fn from(id: RowKey) -> Self {
        Lookup::Id(id)
    }
}

impl From<RowFilter> for Lookup {
    fn from(f: RowFilter) -> Self {
        Lookup::Filter(FilterLookup(f))
    }
}

// ── Result view ─────────────────────────────────────────────────

/// Ordered matches of a search.
#[derive(Debug, Clone)]
pub struct QueryResult<'a> {
    rows: Vec<RowRef<'a>>,
    options: SearchOptions,
}

impl<'a> QueryResult<'a> {
    pub fn new(rows: Vec<RowRef<'a>>, options: SearchOptions) -> Self {
        QueryResult { rows, options }
    }

    pub fn first(&self) -> Option<RowRef<'a>> {
        self.rows.first().copied()
    }

    pub fn last(&self) -> Option<RowRef<'a>> {
        self.rows.last().copied()
    }

    pub fn rows(&self) -> &[RowRef<'a>] {
        &self.rows
    }

    pub fn into_rows(self) -> Vec<RowRef<'a>> {
        self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = RowRef<'a>> + '_ {
        self.rows.iter().copied()
    }

    /// Options this view was produced with.
    pub fn options(&self) -> &SearchOptions {
        &self.options
    }

    /// Keep the first `n` rows.
    pub fn limit(mut self, n: usize) -> Self {
        self.rows.truncate(n);
        self.options.limit = Some(n);
        self
    }

    /// Stable sort by one or more field paths.
    pub fn sort_by<S: AsRef<str>>(mut self, fields: &[S]) -> Self {
        self.rows.sort_by(|a, b| {
            fields
                .iter()
                .map(|f| compare_for_sort(a.resolve(f.as_ref()).as_ref(), b.resolve(f.as_ref()).as_ref()))
                .find(|o| o.is_ne())
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        self.options.sort_by = fields.iter().map(|f| f.as_ref().to_string()).collect();
        self
    }

    /// Flat JSON records.
    pub fn to_values(&self) -> Vec<Value> {
        self.rows.iter().map(|r| r.to_value()).collect()
    }

    /// Records with links expanded one level.
    pub fn to_joined_values(&self) -> Vec<Value> {
        self.rows.iter().map(|r| r.to_joined_value()).collect()
    }
}

// ── Execution ───────────────────────────────────────────────────

fn key_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^(!?)([A-Za-z0-9_\-]+)$").expect("key pattern is valid"))
}

fn aggregate_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^([A-Za-z_]+)\(([A-Za-z0-9_\-.]+)\)([<>=]+)([A-Za-z0-9_\-.]+)$")
            .expect("aggregate pattern is valid")
    })
}

/// Run `lookup` against a mounted table.
pub fn execute<'a>(
    graph: &'a JoinGraph,
    table: &str,
    lookup: &Lookup,
    options: &SearchOptions,
) -> Result<QueryResult<'a>> {
    let mut candidates = graph
        .rows(table)
        .ok_or_else(|| HippoDbError::Lookup(format!("Table `{table}` is not mounted")))?;

    match lookup {
        Lookup::Filter(FilterLookup(f)) => candidates.retain(|row| f(row)),
        Lookup::Id(id) => {
            let id = id.clone();
            candidates.retain(|row| *row.id() == id);
        }
        Lookup::Text(text) => narrow_by_text(&mut candidates, text)?,
        Lookup::Pairs(pairs) => {
            for (field, criterion) in pairs {
                for p in predicate::compile(field, criterion, options)? {
                    candidates.retain(|row| p(row));
                }
            }
        }
    }

    let mut result = QueryResult::new(candidates, options.clone());
    if !options.sort_by.is_empty() {
        result = result.sort_by(&options.sort_by);
    }
    if let Some(n) = options.limit {
        result = result.limit(n);
    }
    Ok(result)
}

fn narrow_by_text(candidates: &mut Vec<RowRef<'_>>, text: &str) -> Result<()> {
    if text == "*" {
        return Ok(());
    }

    if let Some(caps) = key_pattern().captures(text) {
        let negate = !caps[1].is_empty();
        let key = &caps[2];
        candidates.retain(|row| is_truthy(row.resolve(key).as_ref()) != negate);
        return Ok(());
    }

    if let Some(caps) = aggregate_pattern().captures(text) {
        let function = &caps[1];
        if function != "count" {
            return Err(HippoDbError::Lookup(format!(
                "Unsupported aggregate `{function}` in `{text}`"
            )));
        }
        let field = &caps[2];
        let op = CmpOp::parse(&caps[3])
            .filter(|op| *op != CmpOp::Ne)
            .ok_or_else(|| HippoDbError::Lookup(format!("Unsupported operator `{}` in `{text}`", &caps[3])))?;
        let operand: f64 = caps[4]
            .parse()
            .map_err(|_| HippoDbError::Lookup(format!("`{}` is not a number in `{text}`", &caps[4])))?;

        let group_of = |row: &RowRef<'_>| -> String {
            match row.resolve(field) {
                Some(value) => value.to_value().to_string(),
                None => String::new(),
            }
        };
        let mut sizes: HashMap<String, usize> = HashMap::new();
        for row in candidates.iter() {
            *sizes.entry(group_of(row)).or_default() += 1;
        }
        candidates.retain(|row| {
            let size = sizes.get(&group_of(row)).copied().unwrap_or(0);
            op.apply(size as f64, operand)
        });
        return Ok(());
    }

    Err(HippoDbError::Lookup(format!("Unrecognized lookup `{text}`")))
}

/// The first row matching `lookup`, or `None`.
///
/// A falsy lookup (`0`, `""`) is an error rather than "no match".
pub fn find<'a>(graph: &'a JoinGraph, table: &str, lookup: &Lookup) -> Result<Option<RowRef<'a>>> {
    if lookup.is_falsy() {
        return Err(HippoDbError::Lookup(format!(
            "find on `{table}` needs a lookup"
        )));
    }
    if !graph.is_mounted(table) {
        return Err(HippoDbError::Lookup(format!("Table `{table}` is not mounted")));
    }
    match lookup {
        Lookup::Id(id) => Ok(graph.row(table, id)),
        _ => Ok(execute(graph, table, lookup, &SearchOptions::default())?.first()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::TableDescriptor;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn mounted(rows: Vec<Value>) -> JoinGraph {
        let mut graph = JoinGraph::new();
        let mut table = TableDescriptor::new("users", "app");
        graph.create_table("users");
        for row in rows {
            let key = graph.join(&mut table, row.as_object().unwrap()).unwrap();
            graph.push_live("users", key);
        }
        graph
    }

    fn users() -> JoinGraph {
        mounted(vec![
            json!({"id": 1, "name": "Alice", "age": 31, "team": "red", "admin": true}),
            json!({"id": 2, "name": "Bob", "age": 25, "team": "blue"}),
            json!({"id": 3, "name": "Carol", "age": 40, "team": "red", "admin": false}),
            json!({"id": 4, "name": "Dan", "age": 25, "team": "green"}),
        ])
    }

    fn ids(result: &QueryResult<'_>) -> Vec<i64> {
        result.iter().filter_map(|r| r.id().as_int()).collect()
    }

    fn search(graph: &JoinGraph, lookup: Lookup) -> Result<Vec<i64>> {
        execute(graph, "users", &lookup, &SearchOptions::default()).map(|r| ids(&r))
    }

    #[test]
    fn test_star_returns_everything_in_order() {
        let graph = users();
        assert_eq!(search(&graph, "*".into()).unwrap(), vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_key_lookups() {
        let graph = users();
        assert_eq!(search(&graph, "admin".into()).unwrap(), vec![1]);
        assert_eq!(search(&graph, "!admin".into()).unwrap(), vec![2, 3, 4]);
    }

    #[test]
    fn test_count_lookup() {
        let graph = users();
        assert_eq!(search(&graph, "count(team)>1".into()).unwrap(), vec![1, 3]);
        assert_eq!(search(&graph, "count(age)=1".into()).unwrap(), vec![1, 3]);
        assert_eq!(search(&graph, "count(team)<=1".into()).unwrap(), vec![2, 4]);
    }

    #[test]
    fn test_malformed_text_lookups_fail() {
        let graph = users();
        for bad in ["count(team)>x", "sum(team)>1", "count(team)=<1", "name = Bob"] {
            let err = search(&graph, bad.into()).unwrap_err();
            assert_eq!(err.kind(), crate::error::ErrorKind::Lookup, "{bad}");
        }
    }

    #[test]
    fn test_pairs_narrow_in_sequence() {
        let graph = users();
        let lookup = Lookup::pairs([("team", Criterion::from("red")), ("age", Criterion::from(">35"))]);
        assert_eq!(search(&graph, lookup).unwrap(), vec![3]);

        let lookup = Lookup::from_json(json!({"age": ">30"})).unwrap();
        assert_eq!(search(&graph, lookup).unwrap(), vec![1, 3]);

        let lookup = Lookup::from_json(json!([{"team": "red"}, ["name", "!Alice"]])).unwrap();
        assert_eq!(search(&graph, lookup).unwrap(), vec![3]);
    }

    #[test]
    fn test_filter_lookup() {
        let graph = users();
        let lookup = Lookup::filter(|row| row.data().get("age") == Some(&json!(25)));
        assert_eq!(search(&graph, lookup).unwrap(), vec![2, 4]);
    }

    #[test]
    fn test_sort_and_limit() {
        let graph = users();
        let result = execute(&graph, "users", &Lookup::all(), &SearchOptions::default()).unwrap();
        let sorted = result.sort_by(&["age", "name"]);
        assert_eq!(ids(&sorted), vec![2, 4, 1, 3]);
        assert_eq!(sorted.first().unwrap().id(), &RowKey::Int(2));
        assert_eq!(sorted.last().unwrap().id(), &RowKey::Int(3));

        let limited = sorted.limit(2);
        assert_eq!(ids(&limited), vec![2, 4]);
        assert_eq!(limited.options().limit, Some(2));

        let options = SearchOptions::default().with_sort_by("team").with_limit(3);
        let result = execute(&graph, "users", &Lookup::all(), &options).unwrap();
        assert_eq!(ids(&result), vec![2, 4, 1]);
    }

    #[test]
    fn test_unmounted_table_is_lookup_error() {
        let graph = users();
        let err = execute(&graph, "orders", &Lookup::all(), &SearchOptions::default()).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Lookup);
    }

    #[test]
    fn test_find() {
        let graph = users();
        let by_id = find(&graph, "users", &Lookup::from(2_i64)).unwrap().unwrap();
        assert_eq!(by_id.data()["name"], json!("Bob"));
        assert!(find(&graph, "users", &Lookup::from(99_i64)).unwrap().is_none());

        let by_pairs = find(&graph, "users", &Lookup::pairs([("name", "^car")])).unwrap();
        assert_eq!(by_pairs.unwrap().id(), &RowKey::Int(3));

        assert!(find(&graph, "users", &Lookup::from(0_i64)).is_err());
        assert!(find(&graph, "users", &"".into()).is_err());
    }
}
