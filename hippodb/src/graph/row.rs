use super::JoinGraph;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;

/// A row id. Numeric ids are the norm; string ids are kept as-is.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RowKey {
    Int(i64),
    Str(String),
}

impl RowKey {
    /// Read a row id from a JSON value. Integral floats count as integers;
    /// anything that is not a number or string is not an id.
    pub fn from_value(value: &Value) -> Option<RowKey> {
        match value {
            Value::Number(n) => n.as_i64().map(RowKey::Int).or_else(|| {
                n.as_f64()
                    .filter(|f| f.fract() == 0.0 && f.abs() < i64::MAX as f64)
                    .map(|f| RowKey::Int(f as i64))
            }),
            Value::String(s) => Some(RowKey::Str(s.clone())),
            _ => None,
        }
    }

    pub fn to_value(&self) -> Value {
        match self {
            RowKey::Int(n) => Value::from(*n),
            RowKey::Str(s) => Value::String(s.clone()),
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            RowKey::Int(n) => Some(*n),
            RowKey::Str(_) => None,
        }
    }
}

impl From<i64> for RowKey {
    fn from(n: i64) -> Self {
        RowKey::Int(n)
    }
}

impl From<&str> for RowKey {
    fn from(s: &str) -> Self {
        RowKey::Str(s.to_string())
    }
}

impl fmt::Display for RowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RowKey::Int(n) => write!(f, "{n}"),
            RowKey::Str(s) => write!(f, "{s:?}"),
        }
    }
}

/// A reference from one row to a row of another table.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Link {
    pub table: String,
    pub key: RowKey,
}

/// A joined row as stored in the join index.
///
/// `data` is the flat record. Resolved foreign keys live in `links`
/// (keyed by the column stem, `user_id` -> `user`), resolved id arrays in
/// `lists` (keyed by the column, which is also the target table id), and
/// reverse pointers in `back_refs` (keyed by the referencing table id).
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    pub(crate) table: String,
    pub(crate) id: RowKey,
    pub(crate) data: Map<String, Value>,
    pub(crate) links: BTreeMap<String, Link>,
    pub(crate) lists: BTreeMap<String, Vec<RowKey>>,
    pub(crate) back_refs: BTreeMap<String, Vec<RowKey>>,
}

impl Row {
    pub(crate) fn new(table: &str, id: RowKey, data: Map<String, Value>) -> Self {
        Row {
            table: table.to_string(),
            id,
            data,
            links: BTreeMap::new(),
            lists: BTreeMap::new(),
            back_refs: BTreeMap::new(),
        }
    }

    pub fn id(&self) -> &RowKey {
        &self.id
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn data(&self) -> &Map<String, Value> {
        &self.data
    }

    pub fn links(&self) -> &BTreeMap<String, Link> {
        &self.links
    }

    pub fn lists(&self) -> &BTreeMap<String, Vec<RowKey>> {
        &self.lists
    }

    pub fn back_refs(&self) -> &BTreeMap<String, Vec<RowKey>> {
        &self.back_refs
    }

    /// Record that `key` in `table` references this row. No-op if already recorded.
    pub(crate) fn add_back_ref(&mut self, table: &str, key: &RowKey) {
        let bucket = self.back_refs.entry(table.to_string()).or_default();
        if !bucket.contains(key) {
            bucket.push(key.clone());
        }
    }

    pub(crate) fn remove_back_ref(&mut self, table: &str, key: &RowKey) {
        if let Some(bucket) = self.back_refs.get_mut(table) {
            bucket.retain(|k| k != key);
            if bucket.is_empty() {
                self.back_refs.remove(table);
            }
        }
    }
}

/// What a key or path on a joined row resolves to.
#[derive(Debug, Clone)]
pub enum Joined<'a> {
    Value(&'a Value),
    Row(RowRef<'a>),
    Rows(Vec<RowRef<'a>>),
}

impl<'a> Joined<'a> {
    pub fn as_value(&self) -> Option<&'a Value> {
        match self {
            Joined::Value(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_row(&self) -> Option<RowRef<'a>> {
        match self {
            Joined::Row(r) => Some(*r),
            _ => None,
        }
    }

    pub fn as_rows(&self) -> Option<&[RowRef<'a>]> {
        match self {
            Joined::Rows(rows) => Some(rows),
            _ => None,
        }
    }

    /// Step one path segment further.
    fn step(&self, segment: &str) -> Option<Joined<'a>> {
        match self {
            Joined::Row(row) => row.get(segment),
            Joined::Rows(rows) => segment
                .parse::<usize>()
                .ok()
                .and_then(|i| rows.get(i))
                .map(|r| Joined::Row(*r)),
            Joined::Value(value) => {
                let value: &'a Value = *value;
                match value {
                    Value::Object(map) => map.get(segment).map(Joined::Value),
                    Value::Array(items) => segment
                        .parse::<usize>()
                        .ok()
                        .and_then(|i| items.get(i))
                        .map(Joined::Value),
                    _ => None,
                }
            }
        }
    }

    /// Flat JSON rendering; rows render as their data only.
    pub fn to_value(&self) -> Value {
        match self {
            Joined::Value(v) => (*v).clone(),
            Joined::Row(r) => r.to_value(),
            Joined::Rows(rows) => Value::Array(rows.iter().map(|r| r.to_value()).collect()),
        }
    }
}

/// A borrowed view of one joined row. Cheap to copy.
#[derive(Clone, Copy)]
pub struct RowRef<'a> {
    pub(crate) graph: &'a JoinGraph,
    pub(crate) row: &'a Row,
}

impl<'a> RowRef<'a> {
    pub fn id(&self) -> &'a RowKey {
        &self.row.id
    }

    pub fn table(&self) -> &'a str {
        &self.row.table
    }

    pub fn data(&self) -> &'a Map<String, Value> {
        &self.row.data
    }

    pub fn row(&self) -> &'a Row {
        self.row
    }

    /// Both views point at the same stored row.
    pub fn same_row(&self, other: &RowRef<'_>) -> bool {
        std::ptr::eq(self.row, other.row)
    }

    /// Look up one key: a linked row, a resolved id array, a plain field,
    /// or a back-reference bucket, in that order.
    pub fn get(&self, key: &str) -> Option<Joined<'a>> {
        if let Some(linked) = self.linked(key) {
            return Some(Joined::Row(linked));
        }
        if let Some(keys) = self.row.lists.get(key) {
            return Some(Joined::Rows(self.graph.resolve_keys(key, keys)));
        }
        if let Some(value) = self.row.data.get(key) {
            return Some(Joined::Value(value));
        }
        if self.row.back_refs.contains_key(key) {
            return Some(Joined::Rows(self.back_refs(key)));
        }
        None
    }

    /// Resolve a dot-separated path, following links. Stops at the first missing segment.
    pub fn resolve(&self, path: &str) -> Option<Joined<'a>> {
        let mut segments = path.split('.');
        let first = segments.next()?;
        let mut current = self.get(first)?;
        for segment in segments {
            current = current.step(segment)?;
        }
        Some(current)
    }

    /// The row a foreign key stem points at, if it resolved.
    pub fn linked(&self, stem: &str) -> Option<RowRef<'a>> {
        let link = self.row.links.get(stem)?;
        self.graph.row(&link.table, &link.key)
    }

    /// Rows of `table` that reference this row.
    pub fn back_refs(&self, table: &str) -> Vec<RowRef<'a>> {
        match self.row.back_refs.get(table) {
            Some(keys) => self.graph.resolve_keys(table, keys),
            None => Vec::new(),
        }
    }

    /// The flat record.
    pub fn to_value(&self) -> Value {
        Value::Object(self.row.data.clone())
    }

    /// The flat record with links and resolved id arrays expanded one level.
    pub fn to_joined_value(&self) -> Value {
        let mut map = self.row.data.clone();
        for stem in self.row.links.keys() {
            if let Some(linked) = self.linked(stem) {
                map.insert(stem.clone(), linked.to_value());
            }
        }
        for (column, keys) in &self.row.lists {
            let rows = self.graph.resolve_keys(column, keys);
            map.insert(
                column.clone(),
                Value::Array(rows.iter().map(|r| r.to_value()).collect()),
            );
        }
        Value::Object(map)
    }
}

impl fmt::Debug for RowRef<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RowRef")
            .field("table", &self.row.table)
            .field("id", &self.row.id)
            .field("data", &self.row.data)
            .finish()
    }
}
