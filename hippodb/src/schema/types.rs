use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::OnceLock;

/// Column keys ending in this suffix reference a row in another table.
pub const FOREIGN_KEY_SUFFIX: &str = "_id";

/// Strings longer than this (in characters) are typed as `text`.
const TEXT_THRESHOLD: usize = 150;

/// A schema document: table id -> descriptor.
pub type SchemaDocument = BTreeMap<String, TableDescriptor>;

/// Column type tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ColumnType {
    Id,
    ForeignKey,
    String,
    Text,
    Date,
    Number,
    Boolean,
    Array,
    Object,
}

impl ColumnType {
    /// Infer the type tag of a single column value.
    ///
    /// The column name wins over the value: `id` is always `id` and any
    /// `*_id` column is a foreign key. Everything else is typed from the
    /// value itself. Schema building and insert validation both go
    /// through here so the two can never disagree.
    pub fn infer(column: &str, value: &Value) -> ColumnType {
        if column == "id" {
            return ColumnType::Id;
        }
        if column.ends_with(FOREIGN_KEY_SUFFIX) {
            return ColumnType::ForeignKey;
        }
        match value {
            Value::Array(_) => ColumnType::Array,
            Value::Object(_) | Value::Null => ColumnType::Object,
            Value::String(s) => {
                if s.chars().count() > TEXT_THRESHOLD {
                    ColumnType::Text
                } else if date_pattern().is_match(s) {
                    ColumnType::Date
                } else {
                    ColumnType::String
                }
            }
            Value::Number(_) => ColumnType::Number,
            Value::Bool(_) => ColumnType::Boolean,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ColumnType::Id => "id",
            ColumnType::ForeignKey => "foreign-key",
            ColumnType::String => "string",
            ColumnType::Text => "text",
            ColumnType::Date => "date",
            ColumnType::Number => "number",
            ColumnType::Boolean => "boolean",
            ColumnType::Array => "array",
            ColumnType::Object => "object",
        }
    }
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `2017-03-16`, `3/16/2017`, `16.3.17`, optionally followed by a 12h time like `10:30 pm`.
fn date_pattern() -> &'static regex::Regex {
    static PATTERN: OnceLock<regex::Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        regex::Regex::new(
            r"^(\d{1,4}[.|\\/-]\d{1,2}[.|\\/-]\d{1,4})(\s*(?:0?[1-9]|1[012]):[0-5]\d\s*[ap]m)?$",
        )
        .expect("date pattern is valid")
    })
}

/// Metadata for one table: columns, dependencies, origin, and load state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableDescriptor {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub columns: BTreeMap<String, ColumnType>,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub source: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uri: Option<String>,
    /// Modification marker; only ever compared for equality.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_modified: Option<String>,
    /// Raw rows, once fetched. Kept as a plain value so a malformed
    /// payload is reported at mount time instead of at parse time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rows: Option<Value>,
    #[serde(default)]
    pub loaded: bool,
    #[serde(default)]
    pub ready: bool,
    #[serde(default)]
    pub skip: bool,
    #[serde(default, rename = "rowCount")]
    pub row_count: usize,
}

impl TableDescriptor {
    /// An empty descriptor with the given id and source.
    pub fn new(id: &str, source: &str) -> Self {
        TableDescriptor {
            id: id.to_string(),
            name: display_name(id),
            columns: BTreeMap::new(),
            dependencies: Vec::new(),
            source: source.to_string(),
            uri: None,
            last_modified: None,
            rows: None,
            loaded: false,
            ready: false,
            skip: false,
            row_count: 0,
        }
    }

    /// Build a descriptor straight from raw rows, inferring its columns.
    pub fn from_rows(id: &str, source: &str, rows: Vec<Value>) -> Self {
        let mut descriptor = TableDescriptor::new(id, source);
        descriptor.columns = infer_columns(&rows);
        descriptor.rows = Some(Value::Array(rows));
        descriptor
    }

    pub fn with_uri(mut self, uri: &str) -> Self {
        self.uri = Some(uri.to_string());
        self
    }

    pub fn with_last_modified(mut self, marker: &str) -> Self {
        self.last_modified = Some(marker.to_string());
        self
    }

    pub fn with_dependencies(mut self, dependencies: &[&str]) -> Self {
        self.dependencies = dependencies.iter().map(|d| d.to_string()).collect();
        self
    }

    pub fn has_rows(&self) -> bool {
        self.rows.is_some()
    }
}

/// Build a column map from raw rows. The first value seen for a column decides its type.
pub fn infer_columns(rows: &[Value]) -> BTreeMap<String, ColumnType> {
    let mut columns = BTreeMap::new();
    for row in rows {
        if let Some(fields) = row.as_object() {
            for (key, value) in fields {
                columns
                    .entry(key.clone())
                    .or_insert_with(|| ColumnType::infer(key, value));
            }
        }
    }
    columns
}

/// `order_items` -> `Order items`
fn display_name(id: &str) -> String {
    let spaced = id.replace(['_', '-'], " ");
    let mut chars = spaced.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}
