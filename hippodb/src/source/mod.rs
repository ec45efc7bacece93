//! Where schema documents and raw table payloads come from.

use crate::error::{HippoDbError, Result};
use crate::schema::{self, infer_dependencies, SchemaDocument, TableDescriptor};
use serde_json::Value;
use std::cell::Cell;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Fetches schema documents and raw row payloads.
pub trait TableSource {
    /// Load the schema document at `location`.
    fn fetch_schema(&self, location: &str) -> Result<SchemaDocument>;

    /// Load the raw payload at `uri`. Expected to be an array of records,
    /// but that is checked at mount time.
    fn fetch_rows(&self, uri: &str) -> Result<Value>;

    /// Load several payloads, in order.
    fn fetch_rows_batch(&self, uris: &[String]) -> Result<Vec<Value>> {
        uris.iter().map(|uri| self.fetch_rows(uri)).collect()
    }
}

// ── Filesystem ──────────────────────────────────────────────────

/// Reads files relative to a data directory.
#[derive(Debug, Clone)]
pub struct FsSource {
    root: PathBuf,
}

impl FsSource {
    pub fn new(root: &Path) -> Self {
        FsSource {
            root: root.to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, location: &str) -> PathBuf {
        self.root.join(location)
    }

    /// Build descriptors for every `.json`/`.yaml` payload directly under
    /// the data directory whose content is an array of records. Columns
    /// and dependencies are inferred from the rows.
    pub fn scan_tables(&self, source: &str) -> Result<Vec<TableDescriptor>> {
        let mut found = SchemaDocument::new();
        let mut entries: Vec<PathBuf> = std::fs::read_dir(&self.root)?
            .filter_map(|e| e.ok().map(|e| e.path()))
            .filter(|p| p.is_file())
            .collect();
        entries.sort();

        for path in entries {
            let Some(id) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let Some(file_name) = path.file_name().and_then(|s| s.to_str()) else {
                continue;
            };
            if !matches!(
                path.extension().and_then(|e| e.to_str()),
                Some("json") | Some("yaml") | Some("yml")
            ) {
                continue;
            }
            let rows = match self.fetch_rows(file_name) {
                Ok(Value::Array(rows)) => rows,
                Ok(_) => continue,
                Err(e) => {
                    log::warn!("Skipping {}: {e}", path.display());
                    continue;
                }
            };
            let mut descriptor = TableDescriptor::from_rows(id, source, rows).with_uri(file_name);
            // rows are fetched again on load; the scan only needs their shape
            descriptor.rows = None;
            found.insert(id.to_string(), descriptor);
        }

        infer_dependencies(&mut found);
        Ok(found.into_values().collect())
    }
}

impl TableSource for FsSource {
    fn fetch_schema(&self, location: &str) -> Result<SchemaDocument> {
        schema::parse_schema(&self.resolve(location))
    }

    fn fetch_rows(&self, uri: &str) -> Result<Value> {
        let path = self.resolve(uri);
        let content = std::fs::read_to_string(&path)?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("yaml") | Some("yml") => Ok(serde_yaml::from_str(&content)?),
            _ => Ok(serde_json::from_str(&content)?),
        }
    }
}

// ── In memory ───────────────────────────────────────────────────

/// Schema documents and payloads registered up front.
#[derive(Debug, Default)]
pub struct MemorySource {
    schemas: HashMap<String, SchemaDocument>,
    payloads: HashMap<String, Value>,
    fetches: Cell<usize>,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_schema(mut self, location: &str, schema: SchemaDocument) -> Self {
        self.schemas.insert(location.to_string(), schema);
        self
    }

    pub fn with_rows(mut self, uri: &str, rows: Value) -> Self {
        self.payloads.insert(uri.to_string(), rows);
        self
    }

    /// How many payloads have been fetched so far.
    pub fn fetch_count(&self) -> usize {
        self.fetches.get()
    }
}

impl TableSource for MemorySource {
    fn fetch_schema(&self, location: &str) -> Result<SchemaDocument> {
        self.schemas
            .get(location)
            .cloned()
            .ok_or_else(|| HippoDbError::Other(format!("No schema at `{location}`")))
    }

    fn fetch_rows(&self, uri: &str) -> Result<Value> {
        self.fetches.set(self.fetches.get() + 1);
        self.payloads
            .get(uri)
            .cloned()
            .ok_or_else(|| HippoDbError::Other(format!("No table payload at `{uri}`")))
    }
}
