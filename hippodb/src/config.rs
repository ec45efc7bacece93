use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::path::Path;

pub const DEFAULT_NAME: &str = "hippodb";

/// Options recognized by a [`Store`](crate::Store).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// The store's own source identifier. Descriptors carrying this
    /// source are "self-sourced" and are protected from being clobbered
    /// by a redefinition coming from another source.
    pub name: String,
    /// Prefix of every key written to the persistent cache.
    pub namespace: String,
    /// Location of the schema document, resolved by the table source.
    pub source: Option<String>,
    /// Persist full row data, not just the schema.
    pub save_tables: bool,
    /// Compress persisted blobs.
    pub compress: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig {
            name: DEFAULT_NAME.to_string(),
            namespace: DEFAULT_NAME.to_string(),
            source: None,
            save_tables: false,
            compress: true,
        }
    }
}

impl StoreConfig {
    /// Read a config file. `.yaml`/`.yml` files are YAML, anything else JSON.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("yaml") | Some("yml") => Self::from_str_yaml(&content),
            _ => Ok(serde_json::from_str(&content)?),
        }
    }

    pub fn from_str_yaml(content: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(content)?)
    }

    pub fn with_source(mut self, source: &str) -> Self {
        self.source = Some(source.to_string());
        self
    }

    pub fn with_save_tables(mut self, save_tables: bool) -> Self {
        self.save_tables = save_tables;
        self
    }

    pub fn with_compress(mut self, compress: bool) -> Self {
        self.compress = compress;
        self
    }

    /// Cache key holding the bundle for one source.
    pub fn cache_key(&self, source: &str) -> String {
        format!("{}.{}", self.namespace, source)
    }

    pub(crate) fn cache_prefix(&self) -> String {
        format!("{}.", self.namespace)
    }
}
