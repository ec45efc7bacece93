//! Persistence cache: per-source snapshot records, the blob envelope
//! they are stored in, and the key-value stores that hold them.

pub mod cycle;
pub mod sqlite;

use crate::error::{HippoDbError, Result};
use crate::schema::SchemaDocument;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;

pub use cycle::{decycle_table, retrocycle_tables};
pub use sqlite::SqliteKv;

/// Library version stamped into every record. A record written by any
/// other version is discarded on load.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

// ── Key-value stores ────────────────────────────────────────────

/// The persistent store snapshots are written to.
pub trait KeyValueStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;
    fn set(&self, key: &str, value: &[u8]) -> Result<()>;
    fn remove(&self, key: &str) -> Result<()>;
    fn keys(&self) -> Result<Vec<String>>;
}

/// In-memory store. Clones share the same entries.
#[derive(Debug, Clone, Default)]
pub struct MemoryKv {
    entries: Rc<RefCell<BTreeMap<String, Vec<u8>>>>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.borrow().is_empty()
    }
}

impl KeyValueStore for MemoryKv {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.entries.borrow().get(key).cloned())
    }

    fn set(&self, key: &str, value: &[u8]) -> Result<()> {
        self.entries
            .borrow_mut()
            .insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.entries.borrow_mut().remove(key);
        Ok(())
    }

    fn keys(&self) -> Result<Vec<String>> {
        Ok(self.entries.borrow().keys().cloned().collect())
    }
}

// ── Records ─────────────────────────────────────────────────────

/// One source's snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheRecord {
    #[serde(rename = "VERSION")]
    pub version: String,
    #[serde(rename = "DATE")]
    pub date: DateTime<Utc>,
    pub schema: SchemaDocument,
    /// Decycled live tables, or `false` when tables are not persisted.
    #[serde(with = "tables_or_false")]
    pub tables: Option<Map<String, Value>>,
}

impl CacheRecord {
    pub fn new(date: DateTime<Utc>, save_tables: bool) -> Self {
        CacheRecord {
            version: VERSION.to_string(),
            date,
            schema: SchemaDocument::new(),
            tables: save_tables.then(Map::new),
        }
    }

    pub fn is_current(&self) -> bool {
        self.version == VERSION
    }
}

mod tables_or_false {
    use super::*;

    pub fn serialize<S: Serializer>(
        tables: &Option<Map<String, Value>>,
        serializer: S,
    ) -> std::result::Result<S::Ok, S::Error> {
        match tables {
            Some(map) => map.serialize(serializer),
            None => false.serialize(serializer),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> std::result::Result<Option<Map<String, Value>>, D::Error> {
        match Value::deserialize(deserializer)? {
            Value::Object(map) => Ok(Some(map)),
            Value::Bool(false) | Value::Null => Ok(None),
            other => Err(serde::de::Error::custom(format!(
                "expected a table map or false, got {other}"
            ))),
        }
    }
}

// ── Envelope ────────────────────────────────────────────────────
//
// Header (5 bytes) + payload:
// - 4 bytes: magic ("HIPO")
// - 1 byte: codec (0 = plain JSON, 1 = lz4 size-prepended JSON)

pub const MAGIC_BYTES: &[u8; 4] = b"HIPO";
const HEADER_LEN: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Codec {
    Plain = 0,
    Lz4 = 1,
}

impl Codec {
    fn from_byte(byte: u8) -> Result<Codec> {
        match byte {
            0 => Ok(Codec::Plain),
            1 => Ok(Codec::Lz4),
            other => Err(HippoDbError::Cache(format!("Unknown codec byte {other}"))),
        }
    }
}

/// Serialize a record into a stored blob.
pub fn encode(record: &CacheRecord, compress: bool) -> Result<Vec<u8>> {
    let json = serde_json::to_vec(record)?;
    let codec = if compress { Codec::Lz4 } else { Codec::Plain };

    let mut blob = Vec::with_capacity(HEADER_LEN + json.len());
    blob.extend_from_slice(MAGIC_BYTES);
    blob.push(codec as u8);
    match codec {
        Codec::Plain => blob.extend_from_slice(&json),
        Codec::Lz4 => blob.extend_from_slice(&lz4_flex::compress_prepend_size(&json)),
    }
    Ok(blob)
}

/// Read a stored blob back into a record, whatever codec it was written with.
pub fn decode(blob: &[u8]) -> Result<CacheRecord> {
    if blob.len() < HEADER_LEN {
        return Err(HippoDbError::Cache("Blob too short for header".to_string()));
    }
    if &blob[0..4] != MAGIC_BYTES {
        return Err(HippoDbError::Cache("Invalid magic bytes".to_string()));
    }
    let payload = &blob[HEADER_LEN..];
    let record = match Codec::from_byte(blob[4])? {
        Codec::Plain => serde_json::from_slice(payload)?,
        Codec::Lz4 => {
            let json = lz4_flex::decompress_size_prepended(payload)
                .map_err(|e| HippoDbError::Cache(format!("Decompression failed: {e}")))?;
            serde_json::from_slice(&json)?
        }
    };
    Ok(record)
}
