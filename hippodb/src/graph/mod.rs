//! The join index: every joined row, owned once, keyed by table id then
//! row id, plus the ordered live tables that reference them.
//!
//! Rows never hold pointers to each other. A foreign key becomes a
//! [`Link`] (table id + row id) and its target records the referencing
//! row in a back-reference bucket, so the graph can be cyclic without
//! any shared ownership.

mod join;
pub mod row;

pub use row::{Joined, Link, Row, RowKey, RowRef};

use std::collections::HashMap;

/// The mounted, ordered row sequence of one table.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LiveTable {
    id: String,
    rows: Vec<RowKey>,
}

impl LiveTable {
    pub fn new(id: &str) -> Self {
        LiveTable {
            id: id.to_string(),
            rows: Vec::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn keys(&self) -> &[RowKey] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn position(&self, key: &RowKey) -> Option<usize> {
        self.rows.iter().position(|k| k == key)
    }
}

#[derive(Debug, Default)]
pub struct JoinGraph {
    index: HashMap<String, HashMap<RowKey, Row>>,
    tables: HashMap<String, LiveTable>,
}

impl JoinGraph {
    pub fn new() -> Self {
        Self::default()
    }

    // ── Reads ────────────────────────────────────────────────────────

    pub fn is_mounted(&self, table: &str) -> bool {
        self.tables.contains_key(table)
    }

    pub fn table(&self, table: &str) -> Option<&LiveTable> {
        self.tables.get(table)
    }

    /// Ids of all mounted tables, sorted.
    pub fn table_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.tables.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Look up a stored row. Only rows of mounted tables are visible.
    pub fn row(&self, table: &str, key: &RowKey) -> Option<RowRef<'_>> {
        if !self.is_mounted(table) {
            return None;
        }
        self.index
            .get(table)
            .and_then(|rows| rows.get(key))
            .map(|row| RowRef { graph: self, row })
    }

    pub fn contains_row(&self, table: &str, key: &RowKey) -> bool {
        self.row(table, key).is_some()
    }

    /// Rows of a live table, in table order.
    pub fn rows(&self, table: &str) -> Option<Vec<RowRef<'_>>> {
        let live = self.tables.get(table)?;
        Some(self.resolve_keys(table, &live.rows))
    }

    /// Resolve keys of one table into rows, skipping keys with no stored row.
    pub(crate) fn resolve_keys(&self, table: &str, keys: &[RowKey]) -> Vec<RowRef<'_>> {
        let Some(rows) = self.index.get(table) else {
            return Vec::new();
        };
        keys.iter()
            .filter_map(|key| rows.get(key))
            .map(|row| RowRef { graph: self, row })
            .collect()
    }

    /// Highest integer id in a live table.
    pub fn max_int_id(&self, table: &str) -> Option<i64> {
        self.tables
            .get(table)?
            .rows
            .iter()
            .filter_map(RowKey::as_int)
            .max()
    }

    // ── Writes ───────────────────────────────────────────────────────

    /// Start an empty live table, replacing any previous one along with
    /// its stored rows. Callers that care about back-references other
    /// tables hold should `drop_table` first.
    pub(crate) fn create_table(&mut self, table: &str) {
        self.tables.insert(table.to_string(), LiveTable::new(table));
        self.index.insert(table.to_string(), HashMap::new());
    }

    pub(crate) fn push_live(&mut self, table: &str, key: RowKey) {
        if let Some(live) = self.tables.get_mut(table) {
            live.rows.push(key);
        }
    }

    pub(crate) fn row_mut(&mut self, table: &str, key: &RowKey) -> Option<&mut Row> {
        self.index.get_mut(table)?.get_mut(key)
    }

    /// Store a fully built row, e.g. one restored from a snapshot.
    pub(crate) fn store_row(&mut self, row: Row) {
        self.index
            .entry(row.table.clone())
            .or_default()
            .insert(row.id.clone(), row);
    }

    pub(crate) fn attach_back_ref(&mut self, target: &Link, from_table: &str, from_key: &RowKey) {
        if let Some(row) = self.row_mut(&target.table, &target.key) {
            row.add_back_ref(from_table, from_key);
        }
    }

    pub(crate) fn detach_back_ref(&mut self, target: &Link, from_table: &str, from_key: &RowKey) {
        if let Some(row) = self.row_mut(&target.table, &target.key) {
            row.remove_back_ref(from_table, from_key);
        }
    }

    /// Remove rows from a live table and from the index. Returns the removed rows.
    pub(crate) fn remove_rows(&mut self, table: &str, keys: &[RowKey]) -> Vec<Row> {
        if let Some(live) = self.tables.get_mut(table) {
            live.rows.retain(|k| !keys.contains(k));
        }

        let mut removed = Vec::new();
        for key in keys {
            let Some(row) = self.index.get_mut(table).and_then(|rows| rows.remove(key)) else {
                continue;
            };
            for link in row.links.values() {
                self.detach_back_ref(link, table, key);
            }
            removed.push(row);
        }
        removed
    }

    /// Forget a table entirely: live order, stored rows, and the
    /// back-references its rows left on other tables.
    pub(crate) fn drop_table(&mut self, table: &str) -> Vec<Row> {
        let keys: Vec<RowKey> = self
            .index
            .get(table)
            .map(|rows| rows.keys().cloned().collect())
            .unwrap_or_default();
        let removed = self.remove_rows(table, &keys);
        self.tables.remove(table);
        self.index.remove(table);
        removed
    }

    /// Re-point every back-reference bucket that should hold rows of
    /// other tables linking into `table`. Used after `table` was rebuilt.
    pub(crate) fn rebuild_back_refs_into(&mut self, table: &str) {
        let mut pending = Vec::new();
        for (from_table, rows) in &self.index {
            if from_table == table {
                continue;
            }
            for row in rows.values() {
                for link in row.links.values() {
                    if link.table == table {
                        pending.push((link.clone(), from_table.clone(), row.id.clone()));
                    }
                }
            }
        }
        // keep bucket order stable across rebuilds
        pending.sort_by(|a, b| (&a.1, &a.2).cmp(&(&b.1, &b.2)));
        for (link, from_table, from_key) in pending {
            self.attach_back_ref(&link, &from_table, &from_key);
        }
    }

    pub(crate) fn clear(&mut self) {
        self.index.clear();
        self.tables.clear();
    }
}
