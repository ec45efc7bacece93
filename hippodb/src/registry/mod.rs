use crate::error::{HippoDbError, Result};
use crate::schema::{ColumnType, SchemaDocument, TableDescriptor};
use std::collections::BTreeMap;

/// What [`Registry::check`] did with an incoming descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckOutcome {
    /// No entry existed.
    Inserted,
    /// The stored entry was replaced by the incoming one.
    Replaced,
    /// The stored entry was kept and marked loaded.
    Kept,
}

/// Table descriptors keyed by table id.
#[derive(Debug, Clone)]
pub struct Registry {
    /// Source identifier of the owning store. Entries with this source
    /// are self-sourced.
    self_source: String,
    entries: SchemaDocument,
}

impl Registry {
    pub fn new(self_source: &str) -> Self {
        Registry {
            self_source: self_source.to_string(),
            entries: SchemaDocument::new(),
        }
    }

    /// Merge an incoming descriptor.
    ///
    /// The stored entry is replaced when there is none, or when the
    /// modification markers differ and either the incoming descriptor is
    /// not self-sourced or both share a source. Otherwise the stored entry
    /// is kept and marked loaded, so re-checking the same descriptor is a
    /// no-op beyond that flag.
    pub fn check(&mut self, incoming: TableDescriptor) -> CheckOutcome {
        match self.entries.get_mut(&incoming.id) {
            None => {
                self.entries.insert(incoming.id.clone(), incoming);
                CheckOutcome::Inserted
            }
            Some(existing) => {
                let changed = existing.last_modified != incoming.last_modified;
                let may_replace =
                    incoming.source != self.self_source || existing.source == incoming.source;
                if changed && may_replace {
                    log::debug!("check: replacing `{}` from `{}`", incoming.id, incoming.source);
                    *existing = incoming;
                    CheckOutcome::Replaced
                } else {
                    existing.loaded = true;
                    CheckOutcome::Kept
                }
            }
        }
    }

    /// Add or overwrite a descriptor unconditionally.
    pub fn register(&mut self, descriptor: TableDescriptor) -> Option<TableDescriptor> {
        self.entries.insert(descriptor.id.clone(), descriptor)
    }

    pub fn get(&self, table: &str) -> Option<&TableDescriptor> {
        self.entries.get(table)
    }

    pub fn get_mut(&mut self, table: &str) -> Option<&mut TableDescriptor> {
        self.entries.get_mut(table)
    }

    pub fn contains(&self, table: &str) -> bool {
        self.entries.contains_key(table)
    }

    pub fn remove(&mut self, table: &str) -> Option<TableDescriptor> {
        self.entries.remove(table)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Column map of a table.
    pub fn describe(&self, table: &str) -> Result<&BTreeMap<String, ColumnType>> {
        self.entries
            .get(table)
            .map(|d| &d.columns)
            .ok_or_else(|| HippoDbError::Other(format!("Unknown table `{table}`")))
    }

    /// Table id -> source, optionally only for one source.
    pub fn list(&self, source: Option<&str>) -> BTreeMap<String, String> {
        self.entries
            .values()
            .filter(|d| source.map_or(true, |s| d.source == s))
            .map(|d| (d.id.clone(), d.source.clone()))
            .collect()
    }

    /// Ids of tables that are neither skipped nor loaded.
    pub fn pending(&self) -> Vec<String> {
        self.entries
            .values()
            .filter(|d| !d.skip && !d.loaded)
            .map(|d| d.id.clone())
            .collect()
    }

    /// Descriptors grouped by source.
    pub fn by_source(&self) -> BTreeMap<String, Vec<&TableDescriptor>> {
        let mut groups: BTreeMap<String, Vec<&TableDescriptor>> = BTreeMap::new();
        for descriptor in self.entries.values() {
            groups
                .entry(descriptor.source.clone())
                .or_default()
                .push(descriptor);
        }
        groups
    }
}
