use super::{JoinGraph, Link, Row, RowKey};
use crate::error::{HippoDbError, Result};
use crate::schema::{pluralize, ColumnType, TableDescriptor, FOREIGN_KEY_SUFFIX};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

impl JoinGraph {
    /// Join one raw row of `descriptor`'s table into the index and return its id.
    ///
    /// If a row with the same (table, id) is already stored it is reused
    /// untouched, so joining twice never duplicates back-references.
    /// Otherwise the raw row is copied, each `*_id` column that resolves
    /// becomes a link (and the target records the row in its bucket for
    /// this table), and each array column named after a mounted table is
    /// resolved element-wise. Resolving a link retypes the descriptor's
    /// columns: the stem becomes `object`, the key `foreign-key`.
    ///
    /// The row is not appended to the live table; callers decide where it goes.
    pub(crate) fn join(
        &mut self,
        descriptor: &mut TableDescriptor,
        raw: &Map<String, Value>,
    ) -> Result<RowKey> {
        let table = descriptor.id.clone();
        let key = raw
            .get("id")
            .and_then(RowKey::from_value)
            .ok_or_else(|| {
                HippoDbError::Insert(format!(
                    "Row in table `{table}` has no usable `id`"
                ))
            })?;

        if self
            .index
            .get(&table)
            .is_some_and(|rows| rows.contains_key(&key))
        {
            return Ok(key);
        }

        let mut row = Row::new(&table, key.clone(), raw.clone());

        for (column, value) in raw {
            if let Some(stem) = column.strip_suffix(FOREIGN_KEY_SUFFIX) {
                if stem.is_empty() {
                    continue;
                }
                let Some(target_key) = RowKey::from_value(value) else {
                    continue;
                };
                let target_table = pluralize(stem);
                if self.contains_row(&target_table, &target_key) {
                    row.links.insert(
                        stem.to_string(),
                        Link {
                            table: target_table,
                            key: target_key,
                        },
                    );
                    descriptor
                        .columns
                        .insert(stem.to_string(), ColumnType::Object);
                    descriptor
                        .columns
                        .insert(column.clone(), ColumnType::ForeignKey);
                } else {
                    log::debug!(
                        "{table}/{key}: `{column}` = {value} does not resolve in `{target_table}`"
                    );
                }
            }
        }
        row.lists = self.resolve_lists(raw);

        let links: Vec<Link> = row.links.values().cloned().collect();
        self.store_row(row);
        for link in &links {
            self.attach_back_ref(link, &table, &key);
        }

        Ok(key)
    }

    /// Re-run foreign key resolution for a stored row after its data changed.
    /// Links whose key column changed are detached and re-resolved.
    pub(crate) fn relink(
        &mut self,
        descriptor: &mut TableDescriptor,
        key: &RowKey,
    ) -> Result<()> {
        let table = descriptor.id.clone();
        let row = self
            .row_mut(&table, key)
            .ok_or_else(|| HippoDbError::Lookup(format!("No row {key} in table `{table}`")))?;
        let data = row.data.clone();
        let old_links = std::mem::take(&mut row.links);

        for link in old_links.values() {
            self.detach_back_ref(link, &table, key);
        }

        let mut new_links = Vec::new();
        for (column, value) in &data {
            let Some(stem) = column.strip_suffix(FOREIGN_KEY_SUFFIX) else {
                continue;
            };
            if stem.is_empty() {
                continue;
            }
            let Some(target_key) = RowKey::from_value(value) else {
                continue;
            };
            let target_table = pluralize(stem);
            if self.contains_row(&target_table, &target_key) {
                descriptor
                    .columns
                    .insert(stem.to_string(), ColumnType::Object);
                descriptor
                    .columns
                    .insert(column.clone(), ColumnType::ForeignKey);
                new_links.push((
                    stem.to_string(),
                    Link {
                        table: target_table,
                        key: target_key,
                    },
                ));
            }
        }

        for (stem, link) in new_links {
            self.attach_back_ref(&link, &table, key);
            if let Some(row) = self.row_mut(&table, key) {
                row.links.insert(stem, link);
            }
        }

        let lists = self.resolve_lists(&data);
        if let Some(row) = self.row_mut(&table, key) {
            row.lists = lists;
        }
        Ok(())
    }

    /// Array columns named after a mounted table, resolved to the ids
    /// that exist there.
    fn resolve_lists(&self, data: &Map<String, Value>) -> BTreeMap<String, Vec<RowKey>> {
        let mut lists = BTreeMap::new();
        for (column, value) in data {
            let Value::Array(items) = value else {
                continue;
            };
            if !self.is_mounted(column) {
                continue;
            }
            let resolved: Vec<RowKey> = items
                .iter()
                .filter_map(RowKey::from_value)
                .filter(|k| self.contains_row(column, k))
                .collect();
            lists.insert(column.clone(), resolved);
        }
        lists
    }
}
