use super::{Store, TableView};
use crate::error::{HippoDbError, Result};
use crate::events::Event;
use crate::graph::{RowKey, RowRef};
use crate::query::{self, Lookup, SearchOptions};
use crate::schema::ColumnType;
use serde_json::{Map, Value};

impl Store {
    /// Insert a row into a mounted table and return the joined row.
    ///
    /// The id is the next integer after the table's largest integer id
    /// when `auto_increment` is set or the row has none. Every declared
    /// column present on the row is re-typed and must match; any
    /// mismatch rejects the whole row. Raw source rows are not touched,
    /// so a later `revert` drops the insert.
    pub fn insert(&mut self, table: &str, row: Value, auto_increment: bool) -> Result<RowRef<'_>> {
        self.table(table)?;
        let mut data = match row {
            Value::Object(map) => map,
            other => {
                return Err(HippoDbError::Insert(format!(
                    "Row for `{table}` must be an object, got {other}"
                )))
            }
        };

        let key = if auto_increment || !data.contains_key("id") {
            let next = match self.graph.max_int_id(table) {
                Some(max) => max.checked_add(1).ok_or_else(|| {
                    HippoDbError::Insert(format!("No id left after {max} in table `{table}`"))
                })?,
                None => 1,
            };
            data.insert("id".to_string(), Value::from(next));
            RowKey::Int(next)
        } else {
            let key = data
                .get("id")
                .and_then(RowKey::from_value)
                .ok_or_else(|| HippoDbError::Insert(format!("Row for `{table}` has an unusable `id`")))?;
            if self.graph.contains_row(table, &key) {
                return Err(HippoDbError::Insert(format!(
                    "There is already a row with the id {key} in table `{table}`"
                )));
            }
            key
        };

        let mut descriptor = self
            .registry
            .get(table)
            .cloned()
            .ok_or_else(|| HippoDbError::Lookup(format!("Invalid table `{table}`")))?;
        for (column, declared) in &descriptor.columns {
            if let Some(value) = data.get(column) {
                let seen = ColumnType::infer(column, value);
                if seen != *declared {
                    return Err(HippoDbError::Insert(format!(
                        "Mismatched column type for `{column}`. Saw `{seen}`, expected `{declared}`."
                    )));
                }
            }
        }

        self.graph.join(&mut descriptor, &data)?;
        self.graph.push_live(table, key.clone());
        self.registry.register(descriptor);

        self.events.publish(Event::TableRowAdded {
            table: table.to_string(),
            row: Value::Object(data),
        });
        self.after_mutation(table);

        self.graph
            .row(table, &key)
            .ok_or_else(|| HippoDbError::Other(format!("Inserted row {key} vanished from `{table}`")))
    }

    /// Merge `row` into the existing row with the same id, in place.
    ///
    /// Objects merge recursively, arrays element by element, everything
    /// else is overwritten. Changed foreign keys are re-linked.
    pub fn update(&mut self, table: &str, row: Value) -> Result<RowRef<'_>> {
        self.table(table)?;
        let patch = match row {
            Value::Object(map) => map,
            other => {
                return Err(HippoDbError::Lookup(format!(
                    "Update for `{table}` must be an object, got {other}"
                )))
            }
        };
        let key = patch
            .get("id")
            .and_then(RowKey::from_value)
            .ok_or_else(|| HippoDbError::Lookup(format!("Update for `{table}` needs an `id`")))?;

        let live = self.graph.table(table).and_then(|t| t.position(&key));
        let stored = match (live, self.graph.row_mut(table, &key)) {
            (Some(_), Some(stored)) => stored,
            _ => {
                return Err(HippoDbError::Lookup(format!(
                    "Unable to find row with id {key} in `{table}`"
                )))
            }
        };
        merge_map(&mut stored.data, patch);
        let snapshot = Value::Object(stored.data.clone());

        if let Some(mut descriptor) = self.registry.get(table).cloned() {
            self.graph.relink(&mut descriptor, &key)?;
            self.registry.register(descriptor);
        }

        self.events.publish(Event::TableRowModified {
            table: table.to_string(),
            row: snapshot,
        });
        self.after_mutation(table);

        self.graph
            .row(table, &key)
            .ok_or_else(|| HippoDbError::Other(format!("Updated row {key} vanished from `{table}`")))
    }

    /// Delete every row matching `lookup`.
    pub fn remove<L: Into<Lookup>>(&mut self, table: &str, lookup: L) -> Result<TableView<'_>> {
        self.table(table)?;
        let keys: Vec<RowKey> = query::execute(&self.graph, table, &lookup.into(), &SearchOptions::default())?
            .iter()
            .map(|row| row.id().clone())
            .collect();

        let removed = self.graph.remove_rows(table, &keys);
        log::debug!("Removed {} row(s) from `{table}`", removed.len());

        self.events.publish(Event::TableRowsRemoved {
            table: table.to_string(),
            rows: removed.into_iter().map(|r| Value::Object(r.data)).collect(),
        });
        self.after_mutation(table);
        self.table(table)
    }

    /// Throw away the live table and mount it again from its raw rows.
    pub fn revert(&mut self, table: &str) -> Result<TableView<'_>> {
        if !self.registry.contains(table) {
            return Err(HippoDbError::Lookup(format!("Invalid table `{table}`")));
        }
        self.mount(table)?;

        self.events.publish(Event::TableReverted {
            table: table.to_string(),
        });
        self.after_mutation(table);
        self.table(table)
    }

    /// Shared tail of every mutation.
    fn after_mutation(&mut self, table: &str) {
        self.events.publish(Event::TableModified {
            table: table.to_string(),
        });
        if self.config.save_tables {
            if let Err(e) = self.save() {
                log::warn!("Failed to save after modifying `{table}`: {e}");
            }
        }
    }
}

fn merge_map(target: &mut Map<String, Value>, patch: Map<String, Value>) {
    for (key, value) in patch {
        match target.get_mut(&key) {
            Some(existing) => merge_value(existing, value),
            None => {
                target.insert(key, value);
            }
        }
    }
}

fn merge_value(target: &mut Value, patch: Value) {
    match (target, patch) {
        (Value::Object(existing), Value::Object(incoming)) => merge_map(existing, incoming),
        (Value::Array(existing), Value::Array(incoming)) => {
            for (i, item) in incoming.into_iter().enumerate() {
                match existing.get_mut(i) {
                    Some(slot) => merge_value(slot, item),
                    None => existing.push(item),
                }
            }
        }
        (slot, value) => *slot = value,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::events::Event;
    use crate::schema::TableDescriptor;
    use crate::store::test_support::{empty_store, mounted_store, numbered_store};
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_merge_value() {
        let mut target = json!({"a": 1, "nested": {"x": 1, "y": 2}, "list": [1, {"k": 1}]});
        merge_value(
            &mut target,
            json!({"a": 2, "nested": {"y": 3}, "list": [9, {"j": 2}, 3], "new": true}),
        );
        assert_eq!(
            target,
            json!({"a": 2, "nested": {"x": 1, "y": 3}, "list": [9, {"k": 1, "j": 2}, 3], "new": true})
        );
    }

    #[test]
    fn test_insert_assigns_next_id() {
        let mut store = numbered_store();
        let row = store.insert("items", json!({"label": "eight"}), false).unwrap();
        assert_eq!(row.id(), &RowKey::Int(8));

        let row = store.insert("items", json!({"id": 100, "label": "x"}), true).unwrap();
        assert_eq!(row.id(), &RowKey::Int(9));
        assert_eq!(store.table("items").unwrap().len(), 9);
    }

    #[test]
    fn test_insert_rejects_duplicates_and_mismatches() {
        let mut store = numbered_store();
        let err = store.insert("items", json!({"id": 3, "label": "dup"}), false).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Insert);

        let err = store.insert("items", json!({"label": 42}), false).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Insert);
        assert!(err.to_string().contains("`label`"));
        assert_eq!(store.table("items").unwrap().len(), 7);

        let err = store.insert("items", json!(["not", "a", "row"]), false).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Insert);
    }

    #[test]
    fn test_insert_joins_foreign_keys() {
        let mut store = mounted_store();
        let id = store
            .insert("orders", json!({"user_id": 2, "total": 5}), false)
            .unwrap()
            .id()
            .clone();
        assert_eq!(id, RowKey::Int(3));

        let bob = store.find("users", 2_i64).unwrap().unwrap();
        let ids: Vec<_> = bob.back_refs("orders").iter().map(|r| r.id().clone()).collect();
        assert_eq!(ids, vec![RowKey::Int(2), RowKey::Int(3)]);
    }

    #[test]
    fn test_insert_after_largest_id_fails() {
        let mut store = numbered_store();
        store
            .insert("items", json!({"id": i64::MAX, "label": "last"}), false)
            .unwrap();
        let err = store.insert("items", json!({"label": "next"}), false).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Insert);
        assert_eq!(store.table("items").unwrap().len(), 8);
    }

    #[test]
    fn test_insert_into_unmounted_table() {
        let mut store = mounted_store();
        let err = store.insert("ghosts", json!({"id": 1}), false).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Lookup);
    }

    #[test]
    fn test_update_in_place() {
        let mut store = mounted_store();
        let rx = store.channel();
        let row = store
            .update("users", json!({"id": 1, "status": "closed", "profile": {"city": "Oslo"}}))
            .unwrap();
        assert_eq!(row.data()["name"], json!("Alice"));
        assert_eq!(row.data()["status"], json!("closed"));
        assert_eq!(row.data()["profile"], json!({"age": 31, "city": "Oslo"}));

        let ids: Vec<_> = store
            .table("users")
            .unwrap()
            .rows()
            .iter()
            .map(|r| r.id().clone())
            .collect();
        assert_eq!(ids, vec![RowKey::Int(1), RowKey::Int(2)]);

        let names: Vec<&str> = rx.try_iter().map(|e| e.name()).collect();
        assert_eq!(names, vec!["table-row-modified", "table-modified"]);
    }

    #[test]
    fn test_update_relinks_foreign_key() {
        let mut store = mounted_store();
        store.update("orders", json!({"id": 1, "user_id": 2})).unwrap();

        let order = store.find("orders", 1_i64).unwrap().unwrap();
        assert_eq!(order.linked("user").unwrap().data()["name"], json!("Bob"));
        let alice = store.find("users", 1_i64).unwrap().unwrap();
        assert!(alice.back_refs("orders").is_empty());
        let bob = store.find("users", 2_i64).unwrap().unwrap();
        assert_eq!(bob.back_refs("orders").len(), 2);
    }

    #[test]
    fn test_update_refreshes_id_arrays() {
        let mut store = empty_store();
        store.register(TableDescriptor::from_rows(
            "tags",
            "app",
            vec![json!({"id": 1, "label": "red"}), json!({"id": 2, "label": "blue"})],
        ));
        store.register(
            TableDescriptor::from_rows("posts", "app", vec![json!({"id": 1, "tags": [1]})])
                .with_dependencies(&["tags"]),
        );
        store.init().unwrap();

        let post = store.find("posts", 1_i64).unwrap().unwrap();
        assert_eq!(post.resolve("tags.0.label").unwrap().to_value(), json!("red"));

        let post = store.update("posts", json!({"id": 1, "tags": [2]})).unwrap();
        assert_eq!(post.data()["tags"], json!([2]));
        assert_eq!(post.resolve("tags.0.label").unwrap().to_value(), json!("blue"));
    }

    #[test]
    fn test_update_unknown_row() {
        let mut store = mounted_store();
        let err = store.update("users", json!({"id": 99, "name": "x"})).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Lookup);
        let err = store.update("users", json!({"name": "x"})).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Lookup);
    }

    #[test]
    fn test_remove_detaches_rows() {
        let mut store = mounted_store();
        let rx = store.channel();
        let left = store
            .remove("orders", Lookup::pairs([("user_id", 1_i64)]))
            .unwrap()
            .len();
        assert_eq!(left, 1);

        let alice = store.find("users", 1_i64).unwrap().unwrap();
        assert!(alice.back_refs("orders").is_empty());

        let events: Vec<Event> = rx.try_iter().collect();
        assert_eq!(
            events[0],
            Event::TableRowsRemoved {
                table: "orders".into(),
                rows: vec![json!({"id": 1, "user_id": 1, "total": 10})],
            }
        );

        let again = store.insert("orders", json!({"id": 1, "user_id": 2, "total": 1}), false).unwrap();
        assert_eq!(again.linked("user").unwrap().data()["name"], json!("Bob"));
    }

    #[test]
    fn test_revert_restores_raw_rows() {
        let mut store = mounted_store();
        store.insert("orders", json!({"user_id": 1, "total": 3}), false).unwrap();
        store.update("orders", json!({"id": 1, "total": 99})).unwrap();
        store.remove("orders", Lookup::from(2_i64)).unwrap();

        let len = store.revert("orders").unwrap().len();
        assert_eq!(len, 2);
        let order = store.find("orders", 1_i64).unwrap().unwrap();
        assert_eq!(order.data()["total"], json!(10));
        let alice = store.find("users", 1_i64).unwrap().unwrap();
        assert_eq!(alice.back_refs("orders").len(), 1);
    }

    #[test]
    fn test_revert_keeps_back_refs_from_other_tables() {
        let mut store = mounted_store();
        store.revert("users").unwrap();
        let alice = store.find("users", 1_i64).unwrap().unwrap();
        let ids: Vec<_> = alice.back_refs("orders").iter().map(|r| r.id().clone()).collect();
        assert_eq!(ids, vec![RowKey::Int(1)]);
        assert!(store.revert("ghosts").is_err());
    }
}
