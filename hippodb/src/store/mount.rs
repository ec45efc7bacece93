use super::Store;
use crate::error::{HippoDbError, Result};
use crate::events::Event;
use crate::graph::RowKey;
use crate::schema::ColumnType;
use serde_json::{Map, Value};
use std::collections::HashSet;

/// Bookkeeping for one mounting pass: the tables currently being
/// mounted (for cycle detection) and the ones already finished.
#[derive(Debug, Default)]
pub struct MountState {
    stack: Vec<String>,
    done: HashSet<String>,
}

impl MountState {
    pub fn is_done(&self, table: &str) -> bool {
        self.done.contains(table)
    }
}

impl Store {
    /// Mount a registered table, mounting its dependencies first.
    ///
    /// Mounting a table that is already mounted replaces its rows with
    /// the raw rows; rows inserted since are gone. Rows of other tables
    /// that link into it are re-attached to the new rows.
    pub fn mount(&mut self, table: &str) -> Result<()> {
        self.mount_with(table, &mut MountState::default())
    }

    pub(crate) fn mount_with(&mut self, table: &str, state: &mut MountState) -> Result<()> {
        if state.stack.iter().any(|t| t == table) {
            let mut chain = state.stack.clone();
            chain.push(table.to_string());
            return Err(HippoDbError::DependencyCycle { chain });
        }

        let dependencies = self
            .registry
            .get(table)
            .ok_or_else(|| HippoDbError::Lookup(format!("Cannot mount unknown table `{table}`")))?
            .dependencies
            .clone();

        state.stack.push(table.to_string());
        for dependency in &dependencies {
            if !self.graph.is_mounted(dependency) && !state.is_done(dependency) {
                self.mount_with(dependency, state)?;
            }
        }
        state.stack.pop();

        let mut descriptor = match self.registry.get(table) {
            Some(d) => d.clone(),
            None => return Err(HippoDbError::Lookup(format!("Cannot mount unknown table `{table}`"))),
        };

        let raw = match &descriptor.rows {
            Some(Value::Array(rows)) => rows.clone(),
            _ => {
                return Err(HippoDbError::Insert(format!(
                    "Invalid rows for table `{}`",
                    descriptor.name
                )))
            }
        };
        let mut rows: Vec<Map<String, Value>> = Vec::with_capacity(raw.len());
        for value in raw {
            match value {
                Value::Object(row) => rows.push(row),
                other => {
                    return Err(HippoDbError::Insert(format!(
                        "Row in table `{table}` is not a record: {other}"
                    )))
                }
            }
        }
        descriptor.row_count = rows.len();

        if !descriptor.columns.contains_key("id") {
            for (i, row) in rows.iter_mut().enumerate() {
                row.insert("id".to_string(), Value::from(i as i64 + 1));
            }
            descriptor.columns.insert("id".to_string(), ColumnType::Id);
            descriptor.rows = Some(Value::Array(
                rows.iter().cloned().map(Value::Object).collect(),
            ));
        }

        let mut seen = HashSet::new();
        for row in &rows {
            if let Some(key) = row.get("id").and_then(RowKey::from_value) {
                if !seen.insert(key.clone()) {
                    return Err(HippoDbError::Insert(format!(
                        "Duplicate id {key} in table `{table}`"
                    )));
                }
            }
        }

        // a re-mount starts from the raw rows only
        if self.graph.is_mounted(table) {
            self.graph.drop_table(table);
        }
        self.graph.create_table(table);
        for row in &rows {
            let key = self.graph.join(&mut descriptor, row)?;
            self.graph.push_live(table, key);
        }
        self.graph.rebuild_back_refs_into(table);

        descriptor.ready = true;
        descriptor.loaded = true;
        log::debug!("Mounted `{table}` ({} rows)", descriptor.row_count);
        self.registry.register(descriptor.clone());
        self.events.publish(Event::TableReady { descriptor });
        state.done.insert(table.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::error::{ErrorKind, HippoDbError};
    use crate::schema::{ColumnType, TableDescriptor};
    use crate::store::test_support::empty_store;
    use serde_json::json;

    #[test]
    fn test_mount_synthesizes_ids() {
        let mut store = empty_store();
        let mut tags = TableDescriptor::new("tags", "app");
        tags.rows = Some(json!([{"label": "red"}, {"label": "blue"}]));
        store.register(tags);
        store.mount("tags").unwrap();

        let table = store.table("tags").unwrap();
        let ids: Vec<_> = table.rows().iter().filter_map(|r| r.id().as_int()).collect();
        assert_eq!(ids, vec![1, 2]);
        let descriptor = store.descriptor("tags").unwrap();
        assert_eq!(descriptor.columns["id"], ColumnType::Id);
        assert_eq!(descriptor.row_count, 2);
        assert!(descriptor.ready && descriptor.loaded);
    }

    #[test]
    fn test_mount_dependencies_first() {
        let mut store = empty_store();
        store.register(
            TableDescriptor::from_rows("orders", "app", vec![json!({"id": 1, "user_id": 1})])
                .with_dependencies(&["users"]),
        );
        store.register(TableDescriptor::from_rows(
            "users",
            "app",
            vec![json!({"id": 1, "name": "Alice"})],
        ));
        store.mount("orders").unwrap();

        assert!(store.table("users").is_ok());
        let order = store.find("orders", 1_i64).unwrap().unwrap();
        assert_eq!(order.linked("user").unwrap().data()["name"], json!("Alice"));
        assert_eq!(store.describe("orders").unwrap()["user"], ColumnType::Object);
    }

    #[test]
    fn test_mount_rejects_bad_rows() {
        let mut store = empty_store();
        let mut broken = TableDescriptor::new("broken", "app");
        broken.rows = Some(json!({"id": 1}));
        store.register(broken);
        assert_eq!(store.mount("broken").unwrap_err().kind(), ErrorKind::Insert);

        store.register(TableDescriptor::new("empty", "app"));
        assert_eq!(store.mount("empty").unwrap_err().kind(), ErrorKind::Insert);
    }

    #[test]
    fn test_mount_rejects_duplicate_ids() {
        let mut store = empty_store();
        store.register(TableDescriptor::from_rows(
            "users",
            "app",
            vec![json!({"id": 1}), json!({"id": 1})],
        ));
        let err = store.mount("users").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Insert);
    }

    #[test]
    fn test_mount_detects_cycles() {
        let mut store = empty_store();
        store.register(
            TableDescriptor::from_rows("a", "app", vec![json!({"id": 1})]).with_dependencies(&["b"]),
        );
        store.register(
            TableDescriptor::from_rows("b", "app", vec![json!({"id": 1})]).with_dependencies(&["a"]),
        );
        match store.mount("a").unwrap_err() {
            HippoDbError::DependencyCycle { chain } => assert_eq!(chain, vec!["a", "b", "a"]),
            other => panic!("expected a cycle, got {other}"),
        }

        store.register(
            TableDescriptor::from_rows("me", "app", vec![json!({"id": 1})]).with_dependencies(&["me"]),
        );
        assert!(matches!(
            store.mount("me").unwrap_err(),
            HippoDbError::DependencyCycle { .. }
        ));
    }

    #[test]
    fn test_mount_unknown_dependency() {
        let mut store = empty_store();
        store.register(
            TableDescriptor::from_rows("orders", "app", vec![json!({"id": 1})])
                .with_dependencies(&["ghosts"]),
        );
        assert_eq!(store.mount("orders").unwrap_err().kind(), ErrorKind::Lookup);
    }
}
