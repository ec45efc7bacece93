mod mount;
mod mutation;
mod persist;

use crate::cache::{KeyValueStore, MemoryKv, SqliteKv, VERSION};
use crate::config::StoreConfig;
use crate::error::{HippoDbError, Result};
use crate::events::{Event, EventBus, SubscriptionId};
use crate::graph::{JoinGraph, RowRef};
use crate::query::{self, Lookup, QueryResult, SearchOptions};
use crate::registry::{CheckOutcome, Registry};
use crate::schema::{infer_columns, ColumnType, TableDescriptor};
use crate::source::{FsSource, TableSource};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::mpsc;

pub use mount::MountState;

/// The main entry point for hippodb.
/// Owns the schema registry, the join graph, the event bus, and the
/// collaborators rows and snapshots come from.
pub struct Store {
    config: StoreConfig,
    source: Box<dyn TableSource>,
    cache: Box<dyn KeyValueStore>,
    registry: Registry,
    graph: JoinGraph,
    events: EventBus,
    ready: bool,
    saved_at: Option<DateTime<Utc>>,
}

/// Summary returned by [`Store::info`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoreInfo {
    #[serde(rename = "VERSION")]
    pub version: String,
    #[serde(rename = "DATE")]
    pub saved_at: Option<DateTime<Utc>>,
    /// Mounted tables, sorted.
    #[serde(rename = "TABLES")]
    pub tables: Vec<String>,
}

impl Store {
    pub fn new<S, K>(config: StoreConfig, source: S, cache: K) -> Self
    where
        S: TableSource + 'static,
        K: KeyValueStore + 'static,
    {
        let registry = Registry::new(&config.name);
        Store {
            config,
            source: Box::new(source),
            cache: Box::new(cache),
            registry,
            graph: JoinGraph::new(),
            events: EventBus::new(),
            ready: false,
            saved_at: None,
        }
    }

    /// A store reading from a data directory. Snapshots go to a sqlite
    /// file when `cache_path` is given, otherwise they live in memory.
    pub fn open(config: StoreConfig, data_dir: &Path, cache_path: Option<&Path>) -> Result<Self> {
        if !data_dir.is_dir() {
            return Err(HippoDbError::Other(format!(
                "Data directory does not exist: {}",
                data_dir.display()
            )));
        }
        let source = FsSource::new(data_dir);
        let store = match cache_path {
            Some(path) => Store::new(config, source, SqliteKv::open(path)?),
            None => Store::new(config, source, MemoryKv::new()),
        };
        Ok(store)
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn is_ready(&self) -> bool {
        self.ready
    }

    // ── Lifecycle ───────────────────────────────────────────────────

    /// Load cached snapshots, then every table that still needs loading.
    /// Fails if the store is already ready.
    pub fn init(&mut self) -> Result<()> {
        if self.ready {
            return Err(HippoDbError::Other(format!(
                "Store `{}` has already been initialized",
                self.config.name
            )));
        }
        self.events.publish(Event::Starting);
        self.load_from_cache()?;
        self.load_tables()
    }

    /// Load the configured schema document if there is one, otherwise
    /// mount whatever registered tables are pending.
    pub fn load_tables(&mut self) -> Result<()> {
        match self.config.source.clone() {
            Some(location) => self.load_schema(&location),
            None => self.load_from_fs(),
        }
    }

    /// Fetch a schema document, check every entry, then load.
    pub fn load_schema(&mut self, location: &str) -> Result<()> {
        let schema = self.source.fetch_schema(location)?;
        self.events.publish(Event::LoadingSchema {
            schema: schema.clone(),
        });
        for (_, descriptor) in schema {
            self.check(descriptor);
        }
        self.load_from_fs()
    }

    /// Fetch rows for pending tables that have none, mount every pending
    /// table, and signal that tables are loaded.
    pub fn load_from_fs(&mut self) -> Result<()> {
        let pending = self.registry.pending();

        let to_fetch: Vec<(String, String)> = pending
            .iter()
            .filter_map(|id| {
                let descriptor = self.registry.get(id)?;
                if descriptor.has_rows() {
                    return None;
                }
                descriptor.uri.clone().map(|uri| (id.clone(), uri))
            })
            .collect();

        if !to_fetch.is_empty() {
            let uris: Vec<String> = to_fetch.iter().map(|(_, uri)| uri.clone()).collect();
            log::info!("Fetching {} table(s)", uris.len());
            let payloads = self.source.fetch_rows_batch(&uris)?;
            for ((id, _), rows) in to_fetch.into_iter().zip(payloads) {
                if let Some(descriptor) = self.registry.get_mut(&id) {
                    if descriptor.columns.is_empty() {
                        if let Value::Array(items) = &rows {
                            descriptor.columns = infer_columns(items);
                        }
                    }
                    descriptor.rows = Some(rows);
                }
            }
        }

        // replaced descriptors start from scratch
        let remounted: Vec<String> = pending
            .iter()
            .filter(|id| self.graph.is_mounted(id))
            .cloned()
            .collect();
        for id in &remounted {
            self.graph.drop_table(id);
        }

        let mut state = MountState::default();
        for id in &pending {
            if state.is_done(id) {
                continue;
            }
            self.mount_with(id, &mut state)?;
        }

        self.on_tables_loaded();
        Ok(())
    }

    fn on_tables_loaded(&mut self) {
        self.events.publish(Event::TablesLoaded);
        if !self.ready {
            self.ready = true;
            self.events.publish(Event::Ready);
        } else {
            self.events.publish(Event::Reready);
        }
        if let Err(e) = self.save() {
            log::warn!("Failed to save store `{}`: {e}", self.config.name);
        }
    }

    /// Forget a table, then reload so configured tables come back.
    pub fn drop_table(&mut self, table: &str) -> Result<()> {
        log::info!("Dropping table `{table}`");
        self.registry.remove(table);
        self.graph.drop_table(table);
        self.events.publish(Event::Dropped {
            table: table.to_string(),
        });
        self.load_tables()
    }

    /// Remove this store's own snapshot and clear all in-memory state.
    pub fn reset(&mut self) -> Result<()> {
        self.cache.remove(&self.config.cache_key(&self.config.name))?;
        self.saved_at = None;
        self.registry.clear();
        self.graph.clear();
        Ok(())
    }

    /// `reset`, then load again.
    pub fn refresh(&mut self) -> Result<()> {
        self.reset()?;
        self.load_tables()
    }

    // ── Registry ────────────────────────────────────────────────────

    /// Merge an incoming descriptor into the registry.
    pub fn check(&mut self, mut descriptor: TableDescriptor) -> CheckOutcome {
        if descriptor.columns.is_empty() {
            if let Some(Value::Array(rows)) = &descriptor.rows {
                descriptor.columns = infer_columns(rows);
            }
        }
        self.registry.check(descriptor)
    }

    /// Add a descriptor as-is, e.g. a table built with
    /// [`TableDescriptor::from_rows`]. It is mounted on the next load.
    pub fn register(&mut self, descriptor: TableDescriptor) {
        self.registry.register(descriptor);
    }

    pub fn descriptor(&self, table: &str) -> Option<&TableDescriptor> {
        self.registry.get(table)
    }

    /// Column map of a table.
    pub fn describe(&self, table: &str) -> Result<&BTreeMap<String, ColumnType>> {
        self.registry.describe(table)
    }

    /// Table id -> source, sorted by id.
    pub fn list(&self, source: Option<&str>) -> BTreeMap<String, String> {
        self.registry.list(source)
    }

    pub fn info(&self) -> StoreInfo {
        StoreInfo {
            version: VERSION.to_string(),
            saved_at: self.saved_at,
            tables: self.graph.table_ids(),
        }
    }

    // ── Queries ─────────────────────────────────────────────────────

    /// A mounted table. Unknown or unmounted tables are lookup errors.
    pub fn table(&self, table: &str) -> Result<TableView<'_>> {
        let descriptor = self
            .registry
            .get(table)
            .ok_or_else(|| HippoDbError::Lookup(format!("Invalid table `{table}`")))?;
        if !self.graph.is_mounted(table) {
            return Err(HippoDbError::Lookup(format!(
                "Table `{table}` is not mounted"
            )));
        }
        Ok(TableView {
            descriptor,
            graph: &self.graph,
        })
    }

    pub fn search<L: Into<Lookup>>(&self, table: &str, lookup: L) -> Result<QueryResult<'_>> {
        self.search_opts(table, lookup, &SearchOptions::default())
    }

    pub fn search_opts<L: Into<Lookup>>(
        &self,
        table: &str,
        lookup: L,
        options: &SearchOptions,
    ) -> Result<QueryResult<'_>> {
        self.table(table)?;
        query::execute(&self.graph, table, &lookup.into(), options)
    }

    /// Run a search and hand the result to `callback`, returning its value.
    pub fn search_with<L, F, T>(
        &self,
        table: &str,
        lookup: L,
        options: &SearchOptions,
        callback: F,
    ) -> Result<T>
    where
        L: Into<Lookup>,
        F: FnOnce(QueryResult<'_>) -> T,
    {
        let result = self.search_opts(table, lookup, options)?;
        Ok(callback(result))
    }

    /// The first row matching `lookup`. An integer lookup matches by id.
    pub fn find<L: Into<Lookup>>(&self, table: &str, lookup: L) -> Result<Option<RowRef<'_>>> {
        let lookup = lookup.into();
        self.table(table)?;
        query::find(&self.graph, table, &lookup)
    }

    // ── Events ──────────────────────────────────────────────────────

    pub fn subscribe<F>(&mut self, handler: F) -> SubscriptionId
    where
        F: FnMut(&Event) + 'static,
    {
        self.events.subscribe(handler)
    }

    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        self.events.unsubscribe(id)
    }

    /// Receive a copy of every later event.
    pub fn channel(&mut self) -> mpsc::Receiver<Event> {
        self.events.channel()
    }
}

/// A mounted table, borrowed from the store.
#[derive(Clone, Copy)]
pub struct TableView<'a> {
    descriptor: &'a TableDescriptor,
    graph: &'a JoinGraph,
}

impl<'a> TableView<'a> {
    pub fn id(&self) -> &'a str {
        &self.descriptor.id
    }

    pub fn descriptor(&self) -> &'a TableDescriptor {
        self.descriptor
    }

    /// Rows in live order.
    pub fn rows(&self) -> Vec<RowRef<'a>> {
        self.graph.rows(&self.descriptor.id).unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.graph
            .table(&self.descriptor.id)
            .map_or(0, |t| t.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn to_values(&self) -> Vec<Value> {
        self.rows().iter().map(|r| r.to_value()).collect()
    }

    pub fn search<L: Into<Lookup>>(&self, lookup: L, options: &SearchOptions) -> Result<QueryResult<'a>> {
        query::execute(self.graph, &self.descriptor.id, &lookup.into(), options)
    }

    pub fn find<L: Into<Lookup>>(&self, lookup: L) -> Result<Option<RowRef<'a>>> {
        query::find(self.graph, &self.descriptor.id, &lookup.into())
    }
}

impl std::fmt::Debug for TableView<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TableView")
            .field("id", &self.descriptor.id)
            .field("rows", &self.len())
            .finish()
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use crate::graph::{Joined, RowKey};
    use crate::registry::CheckOutcome;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[test]
    fn test_users_and_orders_join() {
        let store = mounted_store();
        let order = store.find("orders", 1_i64).unwrap().unwrap();
        assert_eq!(order.resolve("user.name").unwrap().to_value(), json!("Alice"));

        let alice = store.find("users", 1_i64).unwrap().unwrap();
        match alice.get("orders") {
            Some(Joined::Rows(rows)) => {
                let ids: Vec<_> = rows.iter().map(|r| r.id().clone()).collect();
                assert_eq!(ids, vec![RowKey::Int(1)]);
            }
            other => panic!("expected back-referenced orders, got {other:?}"),
        }
        assert_eq!(
            order.to_joined_value()["user"],
            json!({"id": 1, "name": "Alice", "profile": {"age": 31}})
        );
    }

    #[test]
    fn test_find_returns_the_same_row() {
        let mut store = mounted_store();
        store.mount("orders").unwrap();

        let first = store.find("users", 1_i64).unwrap().unwrap();
        let second = store.find("users", 1_i64).unwrap().unwrap();
        assert!(first.same_row(&second));
        assert_eq!(first.back_refs("orders").len(), 1);

        let via_order = store.find("orders", 1_i64).unwrap().unwrap().linked("user").unwrap();
        assert!(via_order.same_row(&first));
    }

    #[test]
    fn test_find_misses_and_bad_lookups() {
        let store = mounted_store();
        assert!(store.find("users", 42_i64).unwrap().is_none());
        assert!(store.find("users", Lookup::pairs([("name", "zed")])).unwrap().is_none());
        assert!(store.find("users", 0_i64).is_err());
        assert!(store.find("ghosts", 1_i64).is_err());
    }

    #[test]
    fn test_search_forms() {
        let store = mounted_store();
        let all = store.search("orders", "*").unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all.first().unwrap().id(), &RowKey::Int(1));
        assert_eq!(all.last().unwrap().id(), &RowKey::Int(2));

        let rich = store
            .search("orders", Lookup::pairs([("total", ">15")]))
            .unwrap();
        assert_eq!(rich.to_values(), vec![json!({"id": 2, "user_id": 2, "total": 20})]);

        let by_user = store
            .search("orders", Lookup::pairs([("user.name", "^ali")]))
            .unwrap();
        assert_eq!(by_user.len(), 1);

        assert!(store.search("orders", "total > 3").is_err());

        let options = SearchOptions::default().with_sort_by("total");
        let names = store
            .search_with("users", "name", &options, |result| {
                result
                    .iter()
                    .map(|r| r.data()["name"].as_str().unwrap_or_default().to_string())
                    .collect::<Vec<_>>()
            })
            .unwrap();
        assert_eq!(names, vec!["Alice", "Bob"]);
    }

    #[test]
    fn test_table_view() {
        let mut store = mounted_store();
        let users = store.table("users").unwrap();
        assert_eq!(users.id(), "users");
        assert_eq!(users.len(), 2);
        assert!(users.find(2_i64).unwrap().is_some());
        assert_eq!(users.search("profile", &SearchOptions::default()).unwrap().len(), 1);

        assert_eq!(store.table("ghosts").unwrap_err().kind(), crate::error::ErrorKind::Lookup);
        let mut skipped = TableDescriptor::new("later", "app").with_uri("later.json");
        skipped.skip = true;
        store.register(skipped);
        assert_eq!(store.table("later").unwrap_err().kind(), crate::error::ErrorKind::Lookup);
    }

    #[test]
    fn test_init_lifecycle_events() {
        let mut store = fresh_store(StoreConfig::default(), MemoryKv::new());
        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = seen.clone();
        store.subscribe(move |e| sink.borrow_mut().push(e.name()));

        assert!(!store.is_ready());
        store.init().unwrap();
        assert!(store.is_ready());
        assert_eq!(
            *seen.borrow(),
            vec!["starting", "table-ready", "table-ready", "tables-loaded", "ready", "saved"]
        );

        seen.borrow_mut().clear();
        store.load_tables().unwrap();
        assert_eq!(*seen.borrow(), vec!["tables-loaded", "reready", "saved"]);

        assert!(store.init().is_err());
    }

    #[test]
    fn test_configured_schema_is_checked() {
        let config = StoreConfig::default().with_source("schema.json");
        let mut store = fresh_store(config, MemoryKv::new());
        let rx = store.channel();
        store.init().unwrap();

        let names: Vec<&str> = rx.try_iter().map(|e| e.name()).collect();
        assert_eq!(names[..2], ["starting", "loading-schema"]);
        assert_eq!(store.table("orders").unwrap().len(), 2);

        let users = store.descriptor("users").unwrap().clone();
        assert_eq!(store.check(users), CheckOutcome::Kept);
        assert!(store.descriptor("users").unwrap().loaded);
    }

    #[test]
    fn test_skipped_tables_are_not_loaded() {
        let mut store = fresh_store(StoreConfig::default(), MemoryKv::new());
        let mut skipped = TableDescriptor::new("archive", "app").with_uri("archive.json");
        skipped.skip = true;
        store.register(skipped);
        store.init().unwrap();
        assert!(store.table("archive").is_err());
        assert_eq!(store.list(None).len(), 3);
    }

    #[test]
    fn test_describe_list_info() {
        let mut store = mounted_store();
        store.register(TableDescriptor::from_rows("tags", "other", vec![json!({"id": 1})]));

        assert_eq!(store.describe("orders").unwrap()["user_id"], ColumnType::ForeignKey);
        assert!(store.describe("ghosts").is_err());

        let listed: Vec<_> = store.list(None).into_keys().collect();
        assert_eq!(listed, vec!["orders", "tags", "users"]);
        assert_eq!(store.list(Some("other")).len(), 1);

        let info = store.info();
        assert_eq!(info.version, VERSION);
        assert_eq!(info.tables, vec!["orders", "users"]);
        assert!(info.saved_at.is_some());
        let json = serde_json::to_value(&info).unwrap();
        assert_eq!(json["TABLES"], json!(["orders", "users"]));
    }

    #[test]
    fn test_drop_table_reloads_configured_tables() {
        let config = StoreConfig::default().with_source("schema.json");
        let mut store = fresh_store(config, MemoryKv::new());
        store.init().unwrap();

        store.drop_table("orders").unwrap();
        assert_eq!(store.table("orders").unwrap().len(), 2);
        let alice = store.find("users", 1_i64).unwrap().unwrap();
        assert_eq!(alice.back_refs("orders").len(), 1);

        let mut plain = mounted_store();
        plain.drop_table("orders").unwrap();
        assert!(plain.table("orders").is_err());
        assert!(plain.descriptor("orders").is_none());
        let alice = plain.find("users", 1_i64).unwrap().unwrap();
        assert!(alice.back_refs("orders").is_empty());
    }

    #[test]
    fn test_drop_referenced_table_restores_back_refs() {
        let config = StoreConfig::default().with_source("schema.json");
        let mut store = fresh_store(config, MemoryKv::new());
        store.init().unwrap();

        store.drop_table("users").unwrap();
        let order = store.find("orders", 1_i64).unwrap().unwrap();
        let alice = store.find("users", 1_i64).unwrap().unwrap();
        assert!(order.linked("user").unwrap().same_row(&alice));
        let ids: Vec<_> = alice.back_refs("orders").iter().map(|r| r.id().clone()).collect();
        assert_eq!(ids, vec![RowKey::Int(1)]);
        let bob = store.find("users", 2_i64).unwrap().unwrap();
        assert_eq!(bob.back_refs("orders").len(), 1);
    }

    #[test]
    fn test_remount_replaces_inserted_rows() {
        let mut store = mounted_store();
        let id = store
            .insert("orders", json!({"user_id": 1, "total": 3}), false)
            .unwrap()
            .id()
            .clone();
        assert_eq!(id, RowKey::Int(3));

        store.mount("orders").unwrap();
        assert_eq!(store.search("orders", "*").unwrap().len(), 2);
        assert!(store.find("orders", 3_i64).unwrap().is_none());
        let alice = store.find("users", 1_i64).unwrap().unwrap();
        assert_eq!(alice.back_refs("orders").len(), 1);

        store
            .insert("orders", json!({"id": 3, "user_id": 1, "total": 4}), false)
            .unwrap();
        assert_eq!(store.search("orders", "*").unwrap().len(), 3);
        let alice = store.find("users", 1_i64).unwrap().unwrap();
        assert_eq!(alice.back_refs("orders").len(), 2);
    }

    #[test]
    fn test_reset_and_refresh() {
        let kv = MemoryKv::new();
        let config = StoreConfig {
            name: "app".into(),
            source: Some("schema.json".into()),
            ..StoreConfig::default()
        };
        let mut store = Store::new(config, app_source(), kv.clone());
        store.init().unwrap();
        assert_eq!(kv.keys().unwrap(), vec!["hippodb.app"]);

        store.reset().unwrap();
        assert!(kv.is_empty());
        assert!(store.list(None).is_empty());
        assert_eq!(store.info().tables, Vec::<String>::new());
        assert_eq!(store.info().saved_at, None);

        store.refresh().unwrap();
        assert_eq!(store.table("users").unwrap().len(), 2);
        assert_eq!(kv.len(), 1);
    }
}
