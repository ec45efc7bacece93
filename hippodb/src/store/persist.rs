use super::Store;
use crate::cache::{self, CacheRecord};
use crate::error::Result;
use crate::events::Event;
use chrono::Utc;
use serde_json::Map;
use std::collections::BTreeMap;

impl Store {
    /// Write one snapshot per source.
    ///
    /// Without `save_tables` the stored descriptors have their ready and
    /// loaded flags cleared, so loading the snapshot mounts them again
    /// from their raw rows. Bundles are written one by one; a failure can
    /// leave earlier ones updated.
    pub fn save(&mut self) -> Result<()> {
        let now = Utc::now();
        self.saved_at = Some(now);

        let mut bundles: BTreeMap<String, CacheRecord> = BTreeMap::new();
        for (source, descriptors) in self.registry.by_source() {
            let mut record = CacheRecord::new(now, self.config.save_tables);
            for descriptor in descriptors {
                let id = descriptor.id.clone();
                let mut descriptor = descriptor.clone();
                match record.tables.as_mut() {
                    Some(tables) => {
                        if let Some(rows) = cache::decycle_table(&self.graph, &id) {
                            tables.insert(id.clone(), rows);
                        }
                    }
                    None => {
                        descriptor.ready = false;
                        descriptor.loaded = false;
                    }
                }
                record.schema.insert(id, descriptor);
            }
            bundles.insert(source, record);
        }

        for (source, record) in &bundles {
            let blob = cache::encode(record, self.config.compress)?;
            self.cache.set(&self.config.cache_key(source), &blob)?;
            log::debug!(
                "Saved {} table(s) for source `{source}` ({} bytes)",
                record.schema.len(),
                blob.len()
            );
        }

        self.events.publish(Event::Saved);
        Ok(())
    }

    /// Install every current snapshot under this store's namespace.
    ///
    /// Entries written by another library version, or that cannot be
    /// decoded, are removed with a warning. Cached live tables are
    /// restored as-is; descriptors with raw rows but no cached table are
    /// mounted; the rest wait for the next load.
    pub fn load_from_cache(&mut self) -> Result<()> {
        let prefix = self.config.cache_prefix();
        let mut to_mount = Vec::new();

        for key in self.cache.keys()? {
            if !key.starts_with(&prefix) {
                continue;
            }
            let Some(blob) = self.cache.get(&key)? else {
                continue;
            };
            let record = match cache::decode(&blob) {
                Ok(record) => record,
                Err(e) => {
                    log::warn!("Discarding unreadable cache entry `{key}`: {e}");
                    self.cache.remove(&key)?;
                    continue;
                }
            };
            if !record.is_current() {
                log::warn!(
                    "Cache entry `{key}` was written by version {} (this is {}); discarding it",
                    record.version,
                    cache::VERSION
                );
                self.cache.remove(&key)?;
                continue;
            }

            self.saved_at = Some(record.date);
            let cached = record.tables.unwrap_or_default();
            let mut restore = Map::new();
            for (id, descriptor) in record.schema {
                if let Some(rows) = cached.get(&id) {
                    restore.insert(id.clone(), rows.clone());
                } else if !descriptor.skip && descriptor.has_rows() {
                    to_mount.push(id.clone());
                }
                self.registry.register(descriptor);
            }
            let installed = cache::retrocycle_tables(&mut self.graph, &restore)?;
            log::info!("Loaded `{key}` ({} cached table(s))", installed.len());
        }

        let mut state = super::MountState::default();
        for id in &to_mount {
            if !state.is_done(id) {
                self.mount_with(id, &mut state)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::cache::{self, KeyValueStore, MemoryKv};
    use crate::config::StoreConfig;
    use crate::graph::RowKey;
    use crate::store::test_support::{app_source, fresh_store};
    use crate::store::Store;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_save_partitions_by_source() {
        let kv = MemoryKv::new();
        let mut store = fresh_store(StoreConfig::default(), kv.clone());
        store.register(crate::schema::TableDescriptor::from_rows(
            "tags",
            "other",
            vec![json!({"id": 1, "label": "red"})],
        ));
        store.init().unwrap();

        assert_eq!(kv.keys().unwrap(), vec!["hippodb.app", "hippodb.other"]);
        let record = cache::decode(&kv.get("hippodb.app").unwrap().unwrap()).unwrap();
        assert_eq!(record.schema.keys().collect::<Vec<_>>(), vec!["orders", "users"]);
        assert!(record.tables.is_none());
        assert!(!record.schema["users"].ready);
        assert!(!record.schema["users"].loaded);
        assert!(record.schema["users"].has_rows());
    }

    #[test]
    fn test_round_trip_schema_only() {
        let kv = MemoryKv::new();
        let mut first = fresh_store(StoreConfig::default(), kv.clone());
        first.init().unwrap();

        let mut second = Store::new(StoreConfig::default(), app_source(), kv.clone());
        second.load_from_cache().unwrap();
        assert_eq!(second.list(None), first.list(None));
        assert_eq!(second.describe("orders").unwrap(), first.describe("orders").unwrap());

        let order = second.find("orders", 1_i64).unwrap().unwrap();
        assert_eq!(order.resolve("user.name").unwrap().to_value(), json!("Alice"));
    }

    #[test]
    fn test_round_trip_with_tables() {
        let kv = MemoryKv::new();
        let config = StoreConfig::default().with_save_tables(true);
        let mut first = fresh_store(config.clone(), kv.clone());
        first.init().unwrap();
        first.insert("users", json!({"name": "Carol"}), false).unwrap();

        let source = app_source();
        let mut second = Store::new(config, source, kv.clone());
        second.load_from_cache().unwrap();

        let rows = |s: &Store| s.table("users").unwrap().to_values();
        assert_eq!(rows(&second), rows(&first));
        let carol = second.find("users", 3_i64).unwrap().unwrap();
        assert_eq!(carol.data()["name"], json!("Carol"));

        let alice = second.find("users", 1_i64).unwrap().unwrap();
        let orders = alice.back_refs("orders");
        assert_eq!(orders.len(), 1);
        assert!(orders[0].linked("user").unwrap().same_row(&alice));
        assert_eq!(second.info().saved_at, first.info().saved_at);
    }

    #[test]
    fn test_cached_tables_are_not_refetched() {
        let kv = MemoryKv::new();
        let config = StoreConfig::default().with_source("schema.json");
        let mut first = Store::new(config.clone(), app_source(), kv.clone());
        first.init().unwrap();

        let source = std::rc::Rc::new(app_source());
        let mut second = Store::new(config, SharedSource(source.clone()), kv.clone());
        second.init().unwrap();
        assert_eq!(source.fetch_count(), 0);
        assert_eq!(second.table("orders").unwrap().len(), 2);
    }

    #[test]
    fn test_version_mismatch_is_discarded() {
        let kv = MemoryKv::new();
        let mut first = fresh_store(StoreConfig::default(), kv.clone());
        first.init().unwrap();

        let mut record = cache::decode(&kv.get("hippodb.app").unwrap().unwrap()).unwrap();
        record.version = "0.0.1".into();
        kv.set("hippodb.app", &cache::encode(&record, false).unwrap()).unwrap();
        kv.set("hippodb.junk", b"not a blob").unwrap();
        kv.set("elsewhere.app", b"not ours").unwrap();

        let mut second = Store::new(StoreConfig::default(), app_source(), kv.clone());
        second.load_from_cache().unwrap();
        assert!(second.list(None).is_empty());
        assert_eq!(kv.keys().unwrap(), vec!["elsewhere.app"]);
    }

    #[test]
    fn test_uncompressed_blobs_still_load() {
        let kv = MemoryKv::new();
        let config = StoreConfig::default().with_compress(false);
        let mut first = fresh_store(config, kv.clone());
        first.init().unwrap();
        assert_eq!(kv.get("hippodb.app").unwrap().unwrap()[4], 0);

        let mut second = Store::new(StoreConfig::default(), app_source(), kv);
        second.load_from_cache().unwrap();
        assert!(second.find("users", RowKey::Int(2)).unwrap().is_some());
    }

    /// Lets a test keep a handle on the source after the store takes it.
    struct SharedSource(std::rc::Rc<crate::source::MemorySource>);

    impl crate::source::TableSource for SharedSource {
        fn fetch_schema(&self, location: &str) -> crate::error::Result<crate::schema::SchemaDocument> {
            self.0.fetch_schema(location)
        }

        fn fetch_rows(&self, uri: &str) -> crate::error::Result<serde_json::Value> {
            self.0.fetch_rows(uri)
        }
    }
}
