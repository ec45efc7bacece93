pub mod cache;
pub mod config;
pub mod error;
pub mod events;
pub mod graph;
pub mod predicate;
pub mod query;
pub mod registry;
pub mod schema;
pub mod source;
pub mod store;

pub use cache::{KeyValueStore, MemoryKv, SqliteKv};
pub use config::StoreConfig;
pub use error::{ErrorKind, HippoDbError, Result};
pub use events::{Event, SubscriptionId};
pub use graph::{Joined, RowKey, RowRef};
pub use predicate::Criterion;
pub use query::{Lookup, QueryResult, SearchOptions};
pub use schema::{ColumnType, SchemaDocument, TableDescriptor};
pub use source::{FsSource, MemorySource, TableSource};
pub use store::{Store, StoreInfo, TableView};
