use crate::schema::{SchemaDocument, TableDescriptor};
use serde::Serialize;
use serde_json::Value;
use std::sync::mpsc;

/// A notification published by the store.
///
/// Row payloads are flat JSON snapshots, so handlers never hold a borrow
/// of the store.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum Event {
    Starting,
    LoadingSchema { schema: SchemaDocument },
    TablesLoaded,
    TableReady { descriptor: TableDescriptor },
    TableRowAdded { table: String, row: Value },
    TableRowModified { table: String, row: Value },
    TableRowsRemoved { table: String, rows: Vec<Value> },
    TableReverted { table: String },
    /// Follows every row-level signal above.
    TableModified { table: String },
    Dropped { table: String },
    Ready,
    Reready,
    Saved,
}

impl Event {
    /// The notification name, e.g. `table-row-added`.
    pub fn name(&self) -> &'static str {
        match self {
            Event::Starting => "starting",
            Event::LoadingSchema { .. } => "loading-schema",
            Event::TablesLoaded => "tables-loaded",
            Event::TableReady { .. } => "table-ready",
            Event::TableRowAdded { .. } => "table-row-added",
            Event::TableRowModified { .. } => "table-row-modified",
            Event::TableRowsRemoved { .. } => "table-rows-removed",
            Event::TableReverted { .. } => "table-reverted",
            Event::TableModified { .. } => "table-modified",
            Event::Dropped { .. } => "dropped",
            Event::Ready => "ready",
            Event::Reready => "reready",
            Event::Saved => "saved",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Handler = Box<dyn FnMut(&Event)>;

/// Publish/subscribe channel owned by one store.
#[derive(Default)]
pub struct EventBus {
    next_id: u64,
    handlers: Vec<(SubscriptionId, Handler)>,
    senders: Vec<mpsc::Sender<Event>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Call `handler` for every later event, in publish order.
    pub fn subscribe<F>(&mut self, handler: F) -> SubscriptionId
    where
        F: FnMut(&Event) + 'static,
    {
        self.next_id += 1;
        let id = SubscriptionId(self.next_id);
        self.handlers.push((id, Box::new(handler)));
        id
    }

    /// Returns false if `id` was not subscribed.
    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        let before = self.handlers.len();
        self.handlers.retain(|(h, _)| *h != id);
        self.handlers.len() != before
    }

    /// A receiver that gets a clone of every later event. Dropping the
    /// receiver unregisters it on the next publish.
    pub fn channel(&mut self) -> mpsc::Receiver<Event> {
        let (tx, rx) = mpsc::channel();
        self.senders.push(tx);
        rx
    }

    pub fn publish(&mut self, event: Event) {
        log::debug!("event: {}", event.name());
        for (_, handler) in self.handlers.iter_mut() {
            handler(&event);
        }
        self.senders.retain(|tx| tx.send(event.clone()).is_ok());
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("handlers", &self.handlers.len())
            .field("channels", &self.senders.len())
            .finish()
    }
}
