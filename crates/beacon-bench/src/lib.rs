//! Shared fixtures for the Beacon benchmarks.

use async_trait::async_trait;
use beacon_core::{
    ConnectionManager, EntityPlugin, Identity, ListQuery, OutboundReceiver, Page,
    PluginRegistry, RecordStore, StoreError,
};
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::runtime::Runtime;

/// Topic served by [`TickPlugin`].
pub const TOPIC: &str = "tick";

/// A minimal entity.
#[derive(Debug, Clone)]
pub struct Tick {
    pub id: u64,
    pub value: f64,
}

struct EmptyStore;

#[async_trait]
impl RecordStore<Tick> for EmptyStore {
    async fn list(&self, _query: &ListQuery) -> Result<Page<Tick>, StoreError> {
        Ok(Page::empty())
    }
}

/// Plugin for [`Tick`] with an empty backing store.
pub struct TickPlugin;

impl EntityPlugin for TickPlugin {
    type Entity = Tick;
    const TOPIC: &'static str = TOPIC;

    fn project(&self, tick: &Tick) -> Value {
        json!({"id": tick.id, "value": tick.value})
    }

    fn store(&self) -> &dyn RecordStore<Tick> {
        &EmptyStore
    }
}

/// A manager with `connections` authenticated clients, each holding
/// `subscriptions` subscriptions to [`TOPIC`].
pub struct Fanout {
    pub manager: Arc<ConnectionManager>,
    pub receivers: Vec<OutboundReceiver>,
}

impl Fanout {
    /// Build the fixture, driving subscribe frames on `rt`.
    ///
    /// # Panics
    ///
    /// Panics if a subscription is rejected.
    pub fn new(rt: &Runtime, connections: usize, subscriptions: usize) -> Self {
        let registry = PluginRegistry::new()
            .with(TickPlugin)
            .expect("register tick plugin");
        let manager = Arc::new(ConnectionManager::new(Arc::new(registry)));
        let frame = format!(r#"{{"type":"subscribe","topic":"{TOPIC}"}}"#);

        let mut receivers = Vec::with_capacity(connections);
        for i in 0..connections {
            let (conn, rx) = manager
                .open(Some(Identity::new(format!("bench-{i}"))))
                .expect("open connection");
            for _ in 0..subscriptions {
                let rejected = rt.block_on(manager.handle_text(&conn, &frame));
                assert!(rejected.is_none(), "subscribe rejected: {rejected:?}");
            }
            receivers.push(rx);
        }

        let mut fixture = Self { manager, receivers };
        fixture.drain();
        fixture
    }

    /// Discard everything queued for the clients. Returns the message count.
    pub fn drain(&mut self) -> usize {
        let mut drained = 0;
        for rx in &mut self.receivers {
            while rx.try_recv().is_ok() {
                drained += 1;
            }
        }
        drained
    }
}
