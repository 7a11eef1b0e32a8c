//! Event processor.
//!
//! The entry point for the mutation layer. [`EventProcessor::publish`] builds
//! the payload on the caller's task and hands the event to a bounded queue;
//! a single dispatcher task drains the queue and broadcasts. Events are
//! broadcast in the order they were published.

use crate::event::Event;
use crate::manager::{BroadcastOutcome, ConnectionManager};
use crate::plugin::PluginError;
use crate::registry::PluginRegistry;
use beacon_protocol::EventType;
use serde_json::Value;
use std::any::Any;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

/// Default capacity of the event queue.
pub const DEFAULT_EVENT_QUEUE_CAPACITY: usize = 4096;

/// Publish errors. None of these are caused by a client.
#[derive(Debug, Error)]
pub enum PublishError {
    /// No plugin is registered for the topic.
    #[error("No plugin registered for topic '{0}'")]
    UnknownTopic(String),

    /// The plugin could not project the entity.
    #[error(transparent)]
    Plugin(#[from] PluginError),

    /// The event queue is full; the event was dropped.
    #[error("Event queue full")]
    QueueFull,

    /// The dispatcher has stopped.
    #[error("Event processor stopped")]
    Closed,
}

/// Handle used by the mutation layer to publish entity changes.
#[derive(Clone)]
pub struct EventProcessor {
    registry: Arc<PluginRegistry>,
    queue: mpsc::Sender<Event>,
}

impl EventProcessor {
    /// Start a dispatcher broadcasting through `manager`.
    #[must_use]
    pub fn spawn(manager: Arc<ConnectionManager>, capacity: usize) -> (Self, JoinHandle<()>) {
        Self::spawn_with(manager, capacity, |_, _| {})
    }

    /// Start a dispatcher that also reports each broadcast to `on_broadcast`.
    ///
    /// The dispatcher stops when every handle is dropped or the manager
    /// starts shutting down.
    pub fn spawn_with<F>(
        manager: Arc<ConnectionManager>,
        capacity: usize,
        on_broadcast: F,
    ) -> (Self, JoinHandle<()>)
    where
        F: Fn(&Event, BroadcastOutcome) + Send + 'static,
    {
        let (queue, mut rx) = mpsc::channel::<Event>(capacity.max(1));
        let registry = Arc::clone(manager.registry());
        let shutdown = manager.shutdown_token();

        let handle = tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => break,
                    event = rx.recv() => match event {
                        Some(event) => event,
                        None => break,
                    },
                };

                let outcome = manager.broadcast_event(&event);
                on_broadcast(&event, outcome);
            }
            debug!("Event dispatcher stopped");
        });

        (Self { registry, queue }, handle)
    }

    /// Publish a change to `entity` on `topic`.
    ///
    /// Never waits: the payload is built here and delivery happens on the
    /// dispatcher task. Failures are logged and returned, but callers are not
    /// expected to act on them.
    ///
    /// # Errors
    ///
    /// Returns an error if the topic has no plugin, the plugin rejects the
    /// entity, or the queue cannot take the event.
    pub fn publish<E>(&self, topic: &str, event_type: EventType, entity: &E) -> Result<(), PublishError>
    where
        E: Any + Send + Sync,
    {
        let Some(plugin) = self.registry.lookup(topic) else {
            warn!(topic, event_type = %event_type, "Dropping event for unregistered topic");
            return Err(PublishError::UnknownTopic(topic.to_string()));
        };

        let payload = plugin.to_payload(entity).map_err(|e| {
            warn!(topic, event_type = %event_type, error = %e, "Dropping event");
            PublishError::from(e)
        })?;

        self.enqueue(Event::new(topic, event_type, payload))
    }

    /// Publish an already projected payload.
    ///
    /// # Errors
    ///
    /// Returns an error if the topic has no plugin or the queue cannot take
    /// the event.
    pub fn publish_payload(
        &self,
        topic: &str,
        event_type: EventType,
        payload: Value,
    ) -> Result<(), PublishError> {
        if !self.registry.is_valid_topic(topic) {
            warn!(topic, event_type = %event_type, "Dropping event for unregistered topic");
            return Err(PublishError::UnknownTopic(topic.to_string()));
        }
        self.enqueue(Event::new(topic, event_type, payload))
    }

    fn enqueue(&self, event: Event) -> Result<(), PublishError> {
        match self.queue.try_send(event) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(event)) => {
                warn!(topic = %event.topic, event_type = %event.event_type, "Event queue full, dropping event");
                Err(PublishError::QueueFull)
            }
            Err(TrySendError::Closed(event)) => {
                trace!(topic = %event.topic, "Event processor stopped, dropping event");
                Err(PublishError::Closed)
            }
        }
    }
}

impl std::fmt::Debug for EventProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventProcessor")
            .field("queued", &(self.queue.max_capacity() - self.queue.capacity()))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::Identity;
    use crate::connection::{Connection, OutboundReceiver};
    use crate::plugin::tests::{Widget, WidgetPlugin, WidgetStore};
    use crate::plugin::EntityPlugin;
    use crate::store::RecordStore;
    use crate::subscription::EventFilter;
    use beacon_protocol::ServerMessage;
    use serde_json::json;
    use std::time::Duration;

    /// Second topic over the same entity type.
    struct GizmoPlugin {
        store: WidgetStore,
    }

    impl EntityPlugin for GizmoPlugin {
        type Entity = Widget;
        const TOPIC: &'static str = "gizmo";

        fn project(&self, entity: &Widget) -> Value {
            json!({"id": entity.id})
        }

        fn store(&self) -> &dyn RecordStore<Widget> {
            &self.store
        }
    }

    fn manager() -> Arc<ConnectionManager> {
        let registry = PluginRegistry::new()
            .with(WidgetPlugin::with_records(0))
            .unwrap()
            .with(GizmoPlugin {
                store: WidgetStore { count: 0 },
            })
            .unwrap();
        Arc::new(ConnectionManager::new(Arc::new(registry)))
    }

    fn activate(manager: &ConnectionManager, conn: &Connection, topic: &str, filter: EventFilter) {
        let id = conn
            .subscriptions_mut()
            .subscribe(manager.registry(), topic, filter)
            .unwrap()
            .id
            .clone();
        conn.subscriptions_mut().activate(&id);
    }

    fn subscriber(manager: &ConnectionManager, filter: EventFilter) -> (Arc<Connection>, OutboundReceiver) {
        let (conn, rx) = manager.open(Some(Identity::new("admin"))).unwrap();
        activate(manager, &conn, "widget", filter);
        (conn, rx)
    }

    fn widget(id: u64) -> Widget {
        Widget {
            id,
            name: format!("widget-{id}"),
        }
    }

    async fn next_event(rx: &mut OutboundReceiver) -> (EventType, Value) {
        let message = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("timed out waiting for event")
            .unwrap();
        match message {
            ServerMessage::Event {
                event_type, data, ..
            } => (event_type, (*data).clone()),
            other => panic!("Expected Event, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_publish_reaches_subscriber() {
        let manager = manager();
        let (processor, _handle) = EventProcessor::spawn(Arc::clone(&manager), 16);
        let (_conn, mut rx) = subscriber(&manager, EventFilter::all());

        processor
            .publish("widget", EventType::Created, &widget(1))
            .unwrap();

        let (event_type, data) = next_event(&mut rx).await;
        assert_eq!(event_type, EventType::Created);
        assert_eq!(data["name"], "widget-1");
    }

    #[tokio::test]
    async fn test_publish_preserves_order() {
        let manager = manager();
        let (processor, _handle) = EventProcessor::spawn(Arc::clone(&manager), 128);
        let (_conn, mut rx) = subscriber(&manager, EventFilter::all());

        for id in 0..50 {
            processor
                .publish("widget", EventType::Updated, &widget(id))
                .unwrap();
        }

        for id in 0..50 {
            let (_, data) = next_event(&mut rx).await;
            assert_eq!(data["id"], id);
        }
    }

    #[tokio::test]
    async fn test_publish_preserves_order_across_topics() {
        let manager = manager();
        let (processor, _handle) = EventProcessor::spawn(Arc::clone(&manager), 128);
        let (conn, mut rx) = subscriber(&manager, EventFilter::all());
        activate(&manager, &conn, "gizmo", EventFilter::all());

        let mut published = Vec::new();
        for id in 0..30 {
            let topic = if id % 3 == 0 { "gizmo" } else { "widget" };
            processor
                .publish(topic, EventType::Created, &widget(id))
                .unwrap();
            published.push((topic.to_string(), id));
        }

        let mut received = Vec::new();
        for _ in 0..published.len() {
            let message = tokio::time::timeout(Duration::from_secs(1), rx.recv())
                .await
                .expect("timed out waiting for event")
                .unwrap();
            match message {
                ServerMessage::Event { topic, data, .. } => {
                    received.push((topic, data["id"].as_u64().unwrap()));
                }
                other => panic!("Expected Event, got {:?}", other),
            }
        }
        assert_eq!(received, published);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_publish_filters_event_types() {
        let manager = manager();
        let (processor, _handle) = EventProcessor::spawn(Arc::clone(&manager), 16);
        let (_conn, mut rx) = subscriber(&manager, EventFilter::from_types(&[EventType::Deleted]));

        processor
            .publish("widget", EventType::Created, &widget(1))
            .unwrap();
        processor
            .publish("widget", EventType::Deleted, &widget(2))
            .unwrap();

        let (event_type, data) = next_event(&mut rx).await;
        assert_eq!(event_type, EventType::Deleted);
        assert_eq!(data["id"], 2);
    }

    #[tokio::test]
    async fn test_publish_unknown_topic() {
        let manager = manager();
        let (processor, _handle) = EventProcessor::spawn(manager, 16);

        match processor.publish("gadget", EventType::Created, &widget(1)) {
            Err(PublishError::UnknownTopic(topic)) => assert_eq!(topic, "gadget"),
            other => panic!("Expected UnknownTopic error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_publish_wrong_entity() {
        let manager = manager();
        let (processor, _handle) = EventProcessor::spawn(manager, 16);

        let result = processor.publish("widget", EventType::Created, &42_u32);
        assert!(matches!(
            result,
            Err(PublishError::Plugin(PluginError::EntityMismatch { .. }))
        ));
    }

    #[tokio::test]
    async fn test_publish_queue_full() {
        let manager = manager();
        let (processor, _handle) = EventProcessor::spawn(manager, 1);

        processor
            .publish_payload("widget", EventType::Created, Value::Null)
            .unwrap();
        assert!(matches!(
            processor.publish_payload("widget", EventType::Created, Value::Null),
            Err(PublishError::QueueFull)
        ));
    }

    #[tokio::test]
    async fn test_dispatcher_stops_on_shutdown() {
        let manager = manager();
        let (processor, handle) = EventProcessor::spawn(Arc::clone(&manager), 16);

        manager.shutdown(Duration::from_millis(10)).await;
        handle.await.unwrap();

        assert!(matches!(
            processor.publish_payload("widget", EventType::Created, Value::Null),
            Err(PublishError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_broadcast_callback() {
        let manager = manager();
        let (tx, mut outcomes) = mpsc::unbounded_channel();
        let (processor, _handle) = EventProcessor::spawn_with(Arc::clone(&manager), 16, move |_, outcome| {
            tx.send(outcome).ok();
        });
        let (_conn, _rx) = subscriber(&manager, EventFilter::all());

        processor
            .publish("widget", EventType::Created, &widget(1))
            .unwrap();
        let outcome = outcomes.recv().await.unwrap();
        assert_eq!(outcome.recipients, 1);
    }
}
