//! Connection manager.
//!
//! Owns the set of live connections and fans events out to them. Broadcast
//! takes a snapshot of the set and never holds a map lock while sending, so
//! connections can come and go during a fan-out.

use crate::auth::Identity;
use crate::connection::{Connection, ConnectionId, OutboundReceiver};
use crate::event::Event;
use crate::registry::PluginRegistry;
use crate::subscription::DEFAULT_MAX_SUBSCRIPTIONS;
use beacon_protocol::codec::DEFAULT_MAX_FRAME_SIZE;
use beacon_protocol::EventType;
use dashmap::DashMap;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Default capacity of each connection's outbound queue.
pub const DEFAULT_OUTBOUND_CAPACITY: usize = 1024;

/// Connection manager errors.
#[derive(Debug, Error)]
pub enum ManagerError {
    /// The server is shutting down and accepts no new connections.
    #[error("Server is shutting down")]
    ShuttingDown,

    /// A connection with the same id is already registered.
    #[error("Connection already registered: {0}")]
    AlreadyRegistered(ConnectionId),
}

/// Per-connection limits applied by the manager.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Cap on subscriptions per connection.
    pub max_subscriptions_per_connection: usize,
    /// Capacity of each connection's outbound queue.
    pub outbound_capacity: usize,
    /// Largest inbound frame accepted, in bytes.
    pub max_message_size: usize,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            max_subscriptions_per_connection: DEFAULT_MAX_SUBSCRIPTIONS,
            outbound_capacity: DEFAULT_OUTBOUND_CAPACITY,
            max_message_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }
}

/// Result of one broadcast.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastOutcome {
    /// Event frames queued, one per matching subscription.
    pub recipients: usize,
    /// Frames dropped because a queue was full.
    pub dropped: usize,
}

/// Manager statistics.
#[derive(Debug, Clone, Default)]
pub struct ManagerStats {
    pub connection_count: usize,
    pub total_subscriptions: usize,
    pub authenticated: usize,
}

/// Registry of live connections.
pub struct ConnectionManager {
    connections: DashMap<ConnectionId, Arc<Connection>>,
    registry: Arc<PluginRegistry>,
    config: ManagerConfig,
    shutdown: CancellationToken,
    idle: Notify,
}

impl ConnectionManager {
    /// Create a manager with default limits.
    #[must_use]
    pub fn new(registry: Arc<PluginRegistry>) -> Self {
        Self::with_config(registry, ManagerConfig::default())
    }

    /// Create a manager with custom limits.
    #[must_use]
    pub fn with_config(registry: Arc<PluginRegistry>, config: ManagerConfig) -> Self {
        Self {
            connections: DashMap::new(),
            registry,
            config,
            shutdown: CancellationToken::new(),
            idle: Notify::new(),
        }
    }

    /// The plugin registry shared with connections.
    #[must_use]
    pub fn registry(&self) -> &Arc<PluginRegistry> {
        &self.registry
    }

    /// Limits applied to connections.
    #[must_use]
    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    /// Create and register a connection for a freshly accepted transport.
    ///
    /// # Errors
    ///
    /// Returns [`ManagerError::ShuttingDown`] once shutdown has started.
    pub fn open(
        &self,
        identity: Option<Identity>,
    ) -> Result<(Arc<Connection>, OutboundReceiver), ManagerError> {
        let (connection, rx) = Connection::with_token(
            ConnectionId::generate(),
            identity,
            self.config.max_subscriptions_per_connection,
            self.config.outbound_capacity,
            self.shutdown.child_token(),
        );
        let connection = Arc::new(connection);
        self.register(Arc::clone(&connection))?;
        Ok((connection, rx))
    }

    /// Add a connection to the live set. It receives broadcasts immediately.
    ///
    /// # Errors
    ///
    /// Returns an error if shutdown has started or the id is already taken.
    pub fn register(&self, connection: Arc<Connection>) -> Result<(), ManagerError> {
        if self.shutdown.is_cancelled() {
            return Err(ManagerError::ShuttingDown);
        }

        match self.connections.entry(connection.id().clone()) {
            dashmap::mapref::entry::Entry::Occupied(entry) => {
                Err(ManagerError::AlreadyRegistered(entry.key().clone()))
            }
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                connection.open();
                info!(
                    connection = %connection.id(),
                    authenticated = connection.is_authenticated(),
                    "Connection registered"
                );
                entry.insert(connection);
                Ok(())
            }
        }
    }

    /// Remove a connection and release its subscriptions.
    ///
    /// Idempotent: returns `false` if the connection was not registered.
    pub fn unregister(&self, id: &ConnectionId) -> bool {
        let Some((_, connection)) = self.connections.remove(id) else {
            return false;
        };

        let released = connection.release();
        info!(
            connection = %id,
            released,
            dropped = connection.dropped_count(),
            age = ?connection.age(),
            "Connection unregistered"
        );

        if self.connections.is_empty() {
            self.idle.notify_waiters();
        }
        true
    }

    /// Fan an event out to every matching subscription.
    pub fn broadcast(&self, topic: &str, event_type: EventType, payload: Value) -> BroadcastOutcome {
        self.broadcast_event(&Event::new(topic, event_type, payload))
    }

    /// Fan a prepared event out to every matching subscription.
    ///
    /// Delivery to each connection is isolated: a full or closed queue only
    /// affects that connection.
    pub fn broadcast_event(&self, event: &Event) -> BroadcastOutcome {
        let connections: Vec<Arc<Connection>> = self
            .connections
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();

        let mut outcome = BroadcastOutcome::default();
        for connection in &connections {
            let (delivered, dropped) = connection.deliver(event);
            outcome.recipients += delivered;
            outcome.dropped += dropped;
        }

        debug!(
            topic = %event.topic,
            event_type = %event.event_type,
            recipients = outcome.recipients,
            dropped = outcome.dropped,
            "Broadcast event"
        );
        outcome
    }

    /// Look up a live connection.
    #[must_use]
    pub fn get(&self, id: &ConnectionId) -> Option<Arc<Connection>> {
        self.connections.get(id).map(|entry| Arc::clone(entry.value()))
    }

    /// Number of live connections.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Current statistics.
    #[must_use]
    pub fn stats(&self) -> ManagerStats {
        let mut stats = ManagerStats {
            connection_count: self.connections.len(),
            ..ManagerStats::default()
        };
        for entry in self.connections.iter() {
            stats.total_subscriptions += entry.subscription_count();
            if entry.is_authenticated() {
                stats.authenticated += 1;
            }
        }
        stats
    }

    /// Token cancelled when shutdown starts.
    #[must_use]
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Whether shutdown has started.
    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Close every connection and wait for them to deregister.
    ///
    /// New connections are refused from the first call. Connections still
    /// registered after `grace` are unregistered forcibly.
    pub async fn shutdown(&self, grace: Duration) {
        self.shutdown.cancel();

        let connections: Vec<Arc<Connection>> = self
            .connections
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        info!(connections = connections.len(), "Closing connections");
        for connection in &connections {
            connection.begin_close();
        }

        let drained = tokio::time::timeout(grace, async {
            loop {
                let notified = self.idle.notified();
                if self.connections.is_empty() {
                    break;
                }
                notified.await;
            }
        })
        .await;

        if drained.is_err() {
            let remaining: Vec<ConnectionId> =
                self.connections.iter().map(|entry| entry.key().clone()).collect();
            warn!(
                remaining = remaining.len(),
                "Grace period elapsed, dropping connections"
            );
            for id in &remaining {
                self.unregister(id);
            }
        }
    }
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("connections", &self.connections.len())
            .field("registry", &self.registry)
            .field("config", &self.config)
            .finish()
    }
}
