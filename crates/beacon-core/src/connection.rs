//! Live client connections.
//!
//! A [`Connection`] is shared between the task reading the client's frames,
//! the task writing its outbound queue, and the broadcaster. Only the reading
//! task mutates its subscription table; the broadcaster reads it.

use crate::auth::Identity;
use crate::event::Event;
use crate::subscription::SubscriptionTable;
use beacon_protocol::ServerMessage;
use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
use tracing::{trace, warn};
use uuid::Uuid;

/// Receiving half of a connection's outbound queue, drained by its writer.
pub type OutboundReceiver = mpsc::Receiver<ServerMessage>;

/// Unique identifier for a connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionId(String);

impl ConnectionId {
    /// Create a connection ID from an existing string.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a random connection ID of the form `client_<12 hex>`.
    #[must_use]
    pub fn generate() -> Self {
        let hex = Uuid::new_v4().simple().to_string();
        Self(format!("client_{}", &hex[..12]))
    }

    /// Get the ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ConnectionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Protocol state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    /// Accepted by the transport, not yet registered.
    Connecting = 0,
    /// Registered and processing frames.
    Open = 1,
    /// Teardown started; frames are ignored and nothing new is enqueued.
    Closing = 2,
    /// Deregistered; subscriptions released.
    Closed = 3,
}

impl ConnectionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ConnectionState::Connecting,
            1 => ConnectionState::Open,
            2 => ConnectionState::Closing,
            _ => ConnectionState::Closed,
        }
    }
}

/// Reasons a message could not be queued for a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum EnqueueError {
    /// The outbound queue is full; the message was dropped.
    #[error("Outbound queue full")]
    Full,

    /// The connection is closing or closed.
    #[error("Connection closed")]
    Closed,
}

/// One live client session.
pub struct Connection {
    id: ConnectionId,
    identity: Option<Identity>,
    outbound: mpsc::Sender<ServerMessage>,
    subscriptions: RwLock<SubscriptionTable>,
    state: AtomicU8,
    dropped: AtomicU64,
    closing: CancellationToken,
    connected_at: Instant,
}

impl Connection {
    /// Create a connection and the receiving half of its outbound queue.
    #[must_use]
    pub fn new(
        identity: Option<Identity>,
        max_subscriptions: usize,
        outbound_capacity: usize,
    ) -> (Self, OutboundReceiver) {
        Self::with_token(
            ConnectionId::generate(),
            identity,
            max_subscriptions,
            outbound_capacity,
            CancellationToken::new(),
        )
    }

    pub(crate) fn with_token(
        id: ConnectionId,
        identity: Option<Identity>,
        max_subscriptions: usize,
        outbound_capacity: usize,
        closing: CancellationToken,
    ) -> (Self, OutboundReceiver) {
        let (outbound, rx) = mpsc::channel(outbound_capacity.max(1));
        let connection = Self {
            id,
            identity,
            outbound,
            subscriptions: RwLock::new(SubscriptionTable::new(max_subscriptions)),
            state: AtomicU8::new(ConnectionState::Connecting as u8),
            dropped: AtomicU64::new(0),
            closing,
            connected_at: Instant::now(),
        };
        (connection, rx)
    }

    /// Connection identifier.
    #[must_use]
    pub fn id(&self) -> &ConnectionId {
        &self.id
    }

    /// Authenticated identity, if any.
    #[must_use]
    pub fn identity(&self) -> Option<&Identity> {
        self.identity.as_ref()
    }

    /// Whether the connection carries an identity.
    #[must_use]
    pub fn is_authenticated(&self) -> bool {
        self.identity.is_some()
    }

    /// Current protocol state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Whether the connection is processing frames.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    /// Move from `Connecting` to `Open`.
    pub(crate) fn open(&self) -> bool {
        self.state
            .compare_exchange(
                ConnectionState::Connecting as u8,
                ConnectionState::Open as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Start a graceful close.
    ///
    /// The writer flushes what is already queued and closes the transport.
    /// Returns `false` if teardown had already started.
    pub fn begin_close(&self) -> bool {
        let started = {
            let _table = self.subscriptions.write();
            self.state
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |state| {
                    (state < ConnectionState::Closing as u8)
                        .then_some(ConnectionState::Closing as u8)
                })
                .is_ok()
        };
        self.closing.cancel();
        started
    }

    /// Mark the connection closed and drop every subscription.
    ///
    /// Returns the number of subscriptions released.
    pub(crate) fn release(&self) -> usize {
        let released = {
            let mut table = self.subscriptions.write();
            self.state
                .store(ConnectionState::Closed as u8, Ordering::Release);
            table.clear()
        };
        self.closing.cancel();
        released
    }

    /// Resolves once teardown has started.
    pub fn closed(&self) -> WaitForCancellationFuture<'_> {
        self.closing.cancelled()
    }

    /// Queue a message for the client without waiting.
    ///
    /// # Errors
    ///
    /// Returns [`EnqueueError::Full`] if the queue is at capacity (the message
    /// is dropped and counted) or [`EnqueueError::Closed`] if the connection is
    /// tearing down.
    pub fn enqueue(&self, message: ServerMessage) -> Result<(), EnqueueError> {
        if !self.is_open() {
            return Err(EnqueueError::Closed);
        }
        self.try_push(message)
    }

    fn try_push(&self, message: ServerMessage) -> Result<(), EnqueueError> {
        match self.outbound.try_send(message) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(message)) => {
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                warn!(
                    connection = %self.id,
                    kind = message.kind(),
                    dropped,
                    "Outbound queue full, dropping message"
                );
                Err(EnqueueError::Full)
            }
            Err(TrySendError::Closed(_)) => Err(EnqueueError::Closed),
        }
    }

    /// Queue an `event` message for every active subscription matching `event`.
    ///
    /// Returns `(delivered, dropped)`.
    pub(crate) fn deliver(&self, event: &Event) -> (usize, usize) {
        let table = self.subscriptions.read();
        if !self.is_open() {
            return (0, 0);
        }

        let mut delivered = 0;
        let mut dropped = 0;
        for subscription in table.matching(&event.topic, event.event_type) {
            match self.try_push(event.to_message(&subscription.id)) {
                Ok(()) => delivered += 1,
                Err(EnqueueError::Full) => dropped += 1,
                Err(EnqueueError::Closed) => break,
            }
        }

        if delivered > 0 {
            trace!(connection = %self.id, topic = %event.topic, delivered, "Queued event");
        }
        (delivered, dropped)
    }

    /// Activate a pending subscription and queue its reply in one step, so no
    /// event for the subscription can be queued ahead of the reply.
    ///
    /// Returns `false` if the subscription vanished, the connection is closing,
    /// or the outbound queue is full. A reply that cannot be queued is dropped
    /// along with the subscription; the client is not told.
    pub(crate) fn activate_with_reply(&self, subscription_id: &str, reply: ServerMessage) -> bool {
        let mut table = self.subscriptions.write();
        if !self.is_open() || !table.activate(subscription_id) {
            return false;
        }
        if self.try_push(reply).is_err() {
            table.unsubscribe(subscription_id).ok();
            return false;
        }
        true
    }

    /// Read access to the subscription table.
    pub fn subscriptions(&self) -> RwLockReadGuard<'_, SubscriptionTable> {
        self.subscriptions.read()
    }

    pub(crate) fn subscriptions_mut(&self) -> RwLockWriteGuard<'_, SubscriptionTable> {
        self.subscriptions.write()
    }

    /// Number of subscriptions held, pending ones included.
    #[must_use]
    pub fn subscription_count(&self) -> usize {
        self.subscriptions.read().len()
    }

    /// Messages dropped because the outbound queue was full.
    #[must_use]
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Time since the connection was accepted.
    #[must_use]
    pub fn age(&self) -> Duration {
        self.connected_at.elapsed()
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("identity", &self.identity)
            .field("state", &self.state())
            .field("subscriptions", &self.subscription_count())
            .finish()
    }
}
