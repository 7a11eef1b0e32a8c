//! Per-connection subscription table.
//!
//! A table belongs to exactly one connection. Its inbound messages are handled
//! one at a time, so the check-then-insert in [`SubscriptionTable::subscribe`]
//! needs no coordination beyond the connection's own lock.

use crate::registry::PluginRegistry;
use beacon_protocol::{ErrorCode, EventType};
use std::fmt;
use std::time::Instant;
use thiserror::Error;
use uuid::Uuid;

/// Default cap on live subscriptions per connection.
pub const DEFAULT_MAX_SUBSCRIPTIONS: usize = 10;

/// Subscription errors.
#[derive(Debug, Error)]
pub enum SubscriptionError {
    /// The topic has no registered plugin.
    #[error("Invalid topic '{topic}'. Valid topics: {}", .valid.join(", "))]
    InvalidTopic { topic: String, valid: Vec<String> },

    /// The connection is at its subscription cap.
    #[error("Maximum {limit} subscriptions allowed")]
    MaxSubscriptionsExceeded { limit: usize },

    /// No subscription matched.
    #[error("Subscription not found: {0}")]
    NotFound(String),
}

impl SubscriptionError {
    /// Error code reported to the client.
    #[must_use]
    pub fn code(&self) -> ErrorCode {
        match self {
            SubscriptionError::InvalidTopic { .. } => ErrorCode::InvalidTopic,
            SubscriptionError::MaxSubscriptionsExceeded { .. } => ErrorCode::MaxSubscriptions,
            SubscriptionError::NotFound(_) => ErrorCode::SubscriptionNotFound,
        }
    }
}

/// Set of event types a subscription receives.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct EventFilter {
    bits: u8,
}

impl EventFilter {
    /// Filter accepting every event type.
    #[must_use]
    pub const fn all() -> Self {
        Self { bits: 0b111 }
    }

    /// Build a filter from requested types. An empty request means all types.
    #[must_use]
    pub fn from_types(types: &[EventType]) -> Self {
        if types.is_empty() {
            return Self::all();
        }
        Self {
            bits: types.iter().fold(0, |bits, t| bits | Self::bit(*t)),
        }
    }

    /// Check whether the filter accepts an event type.
    #[must_use]
    pub fn contains(&self, event_type: EventType) -> bool {
        self.bits & Self::bit(event_type) != 0
    }

    /// Accepted event types in wire order.
    pub fn iter(&self) -> impl Iterator<Item = EventType> {
        let filter = *self;
        EventType::ALL.into_iter().filter(move |t| filter.contains(*t))
    }

    const fn bit(event_type: EventType) -> u8 {
        match event_type {
            EventType::Created => 0b001,
            EventType::Updated => 0b010,
            EventType::Deleted => 0b100,
        }
    }
}

impl Default for EventFilter {
    fn default() -> Self {
        Self::all()
    }
}

impl fmt::Debug for EventFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

/// A single subscription held by a connection.
#[derive(Debug, Clone)]
pub struct Subscription {
    /// Generated identifier, echoed in every event for this subscription.
    pub id: String,
    /// Subscribed topic.
    pub topic: String,
    /// Accepted event types.
    pub filter: EventFilter,
    /// When the subscription was created.
    pub created_at: Instant,
    /// Pending subscriptions count toward the cap but receive no events.
    active: bool,
}

impl Subscription {
    fn new(topic: &str, filter: EventFilter) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            topic: topic.to_string(),
            filter,
            created_at: Instant::now(),
            active: false,
        }
    }

    /// Whether the subscription receives events.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Whether an event on `topic` of `event_type` should be delivered.
    #[must_use]
    pub fn matches(&self, topic: &str, event_type: EventType) -> bool {
        self.active && self.topic == topic && self.filter.contains(event_type)
    }
}

/// Subscriptions of one connection, in creation order.
#[derive(Debug)]
pub struct SubscriptionTable {
    entries: Vec<Subscription>,
    limit: usize,
}

impl SubscriptionTable {
    /// Create a table holding at most `limit` subscriptions.
    #[must_use]
    pub fn new(limit: usize) -> Self {
        Self {
            entries: Vec::with_capacity(limit.min(DEFAULT_MAX_SUBSCRIPTIONS)),
            limit,
        }
    }

    /// Add a pending subscription.
    ///
    /// The entry counts toward the cap immediately but receives no events
    /// until [`activate`](Self::activate) is called.
    ///
    /// # Errors
    ///
    /// Returns an error if the topic is unknown or the table is full. The
    /// table is left untouched on error.
    pub fn subscribe(
        &mut self,
        registry: &PluginRegistry,
        topic: &str,
        filter: EventFilter,
    ) -> Result<&Subscription, SubscriptionError> {
        if !registry.is_valid_topic(topic) {
            return Err(SubscriptionError::InvalidTopic {
                topic: topic.to_string(),
                valid: registry.topics(),
            });
        }

        if self.entries.len() >= self.limit {
            return Err(SubscriptionError::MaxSubscriptionsExceeded { limit: self.limit });
        }

        self.entries.push(Subscription::new(topic, filter));
        Ok(&self.entries[self.entries.len() - 1])
    }

    /// Start delivering events to a pending subscription.
    ///
    /// Returns `false` if the subscription no longer exists.
    pub fn activate(&mut self, subscription_id: &str) -> bool {
        match self.entries.iter_mut().find(|s| s.id == subscription_id) {
            Some(subscription) => {
                subscription.active = true;
                true
            }
            None => false,
        }
    }

    /// Remove a subscription by id.
    ///
    /// # Errors
    ///
    /// Returns [`SubscriptionError::NotFound`] if no subscription has that id.
    pub fn unsubscribe(&mut self, subscription_id: &str) -> Result<Subscription, SubscriptionError> {
        let index = self
            .entries
            .iter()
            .position(|s| s.id == subscription_id)
            .ok_or_else(|| SubscriptionError::NotFound(subscription_id.to_string()))?;
        Ok(self.entries.remove(index))
    }

    /// Remove the oldest subscription on a topic.
    ///
    /// # Errors
    ///
    /// Returns [`SubscriptionError::NotFound`] if the connection has no
    /// subscription on that topic.
    pub fn unsubscribe_topic(&mut self, topic: &str) -> Result<Subscription, SubscriptionError> {
        let index = self
            .entries
            .iter()
            .position(|s| s.topic == topic)
            .ok_or_else(|| SubscriptionError::NotFound(topic.to_string()))?;
        Ok(self.entries.remove(index))
    }

    /// Active subscriptions that should receive an event.
    pub fn matching<'a>(
        &'a self,
        topic: &'a str,
        event_type: EventType,
    ) -> impl Iterator<Item = &'a Subscription> + 'a {
        self.entries
            .iter()
            .filter(move |s| s.matches(topic, event_type))
    }

    /// Look up a subscription by id.
    #[must_use]
    pub fn get(&self, subscription_id: &str) -> Option<&Subscription> {
        self.entries.iter().find(|s| s.id == subscription_id)
    }

    /// All subscriptions, in creation order.
    pub fn iter(&self) -> impl Iterator<Item = &Subscription> {
        self.entries.iter()
    }

    /// Remove every subscription, returning how many were held.
    pub fn clear(&mut self) -> usize {
        let count = self.entries.len();
        self.entries.clear();
        count
    }

    /// Number of subscriptions, pending ones included.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if the table is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Maximum number of subscriptions.
    #[must_use]
    pub fn limit(&self) -> usize {
        self.limit
    }
}

impl Default for SubscriptionTable {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_SUBSCRIPTIONS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::tests::WidgetPlugin;

    fn registry() -> PluginRegistry {
        PluginRegistry::new()
            .with(WidgetPlugin::with_records(0))
            .unwrap()
    }

    fn subscribe_active(table: &mut SubscriptionTable, registry: &PluginRegistry) -> String {
        let id = table
            .subscribe(registry, "widget", EventFilter::all())
            .unwrap()
            .id
            .clone();
        assert!(table.activate(&id));
        id
    }

    #[test]
    fn test_event_filter() {
        let all = EventFilter::from_types(&[]);
        assert!(EventType::ALL.iter().all(|t| all.contains(*t)));

        let created = EventFilter::from_types(&[EventType::Created]);
        assert!(created.contains(EventType::Created));
        assert!(!created.contains(EventType::Updated));
        assert!(!created.contains(EventType::Deleted));

        let two = EventFilter::from_types(&[EventType::Deleted, EventType::Updated]);
        assert_eq!(
            two.iter().collect::<Vec<_>>(),
            vec![EventType::Updated, EventType::Deleted]
        );
    }

    #[test]
    fn test_subscribe_unknown_topic() {
        let registry = registry();
        let mut table = SubscriptionTable::default();

        let err = table
            .subscribe(&registry, "gadget", EventFilter::all())
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidTopic);
        assert!(err.to_string().contains("widget"));
        assert!(table.is_empty());
    }

    #[test]
    fn test_subscription_cap() {
        let registry = registry();
        let mut table = SubscriptionTable::default();

        let ids: Vec<String> = (0..DEFAULT_MAX_SUBSCRIPTIONS)
            .map(|_| subscribe_active(&mut table, &registry))
            .collect();

        let err = table
            .subscribe(&registry, "widget", EventFilter::all())
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::MaxSubscriptions);
        assert_eq!(table.len(), DEFAULT_MAX_SUBSCRIPTIONS);
        assert!(ids.iter().all(|id| table.get(id).is_some()));
    }

    #[test]
    fn test_pending_subscription_receives_nothing() {
        let registry = registry();
        let mut table = SubscriptionTable::default();

        let id = table
            .subscribe(&registry, "widget", EventFilter::all())
            .unwrap()
            .id
            .clone();
        assert_eq!(table.matching("widget", EventType::Created).count(), 0);

        table.activate(&id);
        assert_eq!(table.matching("widget", EventType::Created).count(), 1);
        assert_eq!(table.matching("gadget", EventType::Created).count(), 0);
    }

    #[test]
    fn test_unsubscribe_by_id_and_topic() {
        let registry = registry();
        let mut table = SubscriptionTable::default();

        let first = subscribe_active(&mut table, &registry);
        let second = subscribe_active(&mut table, &registry);

        let removed = table.unsubscribe_topic("widget").unwrap();
        assert_eq!(removed.id, first);

        let removed = table.unsubscribe(&second).unwrap();
        assert_eq!(removed.id, second);
        assert!(table.is_empty());
    }

    #[test]
    fn test_unsubscribe_missing() {
        let registry = registry();
        let mut table = SubscriptionTable::default();
        subscribe_active(&mut table, &registry);

        let err = table.unsubscribe("nope").unwrap_err();
        assert_eq!(err.code(), ErrorCode::SubscriptionNotFound);
        assert!(table.unsubscribe_topic("gadget").is_err());
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_subscription_ids_are_unique() {
        let registry = registry();
        let mut table = SubscriptionTable::default();
        let a = subscribe_active(&mut table, &registry);
        let b = subscribe_active(&mut table, &registry);
        assert_ne!(a, b);
    }
}
