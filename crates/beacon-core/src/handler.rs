//! Inbound frame handling.

use crate::connection::Connection;
use crate::manager::ConnectionManager;
use crate::plugin::PluginError;
use crate::store::StoreError;
use crate::subscription::EventFilter;
use beacon_protocol::{codec, ClientMessage, ErrorCode, ServerMessage, SubscriptionParams};
use std::sync::Arc;
use tracing::{debug, error, trace, warn};

impl ConnectionManager {
    /// Handle one inbound text frame from `conn`.
    ///
    /// Client-caused failures are answered with an `error` frame and the
    /// connection stays open. Frames arriving after teardown started are
    /// ignored. Returns the error code sent, if any.
    pub async fn handle_text(&self, conn: &Arc<Connection>, text: &str) -> Option<ErrorCode> {
        if !conn.is_open() {
            trace!(connection = %conn.id(), "Ignoring frame on closing connection");
            return None;
        }

        let message = match codec::decode_with_limit(text, self.config().max_message_size) {
            Ok(message) => message,
            Err(e) => {
                debug!(connection = %conn.id(), error = %e, "Rejected frame");
                return reply_error(conn, e.code(), e.to_string());
            }
        };

        match message {
            ClientMessage::Subscribe { topic, params } => {
                self.handle_subscribe(conn, topic, params).await
            }
            ClientMessage::Unsubscribe {
                subscription_id,
                topic,
            } => self.handle_unsubscribe(conn, subscription_id, topic),
            ClientMessage::Ping {} => {
                reply(conn, ServerMessage::pong());
                None
            }
        }
    }

    async fn handle_subscribe(
        &self,
        conn: &Arc<Connection>,
        topic: String,
        params: SubscriptionParams,
    ) -> Option<ErrorCode> {
        if !conn.is_authenticated() {
            return reply_error(conn, ErrorCode::AuthRequired, "Authentication required");
        }

        let filter = EventFilter::from_types(&params.event_types);
        let subscribed = conn
            .subscriptions_mut()
            .subscribe(self.registry(), &topic, filter)
            .map(|subscription| subscription.id.clone());
        let subscription_id = match subscribed {
            Ok(id) => id,
            Err(e) => return reply_error(conn, e.code(), e.to_string()),
        };

        let Some(plugin) = self.registry().lookup(&topic) else {
            conn.subscriptions_mut().unsubscribe(&subscription_id).ok();
            return reply_error(
                conn,
                ErrorCode::PluginNotFound,
                format!("No plugin for topic '{topic}'"),
            );
        };

        let snapshot = match plugin.fetch_initial(&params).await {
            Ok(snapshot) => snapshot,
            Err(PluginError::Store(StoreError::InvalidQuery(reason))) => {
                debug!(connection = %conn.id(), topic = %topic, reason = %reason, "Rejected snapshot query");
                conn.subscriptions_mut().unsubscribe(&subscription_id).ok();
                return reply_error(conn, ErrorCode::InvalidFormat, reason);
            }
            Err(e) => {
                error!(connection = %conn.id(), topic = %topic, error = %e, "Initial snapshot failed");
                conn.subscriptions_mut().unsubscribe(&subscription_id).ok();
                return reply_error(
                    conn,
                    ErrorCode::InternalError,
                    format!("Failed to load initial data for '{topic}'"),
                );
            }
        };

        let items = snapshot.items.len();
        let reply = ServerMessage::subscribed(topic.clone(), subscription_id.clone(), snapshot);
        if conn.activate_with_reply(&subscription_id, reply) {
            debug!(
                connection = %conn.id(),
                topic = %topic,
                subscription = %subscription_id,
                event_types = ?filter,
                items,
                "Subscribed"
            );
            None
        } else {
            warn!(
                connection = %conn.id(),
                subscription = %subscription_id,
                "Subscription abandoned before activation"
            );
            Some(ErrorCode::InternalError)
        }
    }

    fn handle_unsubscribe(
        &self,
        conn: &Arc<Connection>,
        subscription_id: Option<String>,
        topic: Option<String>,
    ) -> Option<ErrorCode> {
        let removed = match (subscription_id, topic) {
            (Some(id), _) => conn.subscriptions_mut().unsubscribe(&id),
            (None, Some(topic)) => conn.subscriptions_mut().unsubscribe_topic(&topic),
            (None, None) => {
                return reply_error(
                    conn,
                    ErrorCode::InvalidFormat,
                    "unsubscribe requires 'subscription_id' or 'topic'",
                );
            }
        };

        match removed {
            Ok(subscription) => {
                debug!(
                    connection = %conn.id(),
                    topic = %subscription.topic,
                    subscription = %subscription.id,
                    "Unsubscribed"
                );
                reply(
                    conn,
                    ServerMessage::unsubscribed(subscription.topic, subscription.id),
                );
                None
            }
            Err(e) => reply_error(conn, e.code(), e.to_string()),
        }
    }
}

fn reply(conn: &Connection, message: ServerMessage) {
    if let Err(e) = conn.enqueue(message) {
        debug!(connection = %conn.id(), error = %e, "Reply not queued");
    }
}

fn reply_error(conn: &Connection, code: ErrorCode, message: impl Into<String>) -> Option<ErrorCode> {
    reply(conn, ServerMessage::error(code, message));
    Some(code)
}

#[cfg(test)]
mod tests {
    use crate::auth::Identity;
    use crate::connection::{Connection, OutboundReceiver};
    use crate::manager::{ConnectionManager, ManagerConfig};
    use crate::plugin::tests::WidgetPlugin;
    use crate::plugin::EntityPlugin;
    use crate::registry::PluginRegistry;
    use crate::store::{ListQuery, Page, RecordStore, StoreError};
    use crate::subscription::DEFAULT_MAX_SUBSCRIPTIONS;
    use async_trait::async_trait;
    use beacon_protocol::{ErrorCode, EventType, ServerMessage};
    use serde_json::{json, Value};
    use std::sync::Arc;

    struct Flaky;

    #[async_trait]
    impl RecordStore<()> for Flaky {
        async fn list(&self, _query: &ListQuery) -> Result<Page<()>, StoreError> {
            Err(StoreError::Unavailable("timeout".into()))
        }
    }

    struct FlakyPlugin;

    impl EntityPlugin for FlakyPlugin {
        type Entity = ();
        const TOPIC: &'static str = "flaky";

        fn project(&self, _entity: &()) -> Value {
            Value::Null
        }

        fn store(&self) -> &dyn RecordStore<()> {
            &Flaky
        }
    }

    fn manager() -> ConnectionManager {
        let registry = PluginRegistry::new()
            .with(WidgetPlugin::with_records(3))
            .unwrap()
            .with(FlakyPlugin)
            .unwrap();
        ConnectionManager::new(Arc::new(registry))
    }

    fn authed(manager: &ConnectionManager) -> (Arc<Connection>, OutboundReceiver) {
        manager.open(Some(Identity::new("admin"))).unwrap()
    }

    async fn next(rx: &mut OutboundReceiver) -> ServerMessage {
        rx.recv().await.unwrap()
    }

    async fn subscribe(
        manager: &ConnectionManager,
        conn: &Arc<Connection>,
        rx: &mut OutboundReceiver,
        frame: &str,
    ) -> String {
        assert_eq!(manager.handle_text(conn, frame).await, None);
        match next(rx).await {
            ServerMessage::Subscribed {
                subscription_id, ..
            } => subscription_id,
            other => panic!("Expected Subscribed, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_ping() {
        let manager = manager();
        let (conn, mut rx) = manager.open(None).unwrap();

        assert_eq!(manager.handle_text(&conn, r#"{"type":"ping"}"#).await, None);
        assert_eq!(next(&mut rx).await.kind(), "pong");
    }

    #[tokio::test]
    async fn test_subscribe_requires_auth() {
        let manager = manager();
        let (conn, mut rx) = manager.open(None).unwrap();

        let code = manager
            .handle_text(&conn, r#"{"type":"subscribe","topic":"widget"}"#)
            .await;
        assert_eq!(code, Some(ErrorCode::AuthRequired));
        assert_eq!(next(&mut rx).await.error_code(), Some(ErrorCode::AuthRequired));
        assert_eq!(conn.subscription_count(), 0);
    }

    #[tokio::test]
    async fn test_subscribe_returns_snapshot() {
        let manager = manager();
        let (conn, mut rx) = authed(&manager);

        manager
            .handle_text(&conn, r#"{"type":"subscribe","topic":"widget"}"#)
            .await;
        match next(&mut rx).await {
            ServerMessage::Subscribed { topic, data, .. } => {
                assert_eq!(topic, "widget");
                assert_eq!(data.total, 3);
                assert_eq!(data.items.len(), 3);
            }
            other => panic!("Expected Subscribed, got {:?}", other),
        }
        assert_eq!(conn.subscription_count(), 1);
    }

    #[tokio::test]
    async fn test_subscribe_invalid_topic() {
        let manager = manager();
        let (conn, mut rx) = authed(&manager);

        let code = manager
            .handle_text(&conn, r#"{"type":"subscribe","topic":"gadget"}"#)
            .await;
        assert_eq!(code, Some(ErrorCode::InvalidTopic));
        match next(&mut rx).await {
            ServerMessage::Error { message, .. } => assert!(message.contains("widget")),
            other => panic!("Expected Error, got {:?}", other),
        }
        assert_eq!(conn.subscription_count(), 0);
    }

    #[tokio::test]
    async fn test_subscription_cap() {
        let manager = manager();
        let (conn, mut rx) = authed(&manager);
        let frame = r#"{"type":"subscribe","topic":"widget"}"#;

        for _ in 0..DEFAULT_MAX_SUBSCRIPTIONS {
            subscribe(&manager, &conn, &mut rx, frame).await;
        }

        assert_eq!(
            manager.handle_text(&conn, frame).await,
            Some(ErrorCode::MaxSubscriptions)
        );
        assert_eq!(next(&mut rx).await.error_code(), Some(ErrorCode::MaxSubscriptions));
        assert_eq!(conn.subscription_count(), DEFAULT_MAX_SUBSCRIPTIONS);

        let frame = r#"{"type":"unsubscribe","topic":"widget"}"#;
        assert_eq!(manager.handle_text(&conn, frame).await, None);
        assert_eq!(next(&mut rx).await.kind(), "unsubscribed");

        subscribe(&manager, &conn, &mut rx, r#"{"type":"subscribe","topic":"widget"}"#).await;
    }

    #[tokio::test]
    async fn test_snapshot_failure_releases_slot() {
        let manager = manager();
        let (conn, mut rx) = authed(&manager);

        let code = manager
            .handle_text(&conn, r#"{"type":"subscribe","topic":"flaky"}"#)
            .await;
        assert_eq!(code, Some(ErrorCode::InternalError));
        assert_eq!(next(&mut rx).await.error_code(), Some(ErrorCode::InternalError));
        assert_eq!(conn.subscription_count(), 0);
    }

    #[tokio::test]
    async fn test_subscribe_with_full_queue_is_counted() {
        let registry = PluginRegistry::new()
            .with(WidgetPlugin::with_records(1))
            .unwrap();
        let manager = ConnectionManager::with_config(
            Arc::new(registry),
            ManagerConfig {
                outbound_capacity: 1,
                ..ManagerConfig::default()
            },
        );
        let (conn, mut rx) = authed(&manager);

        assert_eq!(manager.handle_text(&conn, r#"{"type":"ping"}"#).await, None);
        let code = manager
            .handle_text(&conn, r#"{"type":"subscribe","topic":"widget"}"#)
            .await;
        assert_eq!(code, Some(ErrorCode::InternalError));
        assert_eq!(conn.subscription_count(), 0);

        assert_eq!(next(&mut rx).await.kind(), "pong");
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_event_filter_applied() {
        let manager = manager();
        let (conn, mut rx) = authed(&manager);
        let id = subscribe(
            &manager,
            &conn,
            &mut rx,
            r#"{"type":"subscribe","topic":"widget","params":{"event_types":["created"]}}"#,
        )
        .await;

        manager.broadcast("widget", EventType::Updated, json!({"id": 1}));
        manager.broadcast("widget", EventType::Created, json!({"id": 2}));

        match next(&mut rx).await {
            ServerMessage::Event {
                subscription_id,
                event_type,
                data,
                ..
            } => {
                assert_eq!(subscription_id, id);
                assert_eq!(event_type, EventType::Created);
                assert_eq!(data["id"], 2);
            }
            other => panic!("Expected Event, got {:?}", other),
        }
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_unsubscribe_by_id() {
        let manager = manager();
        let (conn, mut rx) = authed(&manager);
        let frame = r#"{"type":"subscribe","topic":"widget"}"#;
        let first = subscribe(&manager, &conn, &mut rx, frame).await;
        let second = subscribe(&manager, &conn, &mut rx, frame).await;

        let unsubscribe = format!(r#"{{"type":"unsubscribe","subscription_id":"{second}"}}"#);
        manager.handle_text(&conn, &unsubscribe).await;
        match next(&mut rx).await {
            ServerMessage::Unsubscribed {
                subscription_id, ..
            } => assert_eq!(subscription_id, second),
            other => panic!("Expected Unsubscribed, got {:?}", other),
        }
        assert!(conn.subscriptions().get(&first).is_some());

        assert_eq!(
            manager.handle_text(&conn, &unsubscribe).await,
            Some(ErrorCode::SubscriptionNotFound)
        );
    }

    #[tokio::test]
    async fn test_unsubscribe_without_address() {
        let manager = manager();
        let (conn, mut rx) = authed(&manager);

        let code = manager
            .handle_text(&conn, r#"{"type":"unsubscribe"}"#)
            .await;
        assert_eq!(code, Some(ErrorCode::InvalidFormat));
        assert_eq!(next(&mut rx).await.error_code(), Some(ErrorCode::InvalidFormat));
    }

    #[tokio::test]
    async fn test_protocol_errors_keep_connection_open() {
        let manager = manager();
        let (conn, mut rx) = authed(&manager);

        assert_eq!(
            manager.handle_text(&conn, "not json").await,
            Some(ErrorCode::InvalidFormat)
        );
        assert_eq!(
            manager.handle_text(&conn, r#"{"type":"dance"}"#).await,
            Some(ErrorCode::InvalidType)
        );
        assert_eq!(
            manager.handle_text(&conn, r#"{"topic":"widget"}"#).await,
            Some(ErrorCode::InvalidType)
        );
        for _ in 0..3 {
            assert!(next(&mut rx).await.error_code().is_some());
        }

        assert!(conn.is_open());
        assert_eq!(manager.handle_text(&conn, r#"{"type":"ping"}"#).await, None);
        assert_eq!(next(&mut rx).await.kind(), "pong");
    }

    #[tokio::test]
    async fn test_frames_ignored_after_close() {
        let manager = manager();
        let (conn, mut rx) = authed(&manager);
        conn.begin_close();

        assert_eq!(manager.handle_text(&conn, r#"{"type":"ping"}"#).await, None);
        assert!(rx.try_recv().is_err());
    }
}
