//! Plugins for the built-in topics: `payment`, `telegram_user` and `survey`.

use crate::entities::{Payment, Survey, TelegramUser};
use crate::store::MemoryStore;
use beacon_core::{EntityPlugin, PluginRegistry, RecordStore, RegistryError};
use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{json, Value};
use std::sync::Arc;

/// Record stores shared by the plugins and the mutation API.
#[derive(Clone, Default)]
pub struct Stores {
    pub payments: Arc<MemoryStore<Payment>>,
    pub telegram_users: Arc<MemoryStore<TelegramUser>>,
    pub surveys: Arc<MemoryStore<Survey>>,
}

fn iso(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Plugin for the `payment` topic.
pub struct PaymentPlugin {
    store: Arc<MemoryStore<Payment>>,
}

impl PaymentPlugin {
    #[must_use]
    pub fn new(store: Arc<MemoryStore<Payment>>) -> Self {
        Self { store }
    }
}

impl EntityPlugin for PaymentPlugin {
    type Entity = Payment;
    const TOPIC: &'static str = "payment";

    fn project(&self, payment: &Payment) -> Value {
        json!({
            "id": payment.id,
            "customer_id": payment.customer_id,
            "amount": payment.amount,
            "date": iso(&payment.date),
        })
    }

    fn store(&self) -> &dyn RecordStore<Payment> {
        self.store.as_ref()
    }
}

/// Plugin for the `telegram_user` topic.
pub struct TelegramUserPlugin {
    store: Arc<MemoryStore<TelegramUser>>,
}

impl TelegramUserPlugin {
    #[must_use]
    pub fn new(store: Arc<MemoryStore<TelegramUser>>) -> Self {
        Self { store }
    }
}

impl EntityPlugin for TelegramUserPlugin {
    type Entity = TelegramUser;
    const TOPIC: &'static str = "telegram_user";

    fn project(&self, user: &TelegramUser) -> Value {
        json!({
            "id": user.id,
            "telegram_id": user.telegram_id,
            "username": user.username,
            "first_name": user.first_name,
            "last_name": user.last_name,
            "language_code": user.language_code,
            "is_active": user.is_active,
            "is_bot": user.is_bot,
            "created_at": iso(&user.created_at),
            "updated_at": iso(&user.updated_at),
            "last_interaction_at": user.last_interaction_at.as_ref().map(iso),
        })
    }

    fn store(&self) -> &dyn RecordStore<TelegramUser> {
        self.store.as_ref()
    }
}

/// Plugin for the `survey` topic.
pub struct SurveyPlugin {
    store: Arc<MemoryStore<Survey>>,
}

impl SurveyPlugin {
    #[must_use]
    pub fn new(store: Arc<MemoryStore<Survey>>) -> Self {
        Self { store }
    }
}

impl EntityPlugin for SurveyPlugin {
    type Entity = Survey;
    const TOPIC: &'static str = "survey";

    fn project(&self, survey: &Survey) -> Value {
        json!({
            "id": survey.id,
            "user_id": survey.user_id,
            "full_name": survey.full_name,
            "super_powers": survey.super_powers,
            "birth_date": survey.birth_date,
            "traits_to_improve": survey.traits_to_improve,
            "to_buy": survey.to_buy,
            "to_sell": survey.to_sell,
            "service": survey.service,
            "material_goal": survey.material_goal,
            "social_goal": survey.social_goal,
            "spiritual_goal": survey.spiritual_goal,
            "created_at": iso(&survey.created_at),
            "updated_at": iso(&survey.updated_at),
        })
    }

    fn store(&self) -> &dyn RecordStore<Survey> {
        self.store.as_ref()
    }
}

/// Build the registry of built-in plugins over `stores`.
///
/// # Errors
///
/// Returns an error if two plugins claim the same topic.
pub fn build_registry(stores: &Stores) -> Result<PluginRegistry, RegistryError> {
    PluginRegistry::new()
        .with(PaymentPlugin::new(Arc::clone(&stores.payments)))?
        .with(TelegramUserPlugin::new(Arc::clone(&stores.telegram_users)))?
        .with(SurveyPlugin::new(Arc::clone(&stores.surveys)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::{Mutable, PaymentCreate};
    use beacon_core::{ConnectionManager, Identity, Plugin};
    use beacon_protocol::{ErrorCode, ServerMessage, SubscriptionParams};

    #[test]
    fn test_registry_topics() {
        let registry = build_registry(&Stores::default()).unwrap();
        assert_eq!(
            registry.topics(),
            vec![
                "payment".to_string(),
                "survey".to_string(),
                "telegram_user".to_string()
            ]
        );
    }

    #[tokio::test]
    async fn test_payment_snapshot_newest_first() {
        let stores = Stores::default();
        let base = Utc::now();
        for (i, amount) in [10.0, 20.0, 30.0].into_iter().enumerate() {
            let payment = Payment::create(
                PaymentCreate {
                    customer_id: 1,
                    amount,
                    date: Some(base + chrono::Duration::seconds(i as i64)),
                },
                base,
            )
            .unwrap();
            stores.payments.insert(payment);
        }

        let plugin = PaymentPlugin::new(Arc::clone(&stores.payments));
        let snapshot = plugin
            .fetch_initial(&SubscriptionParams::default())
            .await
            .unwrap();
        assert_eq!(snapshot.total, 3);
        assert_eq!(snapshot.items[0]["amount"], 30.0);
        assert_eq!(snapshot.items[2]["amount"], 10.0);
    }

    #[test]
    fn test_telegram_user_projection() {
        let now = Utc::now();
        let user = TelegramUser {
            id: 3,
            telegram_id: 99,
            username: None,
            first_name: "Ada".into(),
            last_name: None,
            language_code: Some("en".into()),
            is_active: true,
            is_bot: false,
            created_at: now,
            updated_at: now,
            last_interaction_at: None,
        };

        let payload = TelegramUserPlugin::new(Arc::default()).project(&user);
        assert_eq!(payload["telegram_id"], 99);
        assert!(payload["username"].is_null());
        assert!(payload["last_interaction_at"].is_null());
        assert!(payload["created_at"].as_str().unwrap().ends_with('Z'));
    }

    #[tokio::test]
    async fn test_subscribe_with_unknown_filter_field() {
        let stores = Stores::default();
        let payment = Payment::create(
            PaymentCreate {
                customer_id: 4,
                amount: 12.5,
                date: None,
            },
            Utc::now(),
        )
        .unwrap();
        stores.payments.insert(payment);

        let manager = ConnectionManager::new(Arc::new(build_registry(&stores).unwrap()));
        let (conn, mut rx) = manager.open(Some(Identity::new("admin"))).unwrap();

        let frame = r#"{"type":"subscribe","topic":"payment","params":{"filters":{"colour":"red"}}}"#;
        assert_eq!(
            manager.handle_text(&conn, frame).await,
            Some(ErrorCode::InvalidFormat)
        );
        match rx.recv().await.unwrap() {
            ServerMessage::Error { code, message, .. } => {
                assert_eq!(code, ErrorCode::InvalidFormat);
                assert!(message.contains("colour"));
            }
            other => panic!("Expected Error, got {:?}", other),
        }
        assert_eq!(conn.subscription_count(), 0);

        let frame = r#"{"type":"subscribe","topic":"payment","params":{"filters":{"customer_id":4}}}"#;
        assert_eq!(manager.handle_text(&conn, frame).await, None);
        match rx.recv().await.unwrap() {
            ServerMessage::Subscribed { data, .. } => assert_eq!(data.total, 1),
            other => panic!("Expected Subscribed, got {:?}", other),
        }
    }
}
