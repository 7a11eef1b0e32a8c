//! Domain entities served by the broker.
//!
//! Each entity has a create payload and a partial update payload accepted by
//! the mutation API.

use crate::store::Record;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

/// Rejected create or update payload.
#[derive(Debug, Error)]
#[error("{field}: {reason}")]
pub struct ValidationError {
    pub field: &'static str,
    pub reason: &'static str,
}

impl ValidationError {
    fn new(field: &'static str, reason: &'static str) -> Self {
        Self { field, reason }
    }
}

/// An entity that can be created and updated through the API.
pub trait Mutable: Record {
    /// Create payload.
    type Create: DeserializeOwned + Send + 'static;
    /// Partial update payload.
    type Update: DeserializeOwned + Send + 'static;

    /// Build a new entity. The id is assigned by the store.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload fails validation.
    fn create(input: Self::Create, now: DateTime<Utc>) -> Result<Self, ValidationError>;

    /// Apply a partial update.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload fails validation.
    fn apply(&mut self, update: Self::Update, now: DateTime<Utc>) -> Result<(), ValidationError>;
}

// ---------------------------------------------------------------------------
// Payment
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Payment {
    pub id: u64,
    pub customer_id: i64,
    pub amount: f64,
    pub date: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PaymentCreate {
    pub customer_id: i64,
    pub amount: f64,
    #[serde(default)]
    pub date: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PaymentUpdate {
    pub customer_id: Option<i64>,
    pub amount: Option<f64>,
    pub date: Option<DateTime<Utc>>,
}

fn check_amount(amount: f64) -> Result<f64, ValidationError> {
    if amount.is_finite() && amount > 0.0 {
        Ok((amount * 100.0).round() / 100.0)
    } else {
        Err(ValidationError::new("amount", "must be greater than 0"))
    }
}

impl Record for Payment {
    fn id(&self) -> u64 {
        self.id
    }

    fn set_id(&mut self, id: u64) {
        self.id = id;
    }

    fn sorted_at(&self) -> DateTime<Utc> {
        self.date
    }

    const FIELDS: &'static [&'static str] = &["id", "customer_id", "amount", "date"];
}

impl Mutable for Payment {
    type Create = PaymentCreate;
    type Update = PaymentUpdate;

    fn create(input: PaymentCreate, now: DateTime<Utc>) -> Result<Self, ValidationError> {
        Ok(Self {
            id: 0,
            customer_id: input.customer_id,
            amount: check_amount(input.amount)?,
            date: input.date.unwrap_or(now),
        })
    }

    fn apply(&mut self, update: PaymentUpdate, _now: DateTime<Utc>) -> Result<(), ValidationError> {
        if let Some(amount) = update.amount {
            self.amount = check_amount(amount)?;
        }
        if let Some(customer_id) = update.customer_id {
            self.customer_id = customer_id;
        }
        if let Some(date) = update.date {
            self.date = date;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Telegram user
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelegramUser {
    pub id: u64,
    pub telegram_id: i64,
    pub username: Option<String>,
    pub first_name: String,
    pub last_name: Option<String>,
    pub language_code: Option<String>,
    pub is_active: bool,
    pub is_bot: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_interaction_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TelegramUserCreate {
    pub telegram_id: i64,
    #[serde(default)]
    pub username: Option<String>,
    pub first_name: String,
    #[serde(default)]
    pub last_name: Option<String>,
    #[serde(default)]
    pub language_code: Option<String>,
    #[serde(default = "default_true")]
    pub is_active: bool,
    #[serde(default)]
    pub is_bot: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TelegramUserUpdate {
    pub username: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub language_code: Option<String>,
    pub is_active: Option<bool>,
    pub last_interaction_at: Option<DateTime<Utc>>,
}

fn default_true() -> bool {
    true
}

fn check_len(
    field: &'static str,
    value: Option<&str>,
    max: usize,
) -> Result<(), ValidationError> {
    match value {
        Some(v) if v.chars().count() > max => Err(ValidationError::new(field, "too long")),
        _ => Ok(()),
    }
}

impl Record for TelegramUser {
    fn id(&self) -> u64 {
        self.id
    }

    fn set_id(&mut self, id: u64) {
        self.id = id;
    }

    fn sorted_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    const FIELDS: &'static [&'static str] = &[
        "id",
        "telegram_id",
        "username",
        "first_name",
        "last_name",
        "language_code",
        "is_active",
        "is_bot",
        "created_at",
        "updated_at",
        "last_interaction_at",
    ];
}

impl Mutable for TelegramUser {
    type Create = TelegramUserCreate;
    type Update = TelegramUserUpdate;

    fn create(input: TelegramUserCreate, now: DateTime<Utc>) -> Result<Self, ValidationError> {
        check_len("username", input.username.as_deref(), 32)?;
        check_len("first_name", Some(input.first_name.as_str()), 64)?;
        check_len("last_name", input.last_name.as_deref(), 64)?;
        check_len("language_code", input.language_code.as_deref(), 10)?;

        Ok(Self {
            id: 0,
            telegram_id: input.telegram_id,
            username: input.username,
            first_name: input.first_name,
            last_name: input.last_name,
            language_code: input.language_code,
            is_active: input.is_active,
            is_bot: input.is_bot,
            created_at: now,
            updated_at: now,
            last_interaction_at: None,
        })
    }

    fn apply(&mut self, update: TelegramUserUpdate, now: DateTime<Utc>) -> Result<(), ValidationError> {
        check_len("username", update.username.as_deref(), 32)?;
        check_len("first_name", update.first_name.as_deref(), 64)?;
        check_len("last_name", update.last_name.as_deref(), 64)?;
        check_len("language_code", update.language_code.as_deref(), 10)?;

        if let Some(username) = update.username {
            self.username = Some(username);
        }
        if let Some(first_name) = update.first_name {
            self.first_name = first_name;
        }
        if let Some(last_name) = update.last_name {
            self.last_name = Some(last_name);
        }
        if let Some(language_code) = update.language_code {
            self.language_code = Some(language_code);
        }
        if let Some(is_active) = update.is_active {
            self.is_active = is_active;
        }
        if let Some(at) = update.last_interaction_at {
            self.last_interaction_at = Some(at);
        }
        self.updated_at = now;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Survey
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Survey {
    pub id: u64,
    pub user_id: i64,
    pub full_name: BTreeMap<String, String>,
    pub super_powers: Vec<String>,
    pub birth_date: String,
    pub traits_to_improve: Vec<String>,
    pub to_buy: Vec<String>,
    pub to_sell: Vec<String>,
    pub service: Option<String>,
    pub material_goal: Option<String>,
    pub social_goal: Option<String>,
    pub spiritual_goal: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Survey answers. Every field except `user_id` may be omitted.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SurveyAnswers {
    pub full_name: Option<BTreeMap<String, String>>,
    pub super_powers: Option<Vec<String>>,
    pub birth_date: Option<String>,
    pub traits_to_improve: Option<Vec<String>>,
    pub to_buy: Option<Vec<String>>,
    pub to_sell: Option<Vec<String>>,
    pub service: Option<String>,
    pub material_goal: Option<String>,
    pub social_goal: Option<String>,
    pub spiritual_goal: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SurveyCreate {
    pub user_id: i64,
    #[serde(flatten)]
    pub answers: SurveyAnswers,
}

impl Survey {
    fn merge(&mut self, answers: SurveyAnswers) {
        if let Some(v) = answers.full_name {
            self.full_name = v;
        }
        if let Some(v) = answers.super_powers {
            self.super_powers = v;
        }
        if let Some(v) = answers.birth_date {
            self.birth_date = v;
        }
        if let Some(v) = answers.traits_to_improve {
            self.traits_to_improve = v;
        }
        if let Some(v) = answers.to_buy {
            self.to_buy = v;
        }
        if let Some(v) = answers.to_sell {
            self.to_sell = v;
        }
        if answers.service.is_some() {
            self.service = answers.service;
        }
        if answers.material_goal.is_some() {
            self.material_goal = answers.material_goal;
        }
        if answers.social_goal.is_some() {
            self.social_goal = answers.social_goal;
        }
        if answers.spiritual_goal.is_some() {
            self.spiritual_goal = answers.spiritual_goal;
        }
    }
}

impl Record for Survey {
    fn id(&self) -> u64 {
        self.id
    }

    fn set_id(&mut self, id: u64) {
        self.id = id;
    }

    fn sorted_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    const FIELDS: &'static [&'static str] = &[
        "id",
        "user_id",
        "full_name",
        "super_powers",
        "birth_date",
        "traits_to_improve",
        "to_buy",
        "to_sell",
        "service",
        "material_goal",
        "social_goal",
        "spiritual_goal",
        "created_at",
        "updated_at",
    ];
}

impl Mutable for Survey {
    type Create = SurveyCreate;
    type Update = SurveyAnswers;

    fn create(input: SurveyCreate, now: DateTime<Utc>) -> Result<Self, ValidationError> {
        let mut survey = Self {
            id: 0,
            user_id: input.user_id,
            full_name: BTreeMap::new(),
            super_powers: Vec::new(),
            birth_date: String::new(),
            traits_to_improve: Vec::new(),
            to_buy: Vec::new(),
            to_sell: Vec::new(),
            service: None,
            material_goal: None,
            social_goal: None,
            spiritual_goal: None,
            created_at: now,
            updated_at: now,
        };
        survey.merge(input.answers);
        Ok(survey)
    }

    fn apply(&mut self, update: SurveyAnswers, now: DateTime<Utc>) -> Result<(), ValidationError> {
        self.merge(update);
        self.updated_at = now;
        Ok(())
    }
}
