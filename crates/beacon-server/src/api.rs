//! Mutation API.
//!
//! Thin CRUD endpoints over the record stores. Every successful write is
//! followed by a non-blocking `publish` of the matching event; the HTTP
//! response never waits for delivery.

use crate::auth::AuthUser;
use crate::entities::{Mutable, Payment, Survey, TelegramUser, ValidationError};
use crate::handlers::AppState;
use crate::plugins::{PaymentPlugin, Stores, SurveyPlugin, TelegramUserPlugin};
use crate::store::MemoryStore;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use beacon_core::{EntityPlugin, ListQuery, RecordStore};
use beacon_protocol::EventType;
use chrono::Utc;
use serde::Deserialize;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

/// API errors, rendered as `{"detail": ...}`.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0} not found")]
    NotFound(&'static str),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("{0}")]
    Unauthorized(String),

    #[error("{0}")]
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
            ApiError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = Json(serde_json::json!({ "detail": self.to_string() }));
        (status, body).into_response()
    }
}

/// An entity exposed through the API.
pub trait Resource: Mutable {
    /// Topic events are published on.
    const TOPIC: &'static str;
    /// Name used in error messages.
    const NAME: &'static str;

    fn store(stores: &Stores) -> &MemoryStore<Self>;
}

impl Resource for Payment {
    const TOPIC: &'static str = PaymentPlugin::TOPIC;
    const NAME: &'static str = "Payment";

    fn store(stores: &Stores) -> &MemoryStore<Self> {
        &stores.payments
    }
}

impl Resource for TelegramUser {
    const TOPIC: &'static str = TelegramUserPlugin::TOPIC;
    const NAME: &'static str = "Telegram user";

    fn store(stores: &Stores) -> &MemoryStore<Self> {
        &stores.telegram_users
    }
}

impl Resource for Survey {
    const TOPIC: &'static str = SurveyPlugin::TOPIC;
    const NAME: &'static str = "Survey";

    fn store(stores: &Stores) -> &MemoryStore<Self> {
        &stores.surveys
    }
}

/// Build the mutation routes.
pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/api/payments", get(list::<Payment>).post(create::<Payment>))
        .route(
            "/api/payments/:id",
            get(read::<Payment>)
                .put(update::<Payment>)
                .delete(delete::<Payment>),
        )
        .route(
            "/api/telegram-users",
            get(list::<TelegramUser>).post(create::<TelegramUser>),
        )
        .route(
            "/api/telegram-users/:id",
            get(read::<TelegramUser>)
                .put(update::<TelegramUser>)
                .delete(delete::<TelegramUser>),
        )
        .route("/api/surveys", get(list::<Survey>).post(create::<Survey>))
        .route(
            "/api/surveys/:id",
            get(read::<Survey>)
                .put(update::<Survey>)
                .delete(delete::<Survey>),
        )
}

#[derive(Debug, Deserialize)]
struct ListParams {
    #[serde(default = "default_limit")]
    limit: usize,
}

fn default_limit() -> usize {
    100
}

async fn list<R: Resource>(
    State(state): State<Arc<AppState>>,
    _user: AuthUser,
    Query(params): Query<ListParams>,
) -> Result<Json<Vec<R>>, ApiError> {
    let page = R::store(&state.stores)
        .list(&ListQuery::new(params.limit))
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    Ok(Json(page.items))
}

async fn read<R: Resource>(
    State(state): State<Arc<AppState>>,
    _user: AuthUser,
    Path(id): Path<u64>,
) -> Result<Json<R>, ApiError> {
    R::store(&state.stores)
        .get(id)
        .map(Json)
        .ok_or(ApiError::NotFound(R::NAME))
}

async fn create<R: Resource>(
    State(state): State<Arc<AppState>>,
    AuthUser(user): AuthUser,
    Json(input): Json<R::Create>,
) -> Result<(StatusCode, Json<R>), ApiError> {
    let record = R::store(&state.stores).insert(R::create(input, Utc::now())?);
    debug!(topic = R::TOPIC, id = record.id(), user = %user.subject, "Created record");

    state.publish(R::TOPIC, EventType::Created, &record);
    Ok((StatusCode::CREATED, Json(record)))
}

async fn update<R: Resource>(
    State(state): State<Arc<AppState>>,
    _user: AuthUser,
    Path(id): Path<u64>,
    Json(input): Json<R::Update>,
) -> Result<Json<R>, ApiError> {
    let now = Utc::now();
    let record = R::store(&state.stores)
        .update(id, |record| record.apply(input, now))
        .ok_or(ApiError::NotFound(R::NAME))??;

    state.publish(R::TOPIC, EventType::Updated, &record);
    Ok(Json(record))
}

async fn delete<R: Resource>(
    State(state): State<Arc<AppState>>,
    _user: AuthUser,
    Path(id): Path<u64>,
) -> Result<StatusCode, ApiError> {
    let record = R::store(&state.stores)
        .remove(id)
        .ok_or(ApiError::NotFound(R::NAME))?;

    state.publish(R::TOPIC, EventType::Deleted, &record);
    Ok(StatusCode::NO_CONTENT)
}
