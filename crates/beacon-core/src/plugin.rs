//! Plugin abstraction for Beacon.
//!
//! A plugin adapts one entity type to the wire protocol: it projects entities
//! into JSON payloads and serves the initial snapshot for new subscribers.
//!
//! Implementors normally write an [`EntityPlugin`], which is typed over its
//! entity. Every `EntityPlugin` is also a [`Plugin`], the object-safe form held
//! by the [`crate::PluginRegistry`].

use crate::store::{ListQuery, RecordStore, StoreError};
use async_trait::async_trait;
use beacon_protocol::{Snapshot, SubscriptionParams};
use serde_json::Value;
use std::any::{type_name, Any};
use thiserror::Error;

/// Maximum number of items served in an initial snapshot.
pub const INITIAL_SNAPSHOT_LIMIT: usize = 100;

/// Plugin errors.
#[derive(Debug, Error)]
pub enum PluginError {
    /// The entity handed to the plugin is not the type it projects.
    #[error("Plugin for topic '{topic}' expects {expected}")]
    EntityMismatch {
        topic: String,
        expected: &'static str,
    },

    /// The record store failed.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Object-safe plugin interface.
#[async_trait]
pub trait Plugin: Send + Sync {
    /// Topic served by this plugin.
    fn topic(&self) -> &str;

    /// Project an entity into its wire payload.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::EntityMismatch`] if `entity` is not this plugin's entity type.
    fn to_payload(&self, entity: &dyn Any) -> Result<Value, PluginError>;

    /// Fetch the initial snapshot for a new subscription.
    ///
    /// At most [`INITIAL_SNAPSHOT_LIMIT`] items are returned regardless of `total`.
    ///
    /// # Errors
    ///
    /// Returns an error if the record store fails.
    async fn fetch_initial(&self, params: &SubscriptionParams) -> Result<Snapshot, PluginError>;
}

/// A plugin for a concrete entity type.
pub trait EntityPlugin: Send + Sync + 'static {
    /// Entity type projected by this plugin.
    type Entity: Send + Sync + 'static;

    /// Topic name used in the registry and in client messages.
    const TOPIC: &'static str;

    /// Project an entity into its wire payload. Must be pure.
    fn project(&self, entity: &Self::Entity) -> Value;

    /// Store the initial snapshot is read from.
    fn store(&self) -> &dyn RecordStore<Self::Entity>;
}

#[async_trait]
impl<P: EntityPlugin> Plugin for P {
    fn topic(&self) -> &str {
        P::TOPIC
    }

    fn to_payload(&self, entity: &dyn Any) -> Result<Value, PluginError> {
        entity
            .downcast_ref::<P::Entity>()
            .map(|entity| self.project(entity))
            .ok_or_else(|| PluginError::EntityMismatch {
                topic: P::TOPIC.to_string(),
                expected: type_name::<P::Entity>(),
            })
    }

    async fn fetch_initial(&self, params: &SubscriptionParams) -> Result<Snapshot, PluginError> {
        let query = ListQuery::new(INITIAL_SNAPSHOT_LIMIT).with_filters(params.filters.clone());
        let page = self.store().list(&query).await?;

        let items = page
            .items
            .iter()
            .take(INITIAL_SNAPSHOT_LIMIT)
            .map(|entity| self.project(entity))
            .collect();

        Ok(Snapshot {
            items,
            total: page.total,
        })
    }
}
