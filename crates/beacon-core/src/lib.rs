//! # beacon-core
//!
//! Connection registry, subscriptions and event fan-out for the Beacon
//! subscription broker.
//!
//! This crate provides the fundamental building blocks:
//!
//! - **Plugin** - Adapter between a concrete entity type and the wire protocol
//! - **PluginRegistry** - Read-only topic to plugin mapping built at startup
//! - **SubscriptionTable** - Per-connection subscriptions with a hard cap
//! - **Connection** - One live client session and its outbound queue
//! - **ConnectionManager** - Live connection set, message handling and broadcast
//! - **EventProcessor** - Non-blocking entry point for entity mutations
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐  publish  ┌────────────────┐ broadcast ┌───────────────────┐
//! │ Mutation API │──────────▶│ EventProcessor │──────────▶│ ConnectionManager │
//! └──────────────┘           └────────────────┘           └───────────────────┘
//!                                    │                              │
//!                                    ▼                              ▼
//!                            ┌────────────────┐           ┌───────────────────┐
//!                            │ PluginRegistry │◀──────────│    Connection     │
//!                            └────────────────┘ subscribe └───────────────────┘
//! ```

pub mod auth;
pub mod connection;
pub mod event;
mod handler;
pub mod manager;
pub mod plugin;
pub mod processor;
pub mod registry;
pub mod store;
pub mod subscription;

pub use auth::{admit, AuthError, AuthValidator, Identity};
pub use connection::{Connection, ConnectionId, ConnectionState, EnqueueError, OutboundReceiver};
pub use event::Event;
pub use manager::{
    BroadcastOutcome, ConnectionManager, ManagerConfig, ManagerError, ManagerStats,
    DEFAULT_OUTBOUND_CAPACITY,
};
pub use plugin::{EntityPlugin, Plugin, PluginError, INITIAL_SNAPSHOT_LIMIT};
pub use processor::{EventProcessor, PublishError, DEFAULT_EVENT_QUEUE_CAPACITY};
pub use registry::{PluginRegistry, RegistryError};
pub use store::{ListQuery, Page, RecordStore, StoreError};
pub use subscription::{
    EventFilter, Subscription, SubscriptionError, SubscriptionTable,
    DEFAULT_MAX_SUBSCRIPTIONS,
};
