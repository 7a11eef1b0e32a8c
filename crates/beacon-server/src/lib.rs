//! # beacon-server
//!
//! WebSocket transport, configuration, authentication and the built-in
//! topics for the Beacon subscription broker.
//!
//! The binary (`beacon`) wires these together; the library is exposed so the
//! server can be embedded and driven from integration tests.

pub mod api;
pub mod auth;
pub mod config;
pub mod entities;
pub mod handlers;
pub mod metrics;
pub mod plugins;
pub mod store;

pub use auth::JwtValidator;
pub use config::Config;
pub use handlers::{router, run_server, serve, AppState};
pub use plugins::{build_registry, Stores};
