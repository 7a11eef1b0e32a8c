//! Connection handlers for Beacon server.
//!
//! This module handles the WebSocket connection lifecycle: token admission,
//! the reader loop feeding the connection manager, and the writer task
//! draining the connection's outbound queue.

use crate::api;
use crate::auth::{self, JwtValidator};
use crate::config::Config;
use crate::metrics::{self, ConnectionMetricsGuard};
use crate::plugins::{build_registry, Stores};
use anyhow::{Context, Result};
use axum::{
    extract::{
        ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use beacon_core::{
    admit, Connection, ConnectionManager, EventProcessor, Identity, OutboundReceiver,
};
use beacon_protocol::{codec, ErrorCode, EventType, ServerMessage};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use std::any::Any;
use std::borrow::Cow;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Shared server state.
pub struct AppState {
    /// Live connections and fan-out.
    pub manager: Arc<ConnectionManager>,
    /// Entry point for entity change events.
    pub events: EventProcessor,
    /// Token validation.
    pub validator: Arc<JwtValidator>,
    /// Record stores behind the plugins and the mutation API.
    pub stores: Stores,
    /// Server configuration.
    pub config: Config,
}

impl AppState {
    /// Build the server state and start the event dispatcher.
    ///
    /// # Errors
    ///
    /// Returns an error if the plugin registry or token validator cannot be built.
    pub fn new(config: Config) -> Result<(Arc<Self>, JoinHandle<()>)> {
        let stores = Stores::default();
        let registry = build_registry(&stores).context("Failed to register plugins")?;
        let manager = Arc::new(ConnectionManager::with_config(
            Arc::new(registry),
            config.manager_config(),
        ));
        let (events, dispatcher) = EventProcessor::spawn_with(
            Arc::clone(&manager),
            config.limits.event_queue_capacity,
            metrics::record_broadcast,
        );
        let validator = Arc::new(JwtValidator::from_secret(
            &config.auth.secret_key,
            &config.auth.algorithm,
        )?);

        let state = Arc::new(Self {
            manager,
            events,
            validator,
            stores,
            config,
        });
        Ok((state, dispatcher))
    }

    /// Publish an entity change. Never waits for delivery.
    pub fn publish<E: Any + Send + Sync>(&self, topic: &str, event_type: EventType, entity: &E) {
        if self.events.publish(topic, event_type, entity).is_ok() {
            metrics::record_published(topic, event_type);
        }
    }
}

/// Build the HTTP router.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route(&state.config.transport.websocket_path, get(ws_handler))
        .route("/health", get(health_handler))
        .merge(auth::routes())
        .merge(api::routes())
        .with_state(state)
}

/// Run the HTTP/WebSocket server until ctrl-c.
///
/// # Errors
///
/// Returns an error if the server fails to start.
pub async fn run_server(config: Config) -> Result<()> {
    // Start metrics server if enabled
    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            error!("Failed to start metrics server: {}", e);
        }
    }

    let addr = config.bind_addr()?;
    let (state, dispatcher) = AppState::new(config)?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;

    info!("Beacon server listening on {}", addr);
    info!(
        "WebSocket endpoint: ws://{}{}",
        addr, state.config.transport.websocket_path
    );
    info!(topics = ?state.manager.registry().topics(), "Plugins registered");

    serve(listener, state, shutdown_signal()).await?;
    dispatcher.await.ok();

    info!("Beacon server stopped");
    Ok(())
}

/// Serve on `listener` until `shutdown` resolves, then close every connection.
///
/// # Errors
///
/// Returns an error if the server fails.
pub async fn serve<F>(listener: TcpListener, state: Arc<AppState>, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let manager = Arc::clone(&state.manager);
    let grace = state.config.grace_period();
    let app = router(state);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown.await;
            info!("Shutting down");
            manager.shutdown(grace).await;
        })
        .await?;

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
}

/// Health check handler.
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "connections": state.manager.connection_count(),
        "topics": state.manager.registry().topics(),
    }))
}

#[derive(Debug, Deserialize)]
struct WsParams {
    token: Option<String>,
}

/// WebSocket upgrade handler.
async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<WsParams>,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    let strict = state.config.auth.require_valid_token;
    match admit(state.validator.as_ref(), params.token.as_deref(), strict) {
        Ok(identity) => ws.on_upgrade(move |socket| handle_websocket(socket, state, identity)),
        Err(e) => {
            info!(error = %e, "Rejecting connection with invalid token");
            ws.on_upgrade(|socket| close_with(socket, close_code::POLICY, "Invalid token"))
        }
    }
}

async fn close_with(mut socket: WebSocket, code: u16, reason: &'static str) {
    let frame = CloseFrame {
        code,
        reason: Cow::Borrowed(reason),
    };
    socket.send(Message::Close(Some(frame))).await.ok();
}

/// Handle a WebSocket connection.
async fn handle_websocket(socket: WebSocket, state: Arc<AppState>, identity: Option<Identity>) {
    let (conn, rx) = match state.manager.open(identity) {
        Ok(opened) => opened,
        Err(e) => {
            debug!(error = %e, "Refusing connection");
            close_with(socket, close_code::AWAY, "Server shutting down").await;
            return;
        }
    };

    // Record connection metrics
    let _metrics_guard = ConnectionMetricsGuard::new();

    let (sender, mut receiver) = socket.split();
    let writer = tokio::spawn(write_loop(
        sender,
        rx,
        Arc::clone(&conn),
        Arc::clone(&state.manager),
    ));

    loop {
        tokio::select! {
            _ = conn.closed() => break,

            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        handle_frame(&state, &conn, &text).await;
                    }
                    Some(Ok(Message::Binary(data))) => match std::str::from_utf8(&data) {
                        Ok(text) => handle_frame(&state, &conn, text).await,
                        Err(_) => {
                            metrics::record_error(ErrorCode::InvalidFormat.as_str());
                            conn.enqueue(ServerMessage::error(
                                ErrorCode::InvalidFormat,
                                "Binary frames must contain UTF-8 JSON",
                            ))
                            .ok();
                        }
                    },
                    Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => {
                        // Transport-level keepalive, answered by the socket
                    }
                    Some(Ok(Message::Close(_))) => {
                        debug!(connection = %conn.id(), "Received close frame");
                        break;
                    }
                    Some(Err(e)) => {
                        warn!(connection = %conn.id(), error = %e, "WebSocket error");
                        metrics::record_error("websocket");
                        break;
                    }
                    None => {
                        debug!(connection = %conn.id(), "WebSocket stream ended");
                        break;
                    }
                }
            }
        }
    }

    let held = conn.subscription_count();
    conn.begin_close();
    if tokio::time::timeout(state.config.grace_period(), writer)
        .await
        .is_err()
    {
        warn!(connection = %conn.id(), "Writer did not finish within grace period");
    }

    state.manager.unregister(conn.id());
    metrics::adjust_subscriptions(held, 0);
}

/// Handle one inbound frame.
async fn handle_frame(state: &AppState, conn: &Arc<Connection>, text: &str) {
    let start = Instant::now();
    metrics::record_message(text.len(), "inbound");

    let before = conn.subscription_count();
    if let Some(code) = state.manager.handle_text(conn, text).await {
        metrics::record_error(code.as_str());
    }
    metrics::adjust_subscriptions(before, conn.subscription_count());

    metrics::record_latency(start.elapsed().as_secs_f64());
}

/// Drain the outbound queue into the socket.
///
/// Once teardown starts, whatever is already queued is flushed and a close
/// frame is sent.
async fn write_loop(
    mut sender: SplitSink<WebSocket, Message>,
    mut rx: OutboundReceiver,
    conn: Arc<Connection>,
    manager: Arc<ConnectionManager>,
) {
    loop {
        tokio::select! {
            biased;

            message = rx.recv() => match message {
                Some(message) => {
                    if send_message(&mut sender, &message).await.is_err() {
                        conn.begin_close();
                        return;
                    }
                }
                None => break,
            },

            _ = conn.closed() => break,
        }
    }

    while let Ok(message) = rx.try_recv() {
        if send_message(&mut sender, &message).await.is_err() {
            return;
        }
    }

    let frame = if manager.is_shutting_down() {
        CloseFrame {
            code: close_code::AWAY,
            reason: Cow::Borrowed("Server shutting down"),
        }
    } else {
        CloseFrame {
            code: close_code::NORMAL,
            reason: Cow::Borrowed(""),
        }
    };
    sender.send(Message::Close(Some(frame))).await.ok();
}

/// Send a message to the WebSocket.
async fn send_message(
    sender: &mut SplitSink<WebSocket, Message>,
    message: &ServerMessage,
) -> Result<()> {
    let text = codec::encode(message)?;
    metrics::record_message(text.len(), "outbound");
    sender.send(Message::Text(text)).await?;
    Ok(())
}
