//! Metrics collection and export for Beacon.
//!
//! Uses the `metrics` crate for instrumentation and exports
//! to Prometheus format.

use beacon_core::{BroadcastOutcome, Event};
use beacon_protocol::EventType;
use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing::info;

/// Metric names.
pub mod names {
    pub const CONNECTIONS_TOTAL: &str = "beacon_connections_total";
    pub const CONNECTIONS_ACTIVE: &str = "beacon_connections_active";
    pub const MESSAGES_TOTAL: &str = "beacon_messages_total";
    pub const MESSAGES_BYTES: &str = "beacon_messages_bytes";
    pub const SUBSCRIPTIONS_ACTIVE: &str = "beacon_subscriptions_active";
    pub const EVENTS_PUBLISHED_TOTAL: &str = "beacon_events_published_total";
    pub const EVENTS_DELIVERED_TOTAL: &str = "beacon_events_delivered_total";
    pub const EVENTS_DROPPED_TOTAL: &str = "beacon_events_dropped_total";
    pub const LATENCY_SECONDS: &str = "beacon_latency_seconds";
    pub const ERRORS_TOTAL: &str = "beacon_errors_total";
}

/// Initialize the metrics system.
pub fn init_metrics() {
    metrics::describe_counter!(
        names::CONNECTIONS_TOTAL,
        "Total number of connections since server start"
    );
    metrics::describe_gauge!(
        names::CONNECTIONS_ACTIVE,
        "Current number of active connections"
    );
    metrics::describe_counter!(names::MESSAGES_TOTAL, "Total number of frames processed");
    metrics::describe_counter!(names::MESSAGES_BYTES, "Total bytes of frames processed");
    metrics::describe_gauge!(
        names::SUBSCRIPTIONS_ACTIVE,
        "Current number of subscriptions across all connections"
    );
    metrics::describe_counter!(
        names::EVENTS_PUBLISHED_TOTAL,
        "Total number of entity events published"
    );
    metrics::describe_counter!(
        names::EVENTS_DELIVERED_TOTAL,
        "Total number of event frames queued for clients"
    );
    metrics::describe_counter!(
        names::EVENTS_DROPPED_TOTAL,
        "Total number of event frames dropped on full queues"
    );
    metrics::describe_histogram!(
        names::LATENCY_SECONDS,
        "Inbound frame handling latency in seconds"
    );
    metrics::describe_counter!(names::ERRORS_TOTAL, "Total number of errors by code");

    info!("Metrics initialized");
}

/// Start the Prometheus metrics server.
///
/// # Errors
///
/// Returns an error if the server cannot be started.
pub fn start_metrics_server(port: u16) -> Result<(), Box<dyn std::error::Error>> {
    let addr: SocketAddr = format!("0.0.0.0:{}", port).parse()?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;

    info!("Metrics server listening on {}", addr);
    Ok(())
}

/// Record a new connection.
pub fn record_connection() {
    counter!(names::CONNECTIONS_TOTAL).increment(1);
    gauge!(names::CONNECTIONS_ACTIVE).increment(1.0);
}

/// Record a disconnection.
pub fn record_disconnection() {
    gauge!(names::CONNECTIONS_ACTIVE).decrement(1.0);
}

/// Record a frame.
pub fn record_message(bytes: usize, direction: &'static str) {
    counter!(names::MESSAGES_TOTAL, "direction" => direction).increment(1);
    counter!(names::MESSAGES_BYTES, "direction" => direction).increment(bytes as u64);
}

/// Record frame handling latency.
pub fn record_latency(seconds: f64) {
    histogram!(names::LATENCY_SECONDS).record(seconds);
}

/// Adjust the active subscription gauge by the change on one connection.
pub fn adjust_subscriptions(before: usize, after: usize) {
    if after > before {
        gauge!(names::SUBSCRIPTIONS_ACTIVE).increment((after - before) as f64);
    } else if before > after {
        gauge!(names::SUBSCRIPTIONS_ACTIVE).decrement((before - after) as f64);
    }
}

/// Record an event accepted by the event processor.
pub fn record_published(topic: &str, event_type: EventType) {
    counter!(
        names::EVENTS_PUBLISHED_TOTAL,
        "topic" => topic.to_string(),
        "event_type" => event_type.as_str()
    )
    .increment(1);
}

/// Record the outcome of one broadcast.
pub fn record_broadcast(event: &Event, outcome: BroadcastOutcome) {
    counter!(names::EVENTS_DELIVERED_TOTAL, "topic" => event.topic.clone())
        .increment(outcome.recipients as u64);
    if outcome.dropped > 0 {
        counter!(names::EVENTS_DROPPED_TOTAL, "topic" => event.topic.clone())
            .increment(outcome.dropped as u64);
    }
}

/// Record an error.
pub fn record_error(code: &'static str) {
    counter!(names::ERRORS_TOTAL, "code" => code).increment(1);
}

/// Metrics guard that records disconnection on drop.
pub struct ConnectionMetricsGuard;

impl ConnectionMetricsGuard {
    /// Create a new metrics guard, recording a connection.
    #[must_use]
    pub fn new() -> Self {
        record_connection();
        Self
    }
}

impl Default for ConnectionMetricsGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ConnectionMetricsGuard {
    fn drop(&mut self) {
        record_disconnection();
    }
}
