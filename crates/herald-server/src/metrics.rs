//! Prometheus instrumentation.
//!
//! Everything is recorded through the `metrics` facade; nothing is exported
//! unless [`start_metrics_server`] installs the Prometheus recorder.

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing::info;

pub mod names {
    pub const CONNECTIONS_TOTAL: &str = "herald_connections_total";
    pub const CONNECTIONS_OPEN: &str = "herald_connections_open";
    pub const FRAMES_TOTAL: &str = "herald_frames_total";
    pub const FRAME_BYTES_TOTAL: &str = "herald_frame_bytes_total";
    pub const CHANNELS_OPEN: &str = "herald_channels_open";
    pub const SUBSCRIPTIONS_TOTAL: &str = "herald_subscriptions_total";
    pub const EVENTS_DISPATCHED_TOTAL: &str = "herald_events_dispatched_total";
    pub const PRESENCE_CHANGES_TOTAL: &str = "herald_presence_changes_total";
    pub const FRAME_SECONDS: &str = "herald_frame_handling_seconds";
    pub const ERRORS_TOTAL: &str = "herald_errors_total";
    pub const DELIVERIES_DROPPED_TOTAL: &str = "herald_deliveries_dropped_total";
}

/// Register metric descriptions.
pub fn init_metrics() {
    describe_counter!(names::CONNECTIONS_TOTAL, "WebSocket connections accepted");
    describe_gauge!(names::CONNECTIONS_OPEN, "WebSocket connections currently open");
    describe_counter!(names::FRAMES_TOTAL, "Frames sent and received, by direction");
    describe_counter!(names::FRAME_BYTES_TOTAL, "Frame bytes sent and received, by direction");
    describe_gauge!(names::CHANNELS_OPEN, "Channels with at least one subscriber");
    describe_counter!(names::SUBSCRIPTIONS_TOTAL, "Accepted channel subscriptions");
    describe_counter!(
        names::EVENTS_DISPATCHED_TOTAL,
        "Events handed to the router, by source"
    );
    describe_counter!(
        names::PRESENCE_CHANGES_TOTAL,
        "Presence members added and removed"
    );
    describe_histogram!(
        names::FRAME_SECONDS,
        "Time spent handling one inbound WebSocket message"
    );
    describe_counter!(names::ERRORS_TOTAL, "Errors, by kind");
    describe_counter!(
        names::DELIVERIES_DROPPED_TOTAL,
        "Deliveries dropped because a connection's outbox was full"
    );

    info!("Metrics initialized");
}

/// Serve the Prometheus scrape endpoint on `port`.
///
/// # Errors
///
/// Returns an error if the recorder is already installed or the port
/// cannot be bound.
pub fn start_metrics_server(port: u16) -> Result<(), Box<dyn std::error::Error>> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;

    info!("Metrics server listening on {}", addr);
    Ok(())
}

pub fn record_message(bytes: usize, direction: &'static str) {
    counter!(names::FRAMES_TOTAL, "direction" => direction).increment(1);
    counter!(names::FRAME_BYTES_TOTAL, "direction" => direction).increment(bytes as u64);
}

pub fn record_latency(seconds: f64) {
    histogram!(names::FRAME_SECONDS).record(seconds);
}

pub fn record_subscription() {
    counter!(names::SUBSCRIPTIONS_TOTAL).increment(1);
}

pub fn set_active_channels(count: usize) {
    gauge!(names::CHANNELS_OPEN).set(count as f64);
}

/// Count an event handed to the router by `source` (`http`, `redis`, `client`).
pub fn record_dispatch(source: &'static str) {
    counter!(names::EVENTS_DISPATCHED_TOTAL, "source" => source).increment(1);
}

/// Count a presence `join` or `leave`.
pub fn record_presence(action: &'static str) {
    counter!(names::PRESENCE_CHANGES_TOTAL, "action" => action).increment(1);
}

pub fn record_error(kind: &'static str) {
    counter!(names::ERRORS_TOTAL, "kind" => kind).increment(1);
}

/// Mirror the router's running count of dropped deliveries.
pub fn set_dropped_deliveries(total: u64) {
    counter!(names::DELIVERIES_DROPPED_TOTAL).absolute(total);
}

/// Counts a connection as open for as long as it lives.
pub struct ConnectionMetricsGuard;

impl ConnectionMetricsGuard {
    #[must_use]
    pub fn new() -> Self {
        counter!(names::CONNECTIONS_TOTAL).increment(1);
        gauge!(names::CONNECTIONS_OPEN).increment(1.0);
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
        gauge!(names::CONNECTIONS_OPEN).decrement(1.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recording_without_exporter() {
        let guard = ConnectionMetricsGuard::new();
        record_message(12, "inbound");
        record_dispatch("http");
        record_presence("join");
        record_error("websocket");
        set_dropped_deliveries(3);
        drop(guard);
    }
}
