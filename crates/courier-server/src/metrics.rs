//! Prometheus metrics for the server.
//!
//! Counters and gauges are recorded through the `metrics` facade; nothing is
//! exported unless [`install`] registered the Prometheus recorder.

use crate::config::MetricsConfig;
use metrics::{counter, gauge, histogram, Unit};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing::info;

/// Metric names.
pub mod names {
    pub const SESSIONS_TOTAL: &str = "courier_sessions_total";
    pub const SESSIONS_ACTIVE: &str = "courier_sessions_active";
    pub const EVENTS: &str = "courier_events_total";
    pub const EVENT_BYTES: &str = "courier_event_bytes_total";
    pub const ROOMS: &str = "courier_rooms";
    pub const HANDSHAKE_REJECTED: &str = "courier_handshake_rejected_total";
    pub const STORE_PURGED: &str = "courier_store_purged_total";
    pub const HANDLE_SECONDS: &str = "courier_handle_seconds";
    pub const ERRORS: &str = "courier_errors_total";
}

fn describe() {
    metrics::describe_counter!(names::SESSIONS_TOTAL, "Authenticated sessions since start");
    metrics::describe_gauge!(names::SESSIONS_ACTIVE, "Authenticated sessions currently open");
    metrics::describe_counter!(names::EVENTS, "Events by name and direction");
    metrics::describe_counter!(names::EVENT_BYTES, Unit::Bytes, "Encoded event bytes by direction");
    metrics::describe_gauge!(names::ROOMS, "Rooms currently held by the router");
    metrics::describe_counter!(names::HANDSHAKE_REJECTED, "Connections refused before connect completed");
    metrics::describe_counter!(names::STORE_PURGED, "Expired queue and presence entries removed");
    metrics::describe_histogram!(names::HANDLE_SECONDS, Unit::Seconds, "Time to handle one inbound frame");
    metrics::describe_counter!(names::ERRORS, "Errors by kind");
}

/// Describe all metrics and, if enabled, serve them over HTTP.
///
/// # Errors
///
/// Returns an error if the exporter cannot bind its listener.
pub fn install(config: &MetricsConfig) -> anyhow::Result<()> {
    describe();
    if !config.enabled {
        return Ok(());
    }

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    info!("Metrics exporter listening on {}", addr);
    Ok(())
}

/// Record an event crossing the socket.
pub fn record_event(event: &'static str, bytes: usize, direction: &'static str) {
    counter!(names::EVENTS, "event" => event, "direction" => direction).increment(1);
    counter!(names::EVENT_BYTES, "direction" => direction).increment(bytes as u64);
}

pub fn record_handle_time(seconds: f64) {
    histogram!(names::HANDLE_SECONDS).record(seconds);
}

pub fn set_rooms(count: usize) {
    gauge!(names::ROOMS).set(count as f64);
}

pub fn record_handshake_rejected(reason: &'static str) {
    counter!(names::HANDSHAKE_REJECTED, "reason" => reason).increment(1);
}

pub fn record_purged(count: usize) {
    counter!(names::STORE_PURGED).increment(count as u64);
}

pub fn record_error(kind: &'static str) {
    counter!(names::ERRORS, "kind" => kind).increment(1);
}

/// Counts a session as active for as long as it lives.
pub struct ActiveSession(());

impl ActiveSession {
    #[must_use]
    pub fn start() -> Self {
        counter!(names::SESSIONS_TOTAL).increment(1);
        gauge!(names::SESSIONS_ACTIVE).increment(1.0);
        Self(())
    }
}

impl Drop for ActiveSession {
    fn drop(&mut self) {
        gauge!(names::SESSIONS_ACTIVE).decrement(1.0);
    }
}
