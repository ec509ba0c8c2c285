//! Instrumentation for the realtime core.
//!
//! Recording is a no-op until a recorder is installed; the server installs
//! the Prometheus exporter.

use metrics::{counter, gauge, histogram};

use crate::connection::SendError;

/// Metric names.
pub mod names {
    pub const CONNECTIONS_TOTAL: &str = "talkroom_connections_total";
    pub const CONNECTIONS_ACTIVE: &str = "talkroom_connections_active";
    pub const AUTH_FAILURES_TOTAL: &str = "talkroom_auth_failures_total";
    pub const CONNECTIONS_REFUSED_TOTAL: &str = "talkroom_connections_refused_total";
    pub const FRAMES_TOTAL: &str = "talkroom_frames_total";
    pub const FRAMES_DROPPED_TOTAL: &str = "talkroom_frames_dropped_total";
    pub const DELIVERIES_TOTAL: &str = "talkroom_deliveries_total";
    pub const DELIVERY_FAILURES_TOTAL: &str = "talkroom_delivery_failures_total";
    pub const EVICTIONS_TOTAL: &str = "talkroom_evictions_total";
    pub const PERSISTENCE_FAILURES_TOTAL: &str = "talkroom_persistence_failures_total";
    pub const LATENCY_SECONDS: &str = "talkroom_frame_latency_seconds";
}

/// Register descriptions for every core metric.
pub fn describe() {
    metrics::describe_counter!(
        names::CONNECTIONS_TOTAL,
        "Total number of authenticated connections since start"
    );
    metrics::describe_gauge!(
        names::CONNECTIONS_ACTIVE,
        "Current number of active connections"
    );
    metrics::describe_counter!(names::AUTH_FAILURES_TOTAL, "Rejected handshakes by reason");
    metrics::describe_counter!(
        names::CONNECTIONS_REFUSED_TOTAL,
        "Connections refused at the capacity limit"
    );
    metrics::describe_counter!(names::FRAMES_TOTAL, "Inbound frames handled by kind");
    metrics::describe_counter!(names::FRAMES_DROPPED_TOTAL, "Inbound frames dropped by reason");
    metrics::describe_counter!(names::DELIVERIES_TOTAL, "Events enqueued to recipients by kind");
    metrics::describe_counter!(
        names::DELIVERY_FAILURES_TOTAL,
        "Failed enqueues by reason"
    );
    metrics::describe_counter!(names::EVICTIONS_TOTAL, "Connections evicted by reason");
    metrics::describe_counter!(
        names::PERSISTENCE_FAILURES_TOTAL,
        "Messages the store failed to persist"
    );
    metrics::describe_histogram!(
        names::LATENCY_SECONDS,
        "Inbound frame handling latency in seconds"
    );
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

/// Record a rejected handshake.
pub fn record_auth_failure(reason: &'static str) {
    counter!(names::AUTH_FAILURES_TOTAL, "reason" => reason).increment(1);
}

/// Record a connection refused at capacity.
pub fn record_refused() {
    counter!(names::CONNECTIONS_REFUSED_TOTAL).increment(1);
}

/// Record an inbound frame.
pub fn record_frame(kind: &'static str, seconds: f64) {
    counter!(names::FRAMES_TOTAL, "kind" => kind).increment(1);
    histogram!(names::LATENCY_SECONDS, "kind" => kind).record(seconds);
}

/// Record a dropped inbound frame.
pub fn record_dropped(reason: &'static str) {
    counter!(names::FRAMES_DROPPED_TOTAL, "reason" => reason).increment(1);
}

/// Record one enqueue attempt.
pub fn record_delivery(kind: &'static str, error: Option<&SendError>) {
    match error {
        None => counter!(names::DELIVERIES_TOTAL, "kind" => kind).increment(1),
        Some(e) => counter!(names::DELIVERY_FAILURES_TOTAL, "reason" => e.reason()).increment(1),
    }
}

/// Record a connection evicted by the core.
pub fn record_eviction(reason: &'static str) {
    counter!(names::EVICTIONS_TOTAL, "reason" => reason).increment(1);
}

/// Record a failed message append.
pub fn record_persistence_failure() {
    counter!(names::PERSISTENCE_FAILURES_TOTAL).increment(1);
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
