//! Metrics collection and exposition.
//!
//! # Responsibilities
//! - Define gateway metrics (connections, frames, drops, backends)
//! - Expose Prometheus-compatible metrics endpoint
//!
//! # Metrics
//! - `gateway_connections_active` (gauge): registered client connections
//! - `gateway_connections_total` (counter): accepted and registered clients
//! - `gateway_connections_rejected_total` (counter): refused at capacity
//! - `gateway_frames_total` (counter): frames by direction
//! - `gateway_messages_dropped_total` (counter): drops by reason
//! - `gateway_backend_connected` (gauge): 1=connected, 0=not, per target
//! - `gateway_pending_correlations` (gauge): requests awaiting replies
//!
//! # Design Decisions
//! - Facade calls are no-ops until an exporter is installed, so tests and
//!   library users pay nothing
//! - Labels are low-cardinality: direction, reason, target label

use std::net::SocketAddr;

use metrics_exporter_prometheus::PrometheusBuilder;

/// Start the Prometheus scrape endpoint.
pub fn init_metrics(addr: SocketAddr) {
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => tracing::info!(address = %addr, "Metrics endpoint listening"),
        Err(e) => tracing::error!(address = %addr, error = %e, "Failed to install metrics exporter"),
    }
}

pub fn record_connection_opened(active: usize) {
    metrics::counter!("gateway_connections_total").increment(1);
    metrics::gauge!("gateway_connections_active").set(active as f64);
}

pub fn record_connection_closed(active: usize) {
    metrics::gauge!("gateway_connections_active").set(active as f64);
}

pub fn record_connection_rejected() {
    metrics::counter!("gateway_connections_rejected_total").increment(1);
}

/// `direction` is `inbound` or `outbound`.
pub fn record_frame(direction: &'static str) {
    metrics::counter!("gateway_frames_total", "direction" => direction).increment(1);
}

pub fn record_dropped(reason: &'static str) {
    metrics::counter!("gateway_messages_dropped_total", "reason" => reason).increment(1);
}

pub fn record_backend_connected(target: &str, connected: bool) {
    metrics::gauge!("gateway_backend_connected", "target" => target.to_string())
        .set(if connected { 1.0 } else { 0.0 });
}

pub fn record_pending_correlations(pending: usize) {
    metrics::gauge!("gateway_pending_correlations").set(pending as f64);
}
