//! Metrics collection and exposition.
//!
//! # Metrics
//! - `bridge_rpc_calls_total` (counter): client calls by queue, outcome
//! - `bridge_rpc_duration_seconds` (histogram): client call latency by queue
//! - `bridge_admissions_total` (counter): consumer admission decisions by queue
//! - `bridge_backend_calls_total` (counter): backend invocations by queue, result
//! - `bridge_broker_reconnects_total` (counter): lost sessions by role
//! - `bridge_broker_connected` (gauge): 1=connected, 0=not, by role
//! - `bridge_malformed_deliveries_total` (counter): undecodable deliveries by queue, reason
//! - `bridge_redelivered_deliveries_total` (counter): redeliveries dropped unprocessed, by queue
//!
//! # Design Decisions
//! - Recording is a no-op until a recorder is installed, so tests need no setup
//! - Labels are bounded: queue names come from config, outcomes are fixed strings

use std::net::SocketAddr;
use std::time::Instant;

use metrics_exporter_prometheus::PrometheusBuilder;

/// Install the Prometheus exporter with an HTTP scrape listener.
pub fn init_metrics(addr: SocketAddr) {
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => tracing::info!(address = %addr, "Metrics exporter listening"),
        Err(e) => tracing::error!(address = %addr, error = %e, "Failed to install metrics exporter"),
    }
}

pub fn record_rpc_call(queue: &str, outcome: &'static str, started: Instant) {
    metrics::counter!(
        "bridge_rpc_calls_total",
        "queue" => queue.to_string(),
        "outcome" => outcome
    )
    .increment(1);
    metrics::histogram!("bridge_rpc_duration_seconds", "queue" => queue.to_string())
        .record(started.elapsed().as_secs_f64());
}

pub fn record_admission(queue: &str, admitted: bool) {
    let decision = if admitted { "admitted" } else { "rejected" };
    metrics::counter!(
        "bridge_admissions_total",
        "queue" => queue.to_string(),
        "decision" => decision
    )
    .increment(1);
}

pub fn record_backend_call(queue: &str, success: bool) {
    let result = if success { "success" } else { "failure" };
    metrics::counter!(
        "bridge_backend_calls_total",
        "queue" => queue.to_string(),
        "result" => result
    )
    .increment(1);
}

pub fn record_reconnect(role: &'static str) {
    metrics::counter!("bridge_broker_reconnects_total", "role" => role).increment(1);
}

pub fn record_broker_connected(role: &'static str, connected: bool) {
    metrics::gauge!("bridge_broker_connected", "role" => role).set(if connected { 1.0 } else { 0.0 });
}

pub fn record_malformed(queue: &str, reason: &'static str) {
    metrics::counter!(
        "bridge_malformed_deliveries_total",
        "queue" => queue.to_string(),
        "reason" => reason
    )
    .increment(1);
}

pub fn record_redelivered(queue: &str) {
    metrics::counter!("bridge_redelivered_deliveries_total", "queue" => queue.to_string()).increment(1);
}
