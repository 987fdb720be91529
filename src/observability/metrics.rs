//! Metrics collection and exposition.
//!
//! # Metrics
//! - `msgr_messages_sent_total` / `msgr_messages_received_total` (counter)
//! - `msgr_bytes_sent_total` / `msgr_bytes_received_total` (counter)
//! - `msgr_duplicates_dropped_total` (counter)
//! - `msgr_socket_faults_total` (counter): by lossy/lossless
//! - `msgr_handshakes_total` (counter): by side and result
//! - `msgr_sessions_replaced_total` (counter)
//! - `msgr_throttle_waits_total` (counter): by throttle name
//! - `msgr_dispatch_queue_depth` (gauge)
//! - `msgr_dispatch_latency_seconds` (histogram): receive to dispatch
//! - `msgr_active_sockets` (gauge)
//!
//! # Design Decisions
//! - Recording goes through the `metrics` facade; without an installed
//!   recorder every call is a no-op
//! - The Prometheus exporter is opt-in from configuration

use std::net::SocketAddr;
use std::time::Duration;

use metrics_exporter_prometheus::PrometheusBuilder;

/// Install the Prometheus exporter on `addr`. Must run inside a Tokio runtime.
pub fn init_metrics(addr: SocketAddr) {
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => tracing::info!(address = %addr, "metrics exporter listening"),
        Err(e) => tracing::error!(error = %e, address = %addr, "failed to install metrics exporter"),
    }
}

pub fn record_message_sent(bytes: usize) {
    ::metrics::counter!("msgr_messages_sent_total").increment(1);
    ::metrics::counter!("msgr_bytes_sent_total").increment(bytes as u64);
}

pub fn record_message_received(bytes: usize) {
    ::metrics::counter!("msgr_messages_received_total").increment(1);
    ::metrics::counter!("msgr_bytes_received_total").increment(bytes as u64);
}

pub fn record_duplicate_dropped() {
    ::metrics::counter!("msgr_duplicates_dropped_total").increment(1);
}

pub fn record_socket_fault(lossy: bool) {
    let kind = if lossy { "lossy" } else { "lossless" };
    ::metrics::counter!("msgr_socket_faults_total", "policy" => kind).increment(1);
}

pub fn record_handshake(side: &'static str, result: &'static str) {
    ::metrics::counter!("msgr_handshakes_total", "side" => side, "result" => result).increment(1);
}

pub fn record_session_replaced() {
    ::metrics::counter!("msgr_sessions_replaced_total").increment(1);
}

pub fn record_throttle_wait(name: &str) {
    ::metrics::counter!("msgr_throttle_waits_total", "throttle" => name.to_string()).increment(1);
}

pub fn set_dispatch_queue_depth(depth: usize) {
    ::metrics::gauge!("msgr_dispatch_queue_depth").set(depth as f64);
}

pub fn record_dispatch_latency(latency: Duration) {
    ::metrics::histogram!("msgr_dispatch_latency_seconds").record(latency.as_secs_f64());
}

pub fn set_active_sockets(count: usize) {
    ::metrics::gauge!("msgr_active_sockets").set(count as f64);
}
