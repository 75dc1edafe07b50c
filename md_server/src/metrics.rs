//! Prometheus metrics for monitoring the schedule server.
//!
//! Metrics are exposed in Prometheus text format on a separate listener for
//! scraping by monitoring systems. Recording is a no-op until
//! [`init_metrics`] installs the exporter.
//!
//! # Metrics Categories
//!
//! - **HTTP Metrics**: Request counts and duration by route and status
//! - **Realtime Metrics**: Connected clients, frames sent, forced disconnects
//! - **Schedule Metrics**: Committed mutations, placements, deferrals, clashes
//!
//! # Example Usage
//!
//! ```rust,no_run
//! use md_server::metrics;
//! use std::net::SocketAddr;
//!
//! let addr: SocketAddr = "127.0.0.1:9090".parse().unwrap();
//! metrics::init_metrics(addr).unwrap();
//!
//! metrics::http_requests_total("POST", "/api/v1/schedule/run", 200);
//! metrics::realtime_clients_active(10);
//! ```

use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;

/// Initialize Prometheus metrics exporter.
///
/// Metrics will be available at `http://<addr>/metrics`.
pub fn init_metrics(addr: SocketAddr) -> Result<(), String> {
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| format!("Failed to install Prometheus exporter: {}", e))
}

// ============================================================================
// HTTP Metrics
// ============================================================================

/// Record HTTP request.
pub fn http_requests_total(method: &str, path: &str, status: u16) {
    metrics::counter!("http_requests_total",
        "method" => method.to_string(),
        "path" => path.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

/// Record HTTP request duration in milliseconds.
pub fn http_request_duration_ms(method: &str, path: &str, duration_ms: f64) {
    metrics::histogram!("http_request_duration_ms",
        "method" => method.to_string(),
        "path" => path.to_string()
    )
    .record(duration_ms);
}

// ============================================================================
// Realtime Metrics
// ============================================================================

/// Set current connected realtime clients.
pub fn realtime_clients_active(count: usize) {
    metrics::gauge!("realtime_clients_active").set(count as f64);
}

/// Increment total realtime connections counter, labelled by how the
/// client was brought up to date.
pub fn realtime_connections_total(sync: &str) {
    metrics::counter!("realtime_connections_total",
        "sync" => sync.to_string()
    )
    .increment(1);
}

/// Increment realtime frames sent counter.
pub fn realtime_frames_sent() {
    metrics::counter!("realtime_frames_sent").increment(1);
}

/// Increment forced disconnect counter.
pub fn realtime_disconnects_total(reason: &str) {
    metrics::counter!("realtime_disconnects_total",
        "reason" => reason.to_string()
    )
    .increment(1);
}

// ============================================================================
// Schedule Metrics
// ============================================================================

/// Set the mutation log head sequence.
pub fn log_head_seq(seq: u64) {
    metrics::gauge!("mutation_log_head_seq").set(seq as f64);
}

/// Increment committed operator commands counter.
pub fn schedule_commands_total(command: &str, success: bool) {
    metrics::counter!("schedule_commands_total",
        "command" => command.to_string(),
        "success" => success.to_string()
    )
    .increment(1);
}

/// Increment matches placed counter.
pub fn matches_placed_total(count: usize) {
    metrics::counter!("matches_placed_total").increment(count as u64);
}

/// Set current deferred match count.
pub fn matches_deferred(count: usize) {
    metrics::gauge!("matches_deferred").set(count as f64);
}

/// Increment rejected placements counter.
pub fn clash_rejections_total() {
    metrics::counter!("clash_rejections_total").increment(1);
}

/// Record scheduling pass duration in milliseconds.
pub fn schedule_pass_duration_ms(duration_ms: f64) {
    metrics::histogram!("schedule_pass_duration_ms").record(duration_ms);
}
