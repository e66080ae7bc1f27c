//! Metrics collection and exposition.
//!
//! # Responsibilities
//! - Define gateway metrics (decisions, latency, blocks, degraded mode)
//! - Expose a Prometheus-compatible scrape endpoint
//!
//! # Metrics
//! - `gateway_requests_total` (counter): decisions by outcome and reason
//! - `gateway_evaluation_duration_seconds` (histogram): pipeline latency
//! - `gateway_blocked_ips` (gauge): active blocks
//! - `gateway_active_nonces` (gauge): remembered replay fingerprints
//! - `gateway_rate_limit_degraded` (gauge): 1 while on the local fallback
//! - `gateway_store_failures_total` (counter): shared store errors by kind
//! - `gateway_ip_blocks_total` (counter): blocks imposed
//!
//! # Design Decisions
//! - Recording functions are no-ops until a recorder is installed, so unit
//!   tests need no setup
//! - Labels carry reason codes only, never addresses

use std::net::SocketAddr;
use std::time::Instant;

use metrics_exporter_prometheus::PrometheusBuilder;

const COUNTER_REQUESTS: &str = "gateway_requests_total";
const HISTOGRAM_EVALUATION: &str = "gateway_evaluation_duration_seconds";
const GAUGE_BLOCKED_IPS: &str = "gateway_blocked_ips";
const GAUGE_ACTIVE_NONCES: &str = "gateway_active_nonces";
const GAUGE_DEGRADED: &str = "gateway_rate_limit_degraded";
const COUNTER_STORE_FAILURES: &str = "gateway_store_failures_total";
const COUNTER_IP_BLOCKS: &str = "gateway_ip_blocks_total";

/// Install the Prometheus recorder and its HTTP listener.
///
/// Must be called from within a Tokio runtime.
pub fn init_metrics(addr: SocketAddr) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    tracing::info!(address = %addr, "Metrics endpoint listening");
    Ok(())
}

/// Record one pipeline decision.
pub fn record_decision(outcome: &'static str, reason: &'static str, start: Instant) {
    metrics::counter!(COUNTER_REQUESTS, "outcome" => outcome, "reason" => reason).increment(1);
    metrics::histogram!(HISTOGRAM_EVALUATION).record(start.elapsed().as_secs_f64());
}

pub fn record_ip_block() {
    metrics::counter!(COUNTER_IP_BLOCKS).increment(1);
}

pub fn record_store_failure(kind: &'static str) {
    metrics::counter!(COUNTER_STORE_FAILURES, "kind" => kind).increment(1);
}

pub fn record_rate_limit_degraded(degraded: bool) {
    metrics::gauge!(GAUGE_DEGRADED).set(if degraded { 1.0 } else { 0.0 });
}

/// Refresh the state gauges. Called by the sweeper and the status endpoint.
pub fn record_state_sizes(blocked_ips: usize, active_nonces: usize) {
    metrics::gauge!(GAUGE_BLOCKED_IPS).set(blocked_ips as f64);
    metrics::gauge!(GAUGE_ACTIVE_NONCES).set(active_nonces as f64);
}
