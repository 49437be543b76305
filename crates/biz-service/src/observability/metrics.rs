//! Metrics definitions for the signaling node.
//!
//! All metrics use the `biz_` prefix, `_total` for counters and `_seconds`
//! for duration histograms.

use crate::signaling::handlers::{METHOD_JOIN, METHOD_LEAVE, METHOD_PUBLISH, METHOD_UNPUBLISH};
use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::time::Duration;

/// Install the Prometheus recorder and return the handle used to render
/// `/metrics`.
///
/// # Errors
///
/// Returns error if a recorder is already installed.
pub fn init_metrics_recorder() -> Result<PrometheusHandle, String> {
    PrometheusBuilder::new()
        .set_buckets_for_metric(
            Matcher::Prefix("biz_check_rooms".to_string()),
            &[
                0.005, 0.010, 0.025, 0.050, 0.100, 0.250, 0.500, 1.000, 2.500, 5.000, 10.000,
            ],
        )
        .map_err(|e| format!("Failed to set room check buckets: {e}"))?
        .install_recorder()
        .map_err(|e| format!("Failed to install Prometheus metrics recorder: {e}"))
}

/// Metric: `biz_rooms_active`
pub fn set_rooms_active(count: usize) {
    #[allow(clippy::cast_precision_loss)]
    gauge!("biz_rooms_active").set(count as f64);
}

/// Metric: `biz_peers_active`
pub fn set_peers_active(count: usize) {
    #[allow(clippy::cast_precision_loss)]
    gauge!("biz_peers_active").set(count as f64);
}

/// Metric: `biz_peers_evicted_total`
pub fn record_peer_evicted() {
    counter!("biz_peers_evicted_total").increment(1);
}

/// Metric: `biz_rpc_failures_total`
/// Labels: `method`
pub fn record_rpc_failure(method: &'static str) {
    counter!("biz_rpc_failures_total", "method" => method).increment(1);
}

/// Metric: `biz_signal_requests_total`
/// Labels: `method`, `status` (success, error)
pub fn record_signal_request(method: &str, ok: bool) {
    let method = bounded_method(method);
    let status = if ok { "success" } else { "error" };
    counter!("biz_signal_requests_total", "method" => method, "status" => status).increment(1);
}

/// Metric: `biz_check_rooms_duration_seconds`
pub fn record_check_rooms_duration(duration: Duration) {
    histogram!("biz_check_rooms_duration_seconds").record(duration.as_secs_f64());
}

fn bounded_method(method: &str) -> &'static str {
    match method {
        METHOD_JOIN => METHOD_JOIN,
        METHOD_LEAVE => METHOD_LEAVE,
        METHOD_PUBLISH => METHOD_PUBLISH,
        METHOD_UNPUBLISH => METHOD_UNPUBLISH,
        _ => "unknown",
    }
}
