//! Metrics definitions for the media node.
//!
//! All metrics use the `sfu_` prefix and `_total` for counters.

use crate::rtc::MediaKind;
use crate::rpc_handler::{METHOD_PUBLISH, METHOD_UNPUBLISH};
use metrics::{counter, gauge};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

/// Install the Prometheus recorder.
///
/// # Errors
///
/// Returns error if a recorder is already installed.
pub fn init_metrics_recorder() -> Result<PrometheusHandle, String> {
    PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| format!("Failed to install Prometheus metrics recorder: {e}"))
}

/// Metric: `sfu_pubs_active` (+1)
pub fn pub_opened() {
    gauge!("sfu_pubs_active").increment(1.0);
}

/// Metric: `sfu_pubs_active` (-1)
pub fn pub_closed() {
    gauge!("sfu_pubs_active").decrement(1.0);
}

/// Metric: `sfu_rtp_packets_total`
/// Labels: `kind`
pub fn record_rtp_packet(kind: MediaKind) {
    counter!("sfu_rtp_packets_total", "kind" => kind.as_str()).increment(1);
}

/// Metric: `sfu_pub_closed_total`
/// Labels: `reason`
pub fn record_pub_closed(reason: &'static str) {
    counter!("sfu_pub_closed_total", "reason" => reason).increment(1);
}

/// Metric: `sfu_rpc_requests_total`
/// Labels: `method`, `status`
pub fn record_rpc_request(method: &str, ok: bool) {
    let method = match method {
        METHOD_PUBLISH => METHOD_PUBLISH,
        METHOD_UNPUBLISH => METHOD_UNPUBLISH,
        _ => "unknown",
    };
    let status = if ok { "success" } else { "error" };
    counter!("sfu_rpc_requests_total", "method" => method, "status" => status).increment(1);
}

/// Metric: `sfu_stream_remove_broadcasts_total`
pub fn record_stream_remove_broadcast() {
    counter!("sfu_stream_remove_broadcasts_total").increment(1);
}

/// Metric: `sfu_stream_remove_dropped_total`
pub fn record_stream_remove_dropped() {
    counter!("sfu_stream_remove_dropped_total").increment(1);
}
