//! Observability for the signaling node.
//!
//! # Metrics
//!
//! | Metric | Type | Labels | Purpose |
//! |--------|------|--------|---------|
//! | `biz_rooms_active` | Gauge | none | Rooms with at least one local peer |
//! | `biz_peers_active` | Gauge | none | Local peers across all rooms |
//! | `biz_peers_evicted_total` | Counter | none | Peers removed by the room reconciler |
//! | `biz_rpc_failures_total` | Counter | `method` | Failed calls to other nodes |
//! | `biz_signal_requests_total` | Counter | `method`, `status` | Client signaling requests |
//! | `biz_check_rooms_duration_seconds` | Histogram | none | Room reconciliation pass time |
//!
//! Labels are bounded: `method` is one of the known RPC or signaling method
//! names, with unrecognised client methods folded into `unknown`.

pub mod health;
pub mod metrics;

pub use health::{health_router, HealthState};
pub use metrics::init_metrics_recorder;
