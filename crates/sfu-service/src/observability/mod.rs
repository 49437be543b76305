//! Observability for the media node.
//!
//! # Metrics
//!
//! | Metric | Type | Labels | Purpose |
//! |--------|------|--------|---------|
//! | `sfu_pubs_active` | Gauge | none | Open publishers |
//! | `sfu_rtp_packets_total` | Counter | `kind` | Packets enqueued for forwarding |
//! | `sfu_pub_closed_total` | Counter | `reason` | Publishers removed from the registry |
//! | `sfu_rpc_requests_total` | Counter | `method`, `status` | Handled RPC requests |
//! | `sfu_stream_remove_broadcasts_total` | Counter | none | Stream-removal broadcasts sent |
//! | `sfu_stream_remove_dropped_total` | Counter | none | Removals never handed to the cleanup task |
//!
//! `kind` is `audio` or `video`; `reason` is `dead`, `unpublish` or
//! `shutdown`; unrecognised RPC methods are folded into `unknown`.

pub mod health;
pub mod metrics;

pub use health::{health_router, HealthState};
pub use metrics::init_metrics_recorder;
