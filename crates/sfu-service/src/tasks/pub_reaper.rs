//! Dead publisher sweep.
//!
//! Publishers go not-alive when their connection drops or a track ends. The
//! reaper closes and removes them every `interval`, which lowers the node's
//! reported load and queues a stream-removal announcement for each.

use crate::rtc::PubRegistry;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

#[instrument(skip_all, name = "sfu.task.pub_reaper")]
pub async fn start_pub_reaper(
    registry: Arc<PubRegistry>,
    interval: Duration,
    cancel_token: CancellationToken,
) {
    info!(
        target: "sfu.task.pub_reaper",
        interval_seconds = interval.as_secs(),
        "Starting publisher reaper task"
    );

    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let reaped = registry.reap_once().await;
                debug!(target: "sfu.task.pub_reaper", reaped, load = registry.len(), "Reap pass complete");
            }
            () = cancel_token.cancelled() => {
                info!(
                    target: "sfu.task.pub_reaper",
                    "Publisher reaper task received shutdown signal, exiting"
                );
                break;
            }
        }
    }
}
