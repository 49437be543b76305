//! Room reconciliation background task.
//!
//! Periodically compares local room membership with the presence service.
//! For each local peer the presence service is asked which signaling node
//! hosts it; when that node is neither this one nor a live peer node, the
//! peer is purged:
//!
//! 1. `streamRemove` for all of its streams, with a `stream-remove`
//!    notification per removed stream
//! 2. `clientLeave`, with a `peer-leave` notification
//! 3. the local entry is dropped
//!
//! Rooms left empty are deleted. A peer whose presence lookup fails is left
//! alone until the next pass.
//!
//! # Graceful Shutdown
//!
//! The task exits when its cancellation token fires; a pass in progress runs
//! to completion first.

use crate::cleanup::purge_peer;
use crate::context::BizContext;
use crate::islb;
use crate::observability::metrics;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Start the room reconciler.
///
/// Runs [`check_rooms_once`] every `interval` until `cancel_token` fires.
#[instrument(skip_all, name = "biz.task.room_reconciler")]
pub async fn start_room_reconciler(
    ctx: Arc<BizContext>,
    interval: Duration,
    cancel_token: CancellationToken,
) {
    info!(
        target: "biz.task.room_reconciler",
        interval_seconds = interval.as_secs(),
        "Starting room reconciler task"
    );

    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // Nothing to reconcile at startup
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                check_rooms_once(&ctx).await;
            }
            () = cancel_token.cancelled() => {
                info!(
                    target: "biz.task.room_reconciler",
                    "Room reconciler task received shutdown signal, exiting"
                );
                break;
            }
        }
    }

    info!(target: "biz.task.room_reconciler", "Room reconciler task stopped");
}

/// Run one reconciliation pass. Returns the number of peers evicted.
pub async fn check_rooms_once(ctx: &BizContext) -> usize {
    let start = Instant::now();
    let mut evicted = 0;

    for (rid, peers) in ctx.rooms().snapshot().await {
        for peer in peers {
            let uid = peer.id();
            let bizid = match islb::get_biz_info(ctx, &rid, uid).await {
                Ok(info) => info.bizid,
                Err(e) => {
                    warn!(
                        target: "biz.task.room_reconciler",
                        rid = %rid,
                        uid = %uid,
                        error = %e,
                        "Presence lookup failed, skipping peer"
                    );
                    continue;
                }
            };

            if ctx.is_biz_alive(&bizid).await {
                continue;
            }

            info!(
                target: "biz.task.room_reconciler",
                rid = %rid,
                uid = %uid,
                bizid = %bizid,
                "Evicting peer whose signaling node is gone"
            );
            purge_peer(ctx, &rid, uid).await;
            metrics::record_peer_evicted();
            evicted += 1;
        }

        if ctx.rooms().delete_room_if_empty(&rid).await {
            debug!(target: "biz.task.room_reconciler", rid = %rid, "Empty room deleted");
        }
    }

    metrics::set_rooms_active(ctx.rooms().room_count().await);
    metrics::set_peers_active(ctx.rooms().peer_count().await);
    metrics::record_check_rooms_duration(start.elapsed());

    if evicted > 0 {
        warn!(target: "biz.task.room_reconciler", evicted = evicted, "Evicted stale peers");
    }
    evicted
}
