//! Peer departure.
//!
//! Shared by the `leave` handler, the websocket adapter and the room
//! reconciler: clear the peer's streams and presence in the presence service,
//! tell the room, then drop the local entry.

use crate::context::BizContext;
use crate::islb;
use crate::notify::{send_notifies_by_uid, send_notify_by_uid};
use crate::observability::metrics;
use crate::session::Peer;
use common::protocol::events;
use std::sync::Arc;
use tracing::{info, warn};

/// Remove `uid` from `rid` everywhere.
///
/// Presence-service failures are logged; the local entry is removed
/// regardless. The room itself is left for the caller to prune.
pub async fn purge_peer(ctx: &BizContext, rid: &str, uid: &str) {
    release_presence(ctx, rid, uid).await;

    if ctx.rooms().remove_peer(rid, uid).await.is_some() {
        metrics::set_peers_active(ctx.rooms().peer_count().await);
        info!(target: "biz.cleanup", rid = %rid, uid = %uid, "Peer removed");
    }
}

/// Drop a closed connection from every room it is still registered in,
/// pruning rooms it leaves empty. Returns the number of rooms left.
///
/// Rooms where a newer connection has replaced `peer` under the same id are
/// not touched.
pub async fn disconnect_peer(ctx: &BizContext, peer: &Arc<Peer>) -> usize {
    let mut left = 0;
    for rid in ctx.rooms().rooms_of(peer).await {
        // Local removal first, so a concurrent rejoin is never torn down
        if !ctx.rooms().remove_peer_if_current(&rid, peer).await {
            continue;
        }
        left += 1;
        metrics::set_peers_active(ctx.rooms().peer_count().await);

        release_presence(ctx, &rid, peer.id()).await;
        ctx.rooms().delete_room_if_empty(&rid).await;
        info!(target: "biz.cleanup", rid = %rid, uid = %peer.id(), "Disconnected peer removed");
    }
    if left > 0 {
        metrics::set_rooms_active(ctx.rooms().room_count().await);
    }
    left
}

async fn release_presence(ctx: &BizContext, rid: &str, uid: &str) {
    match islb::stream_remove(ctx, rid, uid, "").await {
        Ok(removed) => {
            send_notifies_by_uid(ctx, rid, uid, events::STREAM_REMOVE, &removed).await;
        }
        Err(e) => {
            warn!(target: "biz.cleanup", rid = %rid, uid = %uid, error = %e, "streamRemove failed");
        }
    }

    match islb::client_leave(ctx, rid, uid).await {
        Ok(left) => {
            send_notify_by_uid(ctx, rid, uid, events::PEER_LEAVE, &left).await;
        }
        Err(e) => {
            warn!(target: "biz.cleanup", rid = %rid, uid = %uid, error = %e, "clientLeave failed");
        }
    }
}
