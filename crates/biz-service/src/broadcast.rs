//! Consumer for broadcasts received from other nodes.
//!
//! Two kinds of traffic arrive here:
//!
//! - events from other signaling nodes, relayed verbatim to the local peers
//!   of the room named by `data.rid` (skipping `data.uid`);
//! - `sfu-stream-remove` from a media node that tore down a publisher on its
//!   own, which is turned into a presence-service `streamRemove` and a
//!   `stream-remove` notification for the room.

use crate::context::BizContext;
use crate::islb;
use crate::notify::{notify_local, send_notifies_by_uid};
use common::bus::BroadcastEvent;
use common::coordinator::InboundBroadcast;
use common::protocol::{events, RemovedPub};
use common::types::{SERVICE_BIZ, SERVICE_SFU};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Consume inbound broadcasts until `cancel_token` fires or the channel
/// closes.
#[instrument(skip_all, name = "biz.broadcast.consumer")]
pub async fn run_broadcast_consumer(
    ctx: Arc<BizContext>,
    mut inbound: mpsc::Receiver<InboundBroadcast>,
    cancel_token: CancellationToken,
) {
    info!(target: "biz.broadcast", "Starting broadcast consumer");

    loop {
        tokio::select! {
            msg = inbound.recv() => {
                let Some(msg) = msg else {
                    info!(target: "biz.broadcast", "Inbound channel closed, exiting");
                    break;
                };
                handle_broadcast(&ctx, msg).await;
            }
            () = cancel_token.cancelled() => {
                info!(target: "biz.broadcast", "Broadcast consumer received shutdown signal, exiting");
                break;
            }
        }
    }
}

/// Handle one inbound broadcast.
pub async fn handle_broadcast(ctx: &BizContext, msg: InboundBroadcast) {
    let InboundBroadcast { from, event } = msg;
    debug!(
        target: "biz.broadcast",
        from = %from,
        method = %event.method,
        "Broadcast received"
    );

    match from.name.as_str() {
        SERVICE_SFU => handle_sfu_event(ctx, &event).await,
        SERVICE_BIZ => relay_biz_event(ctx, &event).await,
        other => {
            debug!(target: "biz.broadcast", service = %other, "Ignoring broadcast from unexpected service");
        }
    }
}

async fn handle_sfu_event(ctx: &BizContext, event: &BroadcastEvent) {
    if event.method != events::SFU_STREAM_REMOVE {
        debug!(target: "biz.broadcast", method = %event.method, "Ignoring media node event");
        return;
    }

    let stream: RemovedPub = match event.parse() {
        Ok(stream) => stream,
        Err(e) => {
            warn!(target: "biz.broadcast", error = %e, "Malformed sfu-stream-remove dropped");
            return;
        }
    };

    match islb::stream_remove(ctx, &stream.rid, &stream.uid, &stream.mid).await {
        Ok(removed) => {
            send_notifies_by_uid(ctx, &stream.rid, &stream.uid, events::STREAM_REMOVE, &removed)
                .await;
            info!(
                target: "biz.broadcast",
                rid = %stream.rid,
                uid = %stream.uid,
                mid = %stream.mid,
                removed = removed.len(),
                "Media node stream removal applied"
            );
        }
        Err(e) => {
            warn!(
                target: "biz.broadcast",
                rid = %stream.rid,
                mid = %stream.mid,
                error = %e,
                "streamRemove for media node event failed"
            );
        }
    }
}

async fn relay_biz_event(ctx: &BizContext, event: &BroadcastEvent) {
    let field = |name: &str| {
        event
            .data
            .get(name)
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string()
    };
    let rid = field("rid");
    if rid.is_empty() {
        debug!(target: "biz.broadcast", method = %event.method, "Broadcast without rid dropped");
        return;
    }
    let uid = field("uid");

    notify_local(ctx, &rid, &uid, &event.method, &event.data).await;
}
