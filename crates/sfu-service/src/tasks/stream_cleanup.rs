//! Announces removed streams to the signaling nodes.
//!
//! Every [`RemovedPub`] queued by the publisher registry becomes one
//! `sfu-stream-remove {rid, uid, mid}` event on this node's broadcast topic.
//! Signaling nodes consume the topic as a group, so exactly one of them
//! clears presence and notifies the room.
//!
//! Pending removals are drained before the task honours cancellation.

use crate::observability::metrics;
use common::bus::Broadcaster;
use common::protocol::{events, RemovedPub};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument};

#[instrument(skip_all, name = "sfu.task.stream_cleanup", fields(topic = %broadcaster.topic()))]
pub async fn run_stream_cleanup(
    broadcaster: Broadcaster,
    mut removed: mpsc::Receiver<RemovedPub>,
    cancel_token: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            item = removed.recv() => {
                let Some(item) = item else { break };
                info!(
                    target: "sfu.task.stream_cleanup",
                    rid = %item.rid,
                    uid = %item.uid,
                    mid = %item.mid,
                    "Announcing stream removal"
                );
                broadcaster.say(events::SFU_STREAM_REMOVE, &item).await;
                metrics::record_stream_remove_broadcast();
            }
            () = cancel_token.cancelled() => {
                info!(
                    target: "sfu.task.stream_cleanup",
                    "Stream cleanup task received shutdown signal, exiting"
                );
                break;
            }
        }
    }
}
