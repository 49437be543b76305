//! Room-scoped notification fan-out.

use crate::context::BizContext;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, warn};

/// Notify every local peer of `rid` except `skip_uid`.
///
/// Delivery failures are logged per peer and do not stop the fan-out.
pub async fn notify_local(ctx: &BizContext, rid: &str, skip_uid: &str, method: &str, data: &Value) {
    for peer in ctx.rooms().room_peers(rid).await {
        if peer.id() == skip_uid {
            continue;
        }
        if let Err(e) = peer.notify(method, data.clone()).await {
            warn!(
                target: "biz.notify",
                rid = %rid,
                uid = %peer.id(),
                method = %method,
                error = %e,
                "Failed to notify peer"
            );
        }
    }
}

/// Notify every other local peer of `rid` and broadcast the same event to
/// the rest of the cluster.
pub async fn send_notify_by_uid<T: Serialize + ?Sized>(
    ctx: &BizContext,
    rid: &str,
    skip_uid: &str,
    method: &str,
    data: &T,
) {
    let data = match serde_json::to_value(data) {
        Ok(data) => data,
        Err(e) => {
            warn!(target: "biz.notify", method = %method, error = %e, "Unserializable notification dropped");
            return;
        }
    };

    debug!(target: "biz.notify", rid = %rid, skip_uid = %skip_uid, method = %method, "Sending notification");
    notify_local(ctx, rid, skip_uid, method, &data).await;
    ctx.broadcaster().say(method, &data).await;
}

/// [`send_notify_by_uid`] once per item.
pub async fn send_notifies_by_uid<T: Serialize>(
    ctx: &BizContext,
    rid: &str,
    skip_uid: &str,
    method: &str,
    items: &[T],
) {
    for item in items {
        send_notify_by_uid(ctx, rid, skip_uid, method, item).await;
    }
}
