//! Typed calls to the presence service (and other nodes).

use crate::context::BizContext;
use crate::errors::BizError;
use crate::observability::metrics;
use common::bus::Requestor;
use common::protocol::{
    BizInfo, ClientJoin, ClientJoinRequest, ClientLeave, GetBizInfo, GetRoomPubs, GetRoomUsers,
    GetSfuInfo, RemovedPub, RoomPub, RoomPubs, RoomUserRef, RoomUsers, RpcMethod, SfuInfo,
    SfuInfoRequest, StreamAdd, StreamRemove, StreamRemoveRequest,
};
use tracing::warn;

/// Call `M` on `requestor`, mapping failures to [`BizError::Rpc`].
pub async fn call<M: RpcMethod>(
    requestor: &Requestor,
    request: &M::Request,
) -> Result<M::Response, BizError> {
    requestor
        .sync_request::<M>(request)
        .await
        .map_err(|source| {
            metrics::record_rpc_failure(M::NAME);
            warn!(
                target: "biz.islb",
                method = M::NAME,
                channel = %requestor.channel(),
                code = source.code,
                reason = %source.reason,
                "RPC failed"
            );
            BizError::Rpc {
                method: M::NAME,
                source,
            }
        })
}

async fn call_islb<M: RpcMethod>(
    ctx: &BizContext,
    request: &M::Request,
) -> Result<M::Response, BizError> {
    let islb = ctx.islb().await?;
    call::<M>(&islb, request).await
}

fn user_ref(rid: &str, uid: &str) -> RoomUserRef {
    RoomUserRef {
        rid: rid.to_string(),
        uid: uid.to_string(),
    }
}

/// Which signaling node hosts `uid` in `rid`.
pub async fn get_biz_info(ctx: &BizContext, rid: &str, uid: &str) -> Result<BizInfo, BizError> {
    call_islb::<GetBizInfo>(ctx, &user_ref(rid, uid)).await
}

/// Which media node carries stream `mid`.
pub async fn get_sfu_info(ctx: &BizContext, rid: &str, mid: &str) -> Result<SfuInfo, BizError> {
    let request = SfuInfoRequest {
        rid: rid.to_string(),
        mid: mid.to_string(),
    };
    call_islb::<GetSfuInfo>(ctx, &request).await
}

pub async fn get_room_users(ctx: &BizContext, rid: &str, uid: &str) -> Result<RoomUsers, BizError> {
    call_islb::<GetRoomUsers>(ctx, &user_ref(rid, uid)).await
}

pub async fn get_room_pubs(ctx: &BizContext, rid: &str, uid: &str) -> Result<RoomPubs, BizError> {
    call_islb::<GetRoomPubs>(ctx, &user_ref(rid, uid)).await
}

/// Remove stream `mid` of `uid` (every stream of `uid` when `mid` is empty).
pub async fn stream_remove(
    ctx: &BizContext,
    rid: &str,
    uid: &str,
    mid: &str,
) -> Result<Vec<RemovedPub>, BizError> {
    let request = StreamRemoveRequest {
        rid: rid.to_string(),
        uid: uid.to_string(),
        mid: mid.to_string(),
    };
    Ok(call_islb::<StreamRemove>(ctx, &request).await?.rm_pubs)
}

pub async fn client_leave(ctx: &BizContext, rid: &str, uid: &str) -> Result<RoomUserRef, BizError> {
    call_islb::<ClientLeave>(ctx, &user_ref(rid, uid)).await
}

pub async fn client_join(
    ctx: &BizContext,
    rid: &str,
    uid: &str,
    info: serde_json::Value,
) -> Result<(), BizError> {
    let request = ClientJoinRequest {
        rid: rid.to_string(),
        uid: uid.to_string(),
        bizid: ctx.node_id().to_string(),
        info,
    };
    call_islb::<ClientJoin>(ctx, &request).await.map(|_| ())
}

pub async fn stream_add(ctx: &BizContext, stream: &RoomPub) -> Result<(), BizError> {
    call_islb::<StreamAdd>(ctx, stream).await.map(|_| ())
}
