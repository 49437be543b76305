//! Signaling method handlers.

use crate::cleanup::purge_peer;
use crate::context::BizContext;
use crate::errors::BizError;
use crate::islb;
use crate::notify::{send_notifies_by_uid, send_notify_by_uid};
use crate::observability::metrics;
use crate::session::Peer;
use common::error::ClusterError;
use common::protocol::{
    events, PeerJoinNotice, Publish, PublishRequest, RoomPub, SessionDescription, Unpublish,
    UnpublishRequest,
};
use common::types::SERVICE_SFU;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::sync::Arc;
use tracing::{info, instrument, warn};

pub const METHOD_JOIN: &str = "join";
pub const METHOD_LEAVE: &str = "leave";
pub const METHOD_PUBLISH: &str = "publish";
pub const METHOD_UNPUBLISH: &str = "unpublish";

#[derive(Debug, Deserialize)]
struct JoinParams {
    rid: String,
    #[serde(default)]
    info: Value,
}

#[derive(Debug, Deserialize)]
struct LeaveParams {
    rid: String,
}

#[derive(Debug, Deserialize)]
struct PublishParams {
    rid: String,
    jsep: SessionDescription,
    #[serde(default)]
    minfo: Value,
}

#[derive(Debug, Deserialize)]
struct UnpublishParams {
    rid: String,
    mid: String,
}

fn parse<T: DeserializeOwned>(data: Map<String, Value>) -> Result<T, BizError> {
    serde_json::from_value(Value::Object(data)).map_err(|e| BizError::InvalidData(e.to_string()))
}

fn require(field: &str, value: &str) -> Result<(), BizError> {
    if value.is_empty() {
        return Err(BizError::InvalidData(format!("{field} is empty")));
    }
    Ok(())
}

async fn require_member(ctx: &BizContext, rid: &str, uid: &str) -> Result<(), BizError> {
    if ctx.rooms().get_peer(rid, uid).await.is_none() {
        return Err(BizError::NotInRoom(rid.to_string()));
    }
    Ok(())
}

/// `join {rid, info?}` -> `{users, pubs}`.
#[instrument(skip_all, name = "biz.signaling.join", fields(uid = %peer.id()))]
pub async fn join(
    ctx: &BizContext,
    peer: &Arc<Peer>,
    data: Map<String, Value>,
) -> Result<Value, BizError> {
    let params: JoinParams = parse(data)?;
    require("rid", &params.rid)?;
    let uid = peer.id();

    islb::client_join(ctx, &params.rid, uid, params.info.clone()).await?;

    if let Some(previous) = ctx.rooms().add_peer(&params.rid, Arc::clone(peer)).await {
        if !Arc::ptr_eq(&previous, peer) {
            info!(target: "biz.signaling", rid = %params.rid, uid = %uid, "Peer rejoined, replacing old connection");
            previous.close().await;
        }
    }
    metrics::set_rooms_active(ctx.rooms().room_count().await);
    metrics::set_peers_active(ctx.rooms().peer_count().await);

    let users = match islb::get_room_users(ctx, &params.rid, uid).await {
        Ok(resp) => resp.users,
        Err(e) => {
            warn!(target: "biz.signaling", rid = %params.rid, error = %e, "getRoomUsers failed, returning no users");
            Vec::new()
        }
    };
    let pubs = match islb::get_room_pubs(ctx, &params.rid, uid).await {
        Ok(resp) => resp.pubs,
        Err(e) => {
            warn!(target: "biz.signaling", rid = %params.rid, error = %e, "getRoomPubs failed, returning no pubs");
            Vec::new()
        }
    };

    let notice = PeerJoinNotice {
        rid: params.rid.clone(),
        uid: uid.to_string(),
        info: params.info,
    };
    send_notify_by_uid(ctx, &params.rid, uid, events::PEER_JOIN, &notice).await;

    info!(target: "biz.signaling", rid = %params.rid, uid = %uid, "Peer joined");
    Ok(json!({"users": users, "pubs": pubs}))
}

/// `leave {rid}` -> `{}`.
#[instrument(skip_all, name = "biz.signaling.leave", fields(uid = %peer.id()))]
pub async fn leave(
    ctx: &BizContext,
    peer: &Arc<Peer>,
    data: Map<String, Value>,
) -> Result<Value, BizError> {
    let params: LeaveParams = parse(data)?;
    require("rid", &params.rid)?;

    purge_peer(ctx, &params.rid, peer.id()).await;
    ctx.rooms().delete_room_if_empty(&params.rid).await;
    metrics::set_rooms_active(ctx.rooms().room_count().await);

    Ok(json!({}))
}

/// `publish {rid, jsep, minfo?}` -> `{mid, sfuid, jsep}`.
#[instrument(skip_all, name = "biz.signaling.publish", fields(uid = %peer.id()))]
pub async fn publish(
    ctx: &BizContext,
    peer: &Arc<Peer>,
    data: Map<String, Value>,
) -> Result<Value, BizError> {
    let params: PublishParams = parse(data)?;
    require("rid", &params.rid)?;
    let uid = peer.id();
    require_member(ctx, &params.rid, uid).await?;

    let (sfu, sfu_node) = ctx
        .coordinator()
        .requestor_by_least_load(SERVICE_SFU)
        .await
        .map_err(|e| match e {
            ClusterError::HandlerUnavailable(reason) => BizError::SfuUnavailable(reason),
            other => BizError::Cluster(other),
        })?;

    let request = PublishRequest {
        rid: params.rid.clone(),
        uid: uid.to_string(),
        jsep: params.jsep,
    };
    let answer = islb::call::<Publish>(&sfu, &request).await?;

    let stream = RoomPub {
        rid: params.rid.clone(),
        uid: uid.to_string(),
        mid: answer.mid.clone(),
        sfuid: sfu_node.id.clone(),
        minfo: params.minfo,
    };
    if let Err(e) = islb::stream_add(ctx, &stream).await {
        // Without a presence record nobody can find the stream; release it
        let rollback = UnpublishRequest {
            rid: params.rid.clone(),
            uid: uid.to_string(),
            mid: answer.mid.clone(),
        };
        if let Err(rollback_err) = islb::call::<Unpublish>(&sfu, &rollback).await {
            warn!(
                target: "biz.signaling",
                mid = %answer.mid,
                sfuid = %sfu_node.id,
                error = %rollback_err,
                "Unpublish after failed streamAdd failed"
            );
        }
        return Err(e);
    }
    send_notify_by_uid(ctx, &params.rid, uid, events::STREAM_ADD, &stream).await;

    info!(
        target: "biz.signaling",
        rid = %params.rid,
        uid = %uid,
        mid = %answer.mid,
        sfuid = %sfu_node.id,
        "Stream published"
    );
    Ok(json!({"mid": answer.mid, "sfuid": sfu_node.id, "jsep": answer.jsep}))
}

/// `unpublish {rid, mid}` -> `{}`.
#[instrument(skip_all, name = "biz.signaling.unpublish", fields(uid = %peer.id()))]
pub async fn unpublish(
    ctx: &BizContext,
    peer: &Arc<Peer>,
    data: Map<String, Value>,
) -> Result<Value, BizError> {
    let params: UnpublishParams = parse(data)?;
    require("rid", &params.rid)?;
    require("mid", &params.mid)?;
    let uid = peer.id();
    require_member(ctx, &params.rid, uid).await?;

    let sfuid = islb::get_sfu_info(ctx, &params.rid, &params.mid).await?.sfuid;
    if sfuid.is_empty() {
        return Err(BizError::StreamNotFound(params.mid));
    }

    match ctx.coordinator().requestor_by_node_id(&sfuid).await {
        Ok(sfu) => {
            let request = UnpublishRequest {
                rid: params.rid.clone(),
                uid: uid.to_string(),
                mid: params.mid.clone(),
            };
            islb::call::<Unpublish>(&sfu, &request).await?;
        }
        // A departed media node took the stream with it
        Err(ClusterError::HandlerUnavailable(reason)) => {
            info!(
                target: "biz.signaling",
                mid = %params.mid,
                sfuid = %sfuid,
                reason = %reason,
                "Media node gone, clearing stream record only"
            );
        }
        Err(other) => return Err(BizError::Cluster(other)),
    }

    let removed = islb::stream_remove(ctx, &params.rid, uid, &params.mid).await?;
    send_notifies_by_uid(ctx, &params.rid, uid, events::STREAM_REMOVE, &removed).await;

    info!(target: "biz.signaling", rid = %params.rid, uid = %uid, mid = %params.mid, "Stream unpublished");
    Ok(json!({}))
}
