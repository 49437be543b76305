//! Request handling on the media node's RPC channel.
//!
//! | Method | Request | Response |
//! |--------|---------|----------|
//! | `publish` | `{rid, uid, jsep}` | `{mid, jsep}` |
//! | `unpublish` | `{rid, uid, mid}` | `{}` |
//!
//! Each request is handled on its own task so a slow negotiation never holds
//! up the channel.

use crate::context::SfuContext;
use crate::errors::SfuError;
use crate::observability::metrics;
use crate::rtc::{Pub, PubEntry, RemoveReason};
use common::bus::{IncomingRequest, MessageBus, RpcError, CODE_BAD_REQUEST};
use common::error::ClusterError;
use common::protocol::{
    Empty, Publish, PublishRequest, PublishResponse, RpcMethod, Unpublish, UnpublishRequest,
};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

pub const METHOD_PUBLISH: &str = Publish::NAME;
pub const METHOD_UNPUBLISH: &str = Unpublish::NAME;

/// Start serving the node's RPC channel.
///
/// # Errors
///
/// Returns error if the bus refuses to serve the channel.
pub async fn serve_rpc(
    ctx: Arc<SfuContext>,
    bus: &dyn MessageBus,
    cancel_token: CancellationToken,
) -> Result<tokio::task::JoinHandle<()>, ClusterError> {
    let channel = ctx.node().rpc_channel();
    let requests = bus.serve(&channel).await?;
    info!(target: "sfu.rpc", channel = %channel, "Serving RPC channel");
    Ok(tokio::spawn(run_rpc_loop(ctx, requests, cancel_token)))
}

async fn run_rpc_loop(
    ctx: Arc<SfuContext>,
    mut requests: mpsc::Receiver<IncomingRequest>,
    cancel_token: CancellationToken,
) {
    loop {
        tokio::select! {
            () = cancel_token.cancelled() => {
                info!(target: "sfu.rpc", "RPC server received shutdown signal, exiting");
                break;
            }
            request = requests.recv() => {
                let Some(request) = request else {
                    warn!(target: "sfu.rpc", "RPC channel closed");
                    break;
                };
                let ctx = Arc::clone(&ctx);
                tokio::spawn(async move {
                    handle_request(&ctx, request).await;
                });
            }
        }
    }
}

/// Handle one request and send its response.
pub async fn handle_request(ctx: &SfuContext, request: IncomingRequest) {
    let method = request.method.clone();
    let result = dispatch(ctx, &method, &request.data).await;
    metrics::record_rpc_request(&method, result.is_ok());
    if let Err(e) = &result {
        debug!(target: "sfu.rpc", method = %method, code = e.code, reason = %e.reason, "Request rejected");
    }
    request.respond(result);
}

async fn dispatch(ctx: &SfuContext, method: &str, data: &Value) -> Result<Value, RpcError> {
    let value = match method {
        METHOD_PUBLISH => serde_json::to_value(publish(ctx, parse(method, data)?).await?),
        METHOD_UNPUBLISH => serde_json::to_value(unpublish(ctx, parse(method, data)?).await?),
        _ => {
            return Err(RpcError::new(
                CODE_BAD_REQUEST,
                format!("unknown method: {method}"),
            ))
        }
    };
    value.map_err(|e| RpcError::internal(format!("response serialization failed: {e}")))
}

fn parse<T: serde::de::DeserializeOwned>(method: &str, data: &Value) -> Result<T, SfuError> {
    serde_json::from_value(data.clone())
        .map_err(|e| SfuError::InvalidRequest(format!("{method}: {e}")))
}

/// Create a publisher for the offer and return its stream id and answer.
#[instrument(skip_all, name = "sfu.rpc.publish", fields(rid = %req.rid, uid = %req.uid))]
pub async fn publish(ctx: &SfuContext, req: PublishRequest) -> Result<PublishResponse, SfuError> {
    if req.rid.is_empty() || req.uid.is_empty() {
        return Err(SfuError::InvalidRequest("rid and uid are required".to_string()));
    }

    let mid = Uuid::new_v4().to_string();
    let publisher = Pub::new(&mid, ctx.factory(), ctx.queue_capacity()).await?;

    let answer = match publisher.answer(req.jsep).await {
        Ok(answer) => answer,
        Err(e) => {
            warn!(target: "sfu.rpc", mid = %mid, error = %e, "Negotiation failed, releasing publisher");
            publisher.close().await;
            return Err(e);
        }
    };

    ctx.registry()
        .insert(PubEntry {
            rid: req.rid,
            uid: req.uid,
            mid: mid.clone(),
            publisher,
        })
        .await;
    info!(target: "sfu.rpc", mid = %mid, load = ctx.registry().len(), "Publisher accepted");

    Ok(PublishResponse { mid, jsep: answer })
}

/// Tear down a publisher. Unknown stream ids are accepted.
#[instrument(skip_all, name = "sfu.rpc.unpublish", fields(mid = %req.mid))]
pub async fn unpublish(ctx: &SfuContext, req: UnpublishRequest) -> Result<Empty, SfuError> {
    if req.mid.is_empty() {
        return Err(SfuError::InvalidRequest("mid is required".to_string()));
    }

    match ctx.registry().remove(&req.mid, RemoveReason::Unpublish).await {
        Some(_) => info!(target: "sfu.rpc", mid = %req.mid, "Publisher removed on request"),
        None => debug!(target: "sfu.rpc", mid = %req.mid, "Unpublish for unknown stream"),
    }
    Ok(Empty {})
}
