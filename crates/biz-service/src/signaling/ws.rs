//! Websocket adapter for client signaling.
//!
//! `GET /ws?peer=<uid>` upgrades to a websocket. Each connection gets a
//! writer task draining an outbound queue and a reader loop that feeds text
//! frames to [`handle_frame`](super::handle_frame). When the client goes
//! away the connection leaves every room it joined, through
//! [`disconnect_peer`]. Connections closed by node shutdown skip that step;
//! other nodes reconcile them once this node's record is gone.

use super::{handle_frame, notification_frame};
use crate::cleanup::disconnect_peer;
use crate::context::BizContext;
use crate::errors::BizError;
use crate::session::{Peer, PeerTransport};
use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

/// Outbound frames buffered per connection.
const OUTBOUND_BUFFER: usize = 64;

#[derive(Clone)]
struct SignalState {
    ctx: Arc<BizContext>,
    cancel_token: CancellationToken,
}

#[derive(Debug, Deserialize)]
struct ConnectParams {
    #[serde(default)]
    peer: Option<String>,
}

/// Signaling router serving `/ws`.
///
/// Open connections close when `cancel_token` fires.
pub fn signal_router(ctx: Arc<BizContext>, cancel_token: CancellationToken) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(SignalState { ctx, cancel_token })
}

async fn ws_handler(
    State(state): State<SignalState>,
    Query(params): Query<ConnectParams>,
    upgrade: WebSocketUpgrade,
) -> Response {
    let Some(uid) = params.peer.filter(|p| !p.is_empty()) else {
        debug!(target: "biz.ws", "Rejecting connection without peer id");
        return (StatusCode::BAD_REQUEST, "missing peer").into_response();
    };

    upgrade.on_upgrade(move |socket| run_connection(state.ctx, socket, uid, state.cancel_token))
}

/// [`PeerTransport`] over a websocket writer queue.
pub struct WsTransport {
    outbound: mpsc::Sender<Message>,
    closed: CancellationToken,
}

impl WsTransport {
    fn new(outbound: mpsc::Sender<Message>, closed: CancellationToken) -> Self {
        Self { outbound, closed }
    }
}

#[async_trait]
impl PeerTransport for WsTransport {
    async fn notify(&self, method: &str, data: Value) -> Result<(), BizError> {
        if self.closed.is_cancelled() {
            return Err(BizError::Internal("connection closed".to_string()));
        }
        let frame = notification_frame(method, data).to_string();
        self.outbound
            .send(Message::Text(frame))
            .await
            .map_err(|_| BizError::Internal("connection closed".to_string()))
    }

    async fn close(&self) {
        self.closed.cancel();
    }
}

async fn run_connection(
    ctx: Arc<BizContext>,
    socket: WebSocket,
    uid: String,
    cancel_token: CancellationToken,
) {
    info!(target: "biz.ws", uid = %uid, "Peer connected");

    let (mut sink, mut stream) = socket.split();
    let (outbound_tx, mut outbound_rx) = mpsc::channel::<Message>(OUTBOUND_BUFFER);
    let closed = cancel_token.child_token();

    let transport = Arc::new(WsTransport::new(outbound_tx.clone(), closed.clone()));
    let peer = Arc::new(Peer::new(uid.clone(), transport));

    let writer = {
        let closed = closed.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    msg = outbound_rx.recv() => {
                        let Some(msg) = msg else { break };
                        if sink.send(msg).await.is_err() {
                            break;
                        }
                    }
                    () = closed.cancelled() => {
                        if let Err(e) = sink.send(Message::Close(None)).await {
                            debug!(target: "biz.ws", error = %e, "Close frame not sent");
                        }
                        break;
                    }
                }
            }
            closed.cancel();
        })
    };

    loop {
        tokio::select! {
            msg = stream.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        if let Some(response) = handle_frame(&ctx, &peer, &text).await {
                            if outbound_tx.send(Message::Text(response.to_string())).await.is_err() {
                                break;
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!(target: "biz.ws", uid = %uid, error = %e, "Websocket read failed");
                        break;
                    }
                }
            }
            () = closed.cancelled() => break,
        }
    }

    closed.cancel();
    if let Err(e) = writer.await {
        warn!(target: "biz.ws", uid = %uid, error = %e, "Writer task failed");
    }

    let rooms_left = if cancel_token.is_cancelled() {
        0
    } else {
        disconnect_peer(&ctx, &peer).await
    };
    info!(target: "biz.ws", uid = %uid, rooms_left, "Peer disconnected");
}
