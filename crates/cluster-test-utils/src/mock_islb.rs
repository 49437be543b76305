//! Mock presence service (`islb`).
//!
//! Serves the presence RPC methods on the bus, backed by in-memory maps, and
//! registers itself in the store so discovery finds it like a real node.
//! Every call is recorded; individual methods can be made to fail.
//!
//! # Example
//!
//! ```rust,ignore
//! let islb = MockIslb::builder()
//!     .with_user("room-1", "bob", "biz-gone")
//!     .failing("getRoomPubs")
//!     .start(&cluster.substrate)
//!     .await;
//!
//! // ... exercise the signaling node ...
//! assert_eq!(islb.calls_named("clientLeave").len(), 1);
//! ```

use common::bus::{IncomingRequest, RpcError, CODE_BAD_REQUEST, CODE_INTERNAL};
use common::protocol::{
    BizInfo, ClientJoin, ClientJoinRequest, ClientLeave, Empty, GetBizInfo, GetRoomPubs,
    GetRoomUsers, GetSfuInfo, RemovedPub, RoomPub, RoomPubs, RoomUser, RoomUserRef, RoomUsers,
    RpcMethod, SfuInfo, SfuInfoRequest, StreamAdd, StreamRemove, StreamRemoveRequest,
    StreamRemoveResponse,
};
use common::substrate::Substrate;
use common::types::{ServiceNode, SERVICE_ISLB};
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Default node id of the mock.
pub const MOCK_ISLB_ID: &str = "islb-mock";

const REGISTRATION_TTL: Duration = Duration::from_secs(3600);

#[derive(Debug, Default)]
struct State {
    /// `(rid, uid)` → `bizid`
    users: BTreeMap<(String, String), String>,
    pubs: Vec<RoomPub>,
    failing: HashSet<String>,
    calls: Vec<(String, Value)>,
}

/// Handle to a running mock presence service.
#[derive(Debug, Clone)]
pub struct MockIslb {
    node: ServiceNode,
    state: Arc<Mutex<State>>,
    cancel: CancellationToken,
}

/// Builder for [`MockIslb`].
#[derive(Debug)]
pub struct MockIslbBuilder {
    node: ServiceNode,
    state: State,
}

impl MockIslb {
    pub fn builder() -> MockIslbBuilder {
        MockIslbBuilder {
            node: ServiceNode::new(MOCK_ISLB_ID, "dc1", SERVICE_ISLB),
            state: State::default(),
        }
    }

    pub fn node(&self) -> &ServiceNode {
        &self.node
    }

    /// Every call received, oldest first.
    pub fn calls(&self) -> Vec<(String, Value)> {
        self.state.lock().unwrap().calls.clone()
    }

    /// Payloads of the calls to `method`.
    pub fn calls_named(&self, method: &str) -> Vec<Value> {
        self.calls()
            .into_iter()
            .filter(|(m, _)| m == method)
            .map(|(_, data)| data)
            .collect()
    }

    /// Record (or move) a user.
    pub fn set_user(&self, rid: &str, uid: &str, bizid: &str) {
        self.state
            .lock()
            .unwrap()
            .users
            .insert((rid.to_string(), uid.to_string()), bizid.to_string());
    }

    pub fn bizid_of(&self, rid: &str, uid: &str) -> Option<String> {
        self.state
            .lock()
            .unwrap()
            .users
            .get(&(rid.to_string(), uid.to_string()))
            .cloned()
    }

    pub fn add_pub(&self, stream: RoomPub) {
        self.state.lock().unwrap().pubs.push(stream);
    }

    pub fn pubs(&self) -> Vec<RoomPub> {
        self.state.lock().unwrap().pubs.clone()
    }

    /// Make `method` fail with a 500 until [`MockIslb::recover`].
    pub fn fail(&self, method: &str) {
        self.state.lock().unwrap().failing.insert(method.to_string());
    }

    pub fn recover(&self, method: &str) {
        self.state.lock().unwrap().failing.remove(method);
    }

    /// Stop serving and remove the registration.
    pub async fn stop(&self, substrate: &Substrate) {
        self.cancel.cancel();
        substrate
            .store
            .delete(&self.node.dc, &self.node.id)
            .await
            .unwrap();
    }
}

impl MockIslbBuilder {
    #[must_use]
    pub fn with_node_id(mut self, id: &str) -> Self {
        self.node = ServiceNode::new(id, self.node.dc.clone(), SERVICE_ISLB);
        self
    }

    #[must_use]
    pub fn with_user(mut self, rid: &str, uid: &str, bizid: &str) -> Self {
        self.state
            .users
            .insert((rid.to_string(), uid.to_string()), bizid.to_string());
        self
    }

    #[must_use]
    pub fn with_pub(mut self, stream: RoomPub) -> Self {
        self.state.pubs.push(stream);
        self
    }

    #[must_use]
    pub fn failing(mut self, method: &str) -> Self {
        self.state.failing.insert(method.to_string());
        self
    }

    /// Register the mock in the store and start serving its RPC channel.
    pub async fn start(self, substrate: &Substrate) -> MockIslb {
        substrate
            .store
            .put(&self.node, REGISTRATION_TTL)
            .await
            .expect("mock islb registration failed");
        let mut requests = substrate
            .bus
            .serve(&self.node.rpc_channel())
            .await
            .expect("mock islb failed to serve its channel");

        let islb = MockIslb {
            node: self.node,
            state: Arc::new(Mutex::new(self.state)),
            cancel: CancellationToken::new(),
        };

        let state = Arc::clone(&islb.state);
        let cancel = islb.cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    request = requests.recv() => {
                        let Some(request) = request else { break };
                        handle(&state, request);
                    }
                }
            }
        });

        islb
    }
}

fn handle(state: &Mutex<State>, request: IncomingRequest) {
    let mut state = state.lock().unwrap();
    state
        .calls
        .push((request.method.clone(), request.data.clone()));

    if state.failing.contains(&request.method) {
        let reason = format!("{} unavailable", request.method);
        drop(state);
        request.reject(RpcError::new(CODE_INTERNAL, reason));
        return;
    }

    let result = dispatch(&mut state, &request);
    drop(state);
    request.respond(result);
}

fn to_value<T: serde::Serialize>(value: &T) -> Result<Value, RpcError> {
    serde_json::to_value(value).map_err(|e| RpcError::internal(e.to_string()))
}

fn dispatch(state: &mut State, request: &IncomingRequest) -> Result<Value, RpcError> {
    match request.method.as_str() {
        GetBizInfo::NAME => {
            let req: RoomUserRef = request.parse()?;
            let bizid = state
                .users
                .get(&(req.rid, req.uid))
                .cloned()
                .unwrap_or_default();
            to_value(&BizInfo { bizid })
        }
        GetSfuInfo::NAME => {
            let req: SfuInfoRequest = request.parse()?;
            let sfuid = state
                .pubs
                .iter()
                .find(|p| p.rid == req.rid && p.mid == req.mid)
                .map(|p| p.sfuid.clone())
                .unwrap_or_default();
            to_value(&SfuInfo { sfuid })
        }
        GetRoomUsers::NAME => {
            let req: RoomUserRef = request.parse()?;
            let users = state
                .users
                .iter()
                .filter(|((rid, _), _)| *rid == req.rid)
                .map(|((rid, uid), bizid)| RoomUser {
                    rid: rid.clone(),
                    uid: uid.clone(),
                    bizid: bizid.clone(),
                })
                .collect();
            to_value(&RoomUsers { users })
        }
        GetRoomPubs::NAME => {
            let req: RoomUserRef = request.parse()?;
            let pubs = state
                .pubs
                .iter()
                .filter(|p| p.rid == req.rid)
                .cloned()
                .collect();
            to_value(&RoomPubs { pubs })
        }
        StreamRemove::NAME => {
            let req: StreamRemoveRequest = request.parse()?;
            let (removed, kept): (Vec<RoomPub>, Vec<RoomPub>) =
                state.pubs.drain(..).partition(|p| {
                    p.rid == req.rid && p.uid == req.uid && (req.mid.is_empty() || p.mid == req.mid)
                });
            state.pubs = kept;
            let rm_pubs = removed
                .into_iter()
                .map(|p| RemovedPub {
                    rid: p.rid,
                    uid: p.uid,
                    mid: p.mid,
                })
                .collect();
            to_value(&StreamRemoveResponse { rm_pubs })
        }
        ClientLeave::NAME => {
            let req: RoomUserRef = request.parse()?;
            state.users.remove(&(req.rid.clone(), req.uid.clone()));
            to_value(&req)
        }
        ClientJoin::NAME => {
            let req: ClientJoinRequest = request.parse()?;
            state.users.insert((req.rid, req.uid), req.bizid);
            to_value(&Empty {})
        }
        StreamAdd::NAME => {
            let req: RoomPub = request.parse()?;
            state.pubs.push(req);
            to_value(&Empty {})
        }
        other => Err(RpcError::new(
            CODE_BAD_REQUEST,
            format!("unknown method: {other}"),
        )),
    }
}
