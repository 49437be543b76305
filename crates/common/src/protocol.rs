//! Inter-node method and event vocabulary.
//!
//! Every RPC is described by a marker type implementing [`RpcMethod`], which
//! ties the wire method name to its request and response shapes. Field names
//! are the wire names (`rid`, `uid`, `mid`, ...).

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A typed RPC method.
pub trait RpcMethod {
    /// Wire method name.
    const NAME: &'static str;
    /// Request payload.
    type Request: Serialize + Send + Sync;
    /// Response payload.
    type Response: DeserializeOwned + Send;
}

/// Broadcast and client-notification event names.
pub mod events {
    /// A peer joined a room.
    pub const PEER_JOIN: &str = "peer-join";
    /// A peer left a room.
    pub const PEER_LEAVE: &str = "peer-leave";
    /// A stream was published in a room.
    pub const STREAM_ADD: &str = "stream-add";
    /// A stream was removed from a room.
    pub const STREAM_REMOVE: &str = "stream-remove";
    /// A media node tore down a publisher on its own.
    pub const SFU_STREAM_REMOVE: &str = "sfu-stream-remove";
}

/// Empty request or response body.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Empty {}

/// Session description exchanged during negotiation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    /// `offer` or `answer`.
    #[serde(rename = "type")]
    pub kind: String,
    /// SDP body.
    pub sdp: String,
}

impl SessionDescription {
    /// An answer with the given SDP.
    #[must_use]
    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: "answer".to_string(),
            sdp: sdp.into(),
        }
    }
}

/// Identifies a user inside a room.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomUserRef {
    /// Room id.
    pub rid: String,
    /// User id.
    pub uid: String,
}

/// Presence entry returned by the presence service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomUser {
    /// Room id.
    pub rid: String,
    /// User id.
    pub uid: String,
    /// Signaling node hosting the user.
    #[serde(default)]
    pub bizid: String,
}

/// Published stream entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoomPub {
    /// Room id.
    pub rid: String,
    /// Publishing user.
    pub uid: String,
    /// Stream id.
    pub mid: String,
    /// Media node carrying the stream.
    #[serde(default)]
    pub sfuid: String,
    /// Opaque media info.
    #[serde(default)]
    pub minfo: Value,
}

/// A stream that was removed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemovedPub {
    /// Room id.
    pub rid: String,
    /// Publishing user.
    pub uid: String,
    /// Stream id.
    pub mid: String,
}

/// Response to [`GetBizInfo`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BizInfo {
    /// Signaling node hosting the user; empty when the user is absent.
    #[serde(default)]
    pub bizid: String,
}

/// Request to [`GetSfuInfo`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SfuInfoRequest {
    /// Room id.
    pub rid: String,
    /// Stream id.
    pub mid: String,
}

/// Response to [`GetSfuInfo`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SfuInfo {
    /// Media node carrying the stream.
    #[serde(default)]
    pub sfuid: String,
}

/// Response to [`GetRoomUsers`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomUsers {
    /// Users present in the room.
    #[serde(default)]
    pub users: Vec<RoomUser>,
}

/// Response to [`GetRoomPubs`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RoomPubs {
    /// Streams published in the room.
    #[serde(default)]
    pub pubs: Vec<RoomPub>,
}

/// Request to [`StreamRemove`]. An empty `mid` removes every stream of the user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamRemoveRequest {
    /// Room id.
    pub rid: String,
    /// User id.
    pub uid: String,
    /// Stream id, or empty for all of the user's streams.
    #[serde(default)]
    pub mid: String,
}

/// Response to [`StreamRemove`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamRemoveResponse {
    /// Streams that were removed.
    #[serde(rename = "rmPubs", default)]
    pub rm_pubs: Vec<RemovedPub>,
}

/// Request to [`ClientJoin`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientJoinRequest {
    /// Room id.
    pub rid: String,
    /// User id.
    pub uid: String,
    /// Signaling node hosting the user.
    pub bizid: String,
    /// Opaque user info.
    #[serde(default)]
    pub info: Value,
}

/// Request to [`StreamAdd`].
pub type StreamAddRequest = RoomPub;

/// Request to the media node's [`Publish`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishRequest {
    /// Room id.
    pub rid: String,
    /// Publishing user.
    pub uid: String,
    /// Offer from the client.
    pub jsep: SessionDescription,
}

/// Response to [`Publish`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishResponse {
    /// Stream id assigned by the media node.
    pub mid: String,
    /// Answer for the client.
    pub jsep: SessionDescription,
}

/// Request to the media node's [`Unpublish`].
pub type UnpublishRequest = RemovedPub;

/// Payload of the `peer-join` notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerJoinNotice {
    /// Room id.
    pub rid: String,
    /// User id.
    pub uid: String,
    /// Opaque user info.
    #[serde(default)]
    pub info: Value,
}

macro_rules! rpc_method {
    ($(#[$doc:meta])* $ty:ident, $name:literal, $req:ty, $resp:ty) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Copy)]
        pub struct $ty;

        impl RpcMethod for $ty {
            const NAME: &'static str = $name;
            type Request = $req;
            type Response = $resp;
        }
    };
}

rpc_method!(
    /// Which signaling node hosts a user.
    GetBizInfo, "getBizInfo", RoomUserRef, BizInfo
);
rpc_method!(
    /// Which media node carries a stream.
    GetSfuInfo, "getSfuInfo", SfuInfoRequest, SfuInfo
);
rpc_method!(
    /// Users present in a room.
    GetRoomUsers, "getRoomUsers", RoomUserRef, RoomUsers
);
rpc_method!(
    /// Streams published in a room.
    GetRoomPubs, "getRoomPubs", RoomUserRef, RoomPubs
);
rpc_method!(
    /// Remove one or all of a user's streams from presence.
    StreamRemove, "streamRemove", StreamRemoveRequest, StreamRemoveResponse
);
rpc_method!(
    /// Remove a user from presence.
    ClientLeave, "clientLeave", RoomUserRef, RoomUserRef
);
rpc_method!(
    /// Record a user's presence.
    ClientJoin, "clientJoin", ClientJoinRequest, Empty
);
rpc_method!(
    /// Record a published stream.
    StreamAdd, "streamAdd", StreamAddRequest, Empty
);
rpc_method!(
    /// Ask a media node to accept a publisher.
    Publish, "publish", PublishRequest, PublishResponse
);
rpc_method!(
    /// Ask a media node to tear down a publisher.
    Unpublish, "unpublish", UnpublishRequest, Empty
);
