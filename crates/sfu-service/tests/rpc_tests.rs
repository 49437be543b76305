//! The media node's RPC surface, driven over the in-memory bus.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use cluster_test_utils::{SfuHarness, TestCluster, MOCK_ANSWER_SDP};
use common::bus::{Requestor, CODE_BAD_REQUEST, CODE_INTERNAL};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

fn requestor(cluster: &TestCluster, sfu: &SfuHarness) -> Requestor {
    Requestor::new(
        Arc::clone(&cluster.substrate.bus),
        sfu.node.rpc_channel(),
        Duration::from_secs(2),
    )
}

fn publish_request(kind: &str) -> Value {
    json!({"rid": "room-1", "uid": "alice", "jsep": {"type": kind, "sdp": "v=0"}})
}

#[tokio::test]
async fn test_publish_creates_publisher_and_answers() {
    let cluster = TestCluster::new();
    let sfu = cluster.sfu_node("sfu-1", 0).await;
    let rpc = requestor(&cluster, &sfu);

    let response = rpc
        .request_raw("publish", publish_request("offer"))
        .await
        .unwrap();

    let mid = response["mid"].as_str().unwrap();
    assert!(!mid.is_empty());
    assert_eq!(response["jsep"], json!({"type": "answer", "sdp": MOCK_ANSWER_SDP}));

    let entry = sfu.registry.get(mid).await.unwrap();
    assert_eq!(entry.rid, "room-1");
    assert_eq!(entry.uid, "alice");
    assert_eq!(sfu.registry.len(), 1);
}

#[tokio::test]
async fn test_each_publish_gets_its_own_stream_id() {
    let cluster = TestCluster::new();
    let sfu = cluster.sfu_node("sfu-1", 0).await;
    let rpc = requestor(&cluster, &sfu);

    let first = rpc.request_raw("publish", publish_request("offer")).await.unwrap();
    let second = rpc.request_raw("publish", publish_request("offer")).await.unwrap();

    assert_ne!(first["mid"], second["mid"]);
    assert_eq!(sfu.registry.len(), 2);
}

#[tokio::test]
async fn test_failed_negotiation_releases_session() {
    let cluster = TestCluster::new();
    let sfu = cluster.sfu_node("sfu-1", 0).await;
    let rpc = requestor(&cluster, &sfu);

    let err = rpc
        .request_raw("publish", publish_request("answer"))
        .await
        .unwrap_err();

    assert_eq!(err.code, CODE_BAD_REQUEST);
    assert!(sfu.registry.is_empty());
    assert!(sfu.factory.last_session().session.is_closed());
}

#[tokio::test]
async fn test_transport_creation_failure_is_internal_error() {
    let cluster = TestCluster::new();
    let sfu = cluster.sfu_node("sfu-1", 0).await;
    sfu.factory.fail_create(true);
    let rpc = requestor(&cluster, &sfu);

    let err = rpc
        .request_raw("publish", publish_request("offer"))
        .await
        .unwrap_err();

    assert_eq!(err.code, CODE_INTERNAL);
    assert_eq!(err.reason, "internal error");
    assert!(sfu.registry.is_empty());
}

#[tokio::test]
async fn test_malformed_and_unknown_requests_are_rejected() {
    let cluster = TestCluster::new();
    let sfu = cluster.sfu_node("sfu-1", 0).await;
    let rpc = requestor(&cluster, &sfu);

    let err = rpc
        .request_raw("publish", json!({"rid": "room-1"}))
        .await
        .unwrap_err();
    assert_eq!(err.code, CODE_BAD_REQUEST);

    let err = rpc.request_raw("subscribe", json!({})).await.unwrap_err();
    assert_eq!(err.code, CODE_BAD_REQUEST);
}

#[tokio::test]
async fn test_unpublish_closes_publisher_and_is_idempotent() {
    let cluster = TestCluster::new();
    let sfu = cluster.sfu_node("sfu-1", 0).await;
    let rpc = requestor(&cluster, &sfu);

    let response = rpc.request_raw("publish", publish_request("offer")).await.unwrap();
    let mid = response["mid"].as_str().unwrap().to_string();

    let request = json!({"rid": "room-1", "uid": "alice", "mid": mid});
    assert_eq!(rpc.request_raw("unpublish", request.clone()).await.unwrap(), json!({}));
    assert!(sfu.registry.is_empty());

    let session = sfu.factory.session_for(&mid);
    assert!(session.session.is_closed());
    assert_eq!(session.session.close_calls(), 1);

    assert_eq!(rpc.request_raw("unpublish", request).await.unwrap(), json!({}));
}
