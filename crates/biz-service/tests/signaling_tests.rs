//! Signaling frames end to end: frame parsing, handlers, presence and media
//! node calls.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]

use biz_service::cleanup::disconnect_peer;
use biz_service::session::Peer;
use biz_service::signaling::handle_frame;
use cluster_test_utils::{BizHarness, MockIslb, MockPeer, TestCluster, MOCK_ANSWER_SDP};
use serde_json::{json, Value};
use std::sync::Arc;

async fn request(biz: &BizHarness, peer: &Arc<Peer>, id: u64, method: &str, data: Value) -> Value {
    let frame = json!({"request": true, "id": id, "method": method, "data": data});
    handle_frame(&biz.ctx, peer, &frame.to_string())
        .await
        .expect("requests always get a response")
}

fn offer() -> Value {
    json!({"type": "offer", "sdp": "v=0\r\n"})
}

#[tokio::test]
async fn test_invalid_frames_get_fixed_reject_codes() {
    let cluster = TestCluster::new();
    let biz = cluster.biz_node("biz-1").await;
    let (peer, _) = MockPeer::connect("alice");

    let response = handle_frame(&biz.ctx, &peer, r#"{"request":true,"id":1,"data":{}}"#)
        .await
        .unwrap();
    assert_eq!(response["ok"], json!(false));
    assert_eq!(response["errorCode"], json!(-1));
    assert_eq!(response["errorReason"], json!("invalid method"));

    let response = handle_frame(
        &biz.ctx,
        &peer,
        r#"{"request":true,"id":2,"method":"join","data":"room-1"}"#,
    )
    .await
    .unwrap();
    assert_eq!(response["id"], json!(2));
    assert_eq!(response["errorCode"], json!(-1));
    assert_eq!(response["errorReason"], json!("invalid data"));

    let response = handle_frame(
        &biz.ctx,
        &peer,
        r#"{"request":true,"id":3,"method":"subscribe","data":{}}"#,
    )
    .await
    .unwrap();
    assert_eq!(response["errorCode"], json!(-1));

    // Unanswerable frames produce nothing
    assert!(handle_frame(&biz.ctx, &peer, "not json").await.is_none());
    assert!(handle_frame(&biz.ctx, &peer, r#"{"notification":true,"data":{}}"#)
        .await
        .is_none());
}

#[tokio::test]
async fn test_join_records_presence_and_returns_room_state() {
    let cluster = TestCluster::new();
    let islb = MockIslb::builder()
        .with_user("room-1", "bob", "biz-1")
        .start(&cluster.substrate)
        .await;
    let biz = cluster.biz_node("biz-1").await;
    biz.sync().await;

    let (bob, bob_rx) = MockPeer::connect("bob");
    biz.ctx.rooms().add_peer("room-1", bob).await;

    let (alice, _) = MockPeer::connect("alice");
    let response = request(
        &biz,
        &alice,
        1,
        "join",
        json!({"rid": "room-1", "info": {"name": "Alice"}}),
    )
    .await;

    assert_eq!(response["ok"], json!(true), "{response}");
    let users = response["data"]["users"].as_array().unwrap();
    assert_eq!(users.len(), 2);
    assert_eq!(response["data"]["pubs"], json!([]));

    assert_eq!(islb.bizid_of("room-1", "alice").as_deref(), Some("biz-1"));
    assert!(biz.ctx.rooms().get_peer("room-1", "alice").await.is_some());

    let joins = bob_rx.notifications_named("peer-join");
    assert_eq!(
        joins,
        vec![json!({"rid": "room-1", "uid": "alice", "info": {"name": "Alice"}})]
    );
}

#[tokio::test]
async fn test_join_without_presence_service_is_rejected() {
    let cluster = TestCluster::new();
    let biz = cluster.biz_node("biz-1").await;
    biz.sync().await;

    let (alice, _) = MockPeer::connect("alice");
    let response = request(&biz, &alice, 1, "join", json!({"rid": "room-1"})).await;

    assert_eq!(response["ok"], json!(false));
    assert_eq!(response["errorCode"], json!(503));
    assert!(biz.ctx.rooms().get_peer("room-1", "alice").await.is_none());
}

#[tokio::test]
async fn test_rejoin_closes_previous_connection() {
    let cluster = TestCluster::new();
    let _islb = MockIslb::builder().start(&cluster.substrate).await;
    let biz = cluster.biz_node("biz-1").await;
    biz.sync().await;

    let (first, first_rx) = MockPeer::connect("alice");
    let (second, second_rx) = MockPeer::connect("alice");
    request(&biz, &first, 1, "join", json!({"rid": "room-1"})).await;
    request(&biz, &second, 1, "join", json!({"rid": "room-1"})).await;

    assert!(first_rx.is_closed());
    assert!(!second_rx.is_closed());
    assert_eq!(biz.ctx.rooms().load(), 1);
}

#[tokio::test]
async fn test_leave_notifies_room_and_clears_presence() {
    let cluster = TestCluster::new();
    let islb = MockIslb::builder().start(&cluster.substrate).await;
    let biz = cluster.biz_node("biz-1").await;
    biz.sync().await;

    let (alice, _) = MockPeer::connect("alice");
    let (bob, bob_rx) = MockPeer::connect("bob");
    request(&biz, &alice, 1, "join", json!({"rid": "room-1"})).await;
    request(&biz, &bob, 1, "join", json!({"rid": "room-1"})).await;

    let response = request(&biz, &alice, 2, "leave", json!({"rid": "room-1"})).await;
    assert_eq!(response["ok"], json!(true));
    assert_eq!(response["data"], json!({}));

    assert!(islb.bizid_of("room-1", "alice").is_none());
    assert_eq!(
        bob_rx.notifications_named("peer-leave"),
        vec![json!({"rid": "room-1", "uid": "alice"})]
    );

    request(&biz, &bob, 2, "leave", json!({"rid": "room-1"})).await;
    assert!(!biz.ctx.rooms().has_room("room-1").await);
}

#[tokio::test]
async fn test_publish_requires_membership() {
    let cluster = TestCluster::new();
    let _islb = MockIslb::builder().start(&cluster.substrate).await;
    let biz = cluster.biz_node("biz-1").await;
    biz.sync().await;

    let (alice, _) = MockPeer::connect("alice");
    let response = request(
        &biz,
        &alice,
        1,
        "publish",
        json!({"rid": "room-1", "jsep": offer()}),
    )
    .await;

    assert_eq!(response["errorCode"], json!(404));
}

#[tokio::test]
async fn test_publish_without_media_node_is_unavailable() {
    let cluster = TestCluster::new();
    let _islb = MockIslb::builder().start(&cluster.substrate).await;
    let biz = cluster.biz_node("biz-1").await;
    biz.sync().await;

    let (alice, _) = MockPeer::connect("alice");
    request(&biz, &alice, 1, "join", json!({"rid": "room-1"})).await;
    let response = request(
        &biz,
        &alice,
        2,
        "publish",
        json!({"rid": "room-1", "jsep": offer()}),
    )
    .await;

    assert_eq!(response["errorCode"], json!(503));
}

#[tokio::test]
async fn test_publish_and_unpublish_through_media_node() {
    let cluster = TestCluster::new();
    let islb = MockIslb::builder().start(&cluster.substrate).await;
    let sfu = cluster.sfu_node("sfu-1", 0).await;
    let biz = cluster.biz_node("biz-1").await;
    biz.sync().await;

    let (alice, _) = MockPeer::connect("alice");
    let (bob, bob_rx) = MockPeer::connect("bob");
    request(&biz, &alice, 1, "join", json!({"rid": "room-1"})).await;
    request(&biz, &bob, 1, "join", json!({"rid": "room-1"})).await;

    let response = request(
        &biz,
        &alice,
        2,
        "publish",
        json!({"rid": "room-1", "jsep": offer(), "minfo": {"audio": true, "video": true}}),
    )
    .await;
    assert_eq!(response["ok"], json!(true), "{response}");
    let mid = response["data"]["mid"].as_str().unwrap().to_string();
    assert_eq!(response["data"]["sfuid"], json!("sfu-1"));
    assert_eq!(response["data"]["jsep"]["type"], json!("answer"));
    assert_eq!(response["data"]["jsep"]["sdp"], json!(MOCK_ANSWER_SDP));

    assert_eq!(sfu.registry.len(), 1);
    assert!(sfu.registry.get(&mid).await.is_some());
    let pubs = islb.pubs();
    assert_eq!(pubs.len(), 1);
    assert_eq!(pubs[0].mid, mid);
    assert_eq!(pubs[0].sfuid, "sfu-1");

    let added = bob_rx.notifications_named("stream-add");
    assert_eq!(added.len(), 1);
    assert_eq!(added[0]["mid"], json!(mid));

    let response = request(
        &biz,
        &alice,
        3,
        "unpublish",
        json!({"rid": "room-1", "mid": mid}),
    )
    .await;
    assert_eq!(response["ok"], json!(true), "{response}");

    assert!(sfu.registry.is_empty());
    assert!(sfu.factory.last_session().session.is_closed());
    assert!(islb.pubs().is_empty());
    assert_eq!(
        bob_rx.notifications_named("stream-remove"),
        vec![json!({"rid": "room-1", "uid": "alice", "mid": mid})]
    );
}

#[tokio::test]
async fn test_publish_goes_to_least_loaded_media_node() {
    let cluster = TestCluster::new();
    let _islb = MockIslb::builder().start(&cluster.substrate).await;
    let busy = cluster.sfu_node("sfu-a", 5).await;
    let idle = cluster.sfu_node("sfu-b", 1).await;
    let biz = cluster.biz_node("biz-1").await;
    biz.sync().await;

    let (alice, _) = MockPeer::connect("alice");
    request(&biz, &alice, 1, "join", json!({"rid": "room-1"})).await;
    let response = request(
        &biz,
        &alice,
        2,
        "publish",
        json!({"rid": "room-1", "jsep": offer()}),
    )
    .await;

    assert_eq!(response["data"]["sfuid"], json!("sfu-b"));
    assert_eq!(idle.registry.len(), 1);
    assert!(busy.registry.is_empty());
}

#[tokio::test]
async fn test_unpublish_unknown_stream_is_not_found() {
    let cluster = TestCluster::new();
    let _islb = MockIslb::builder().start(&cluster.substrate).await;
    let biz = cluster.biz_node("biz-1").await;
    biz.sync().await;

    let (alice, _) = MockPeer::connect("alice");
    request(&biz, &alice, 1, "join", json!({"rid": "room-1"})).await;
    let response = request(
        &biz,
        &alice,
        2,
        "unpublish",
        json!({"rid": "room-1", "mid": "nope"}),
    )
    .await;

    assert_eq!(response["errorCode"], json!(404));
}

#[tokio::test]
async fn test_publish_releases_media_stream_when_presence_record_fails() {
    let cluster = TestCluster::new();
    let islb = MockIslb::builder()
        .failing("streamAdd")
        .start(&cluster.substrate)
        .await;
    let sfu = cluster.sfu_node("sfu-1", 0).await;
    let biz = cluster.biz_node("biz-1").await;
    biz.sync().await;

    let (alice, _) = MockPeer::connect("alice");
    let (bob, bob_rx) = MockPeer::connect("bob");
    request(&biz, &alice, 1, "join", json!({"rid": "room-1"})).await;
    request(&biz, &bob, 1, "join", json!({"rid": "room-1"})).await;

    let response = request(
        &biz,
        &alice,
        2,
        "publish",
        json!({"rid": "room-1", "jsep": offer()}),
    )
    .await;

    assert_eq!(response["ok"], json!(false));
    assert_eq!(response["errorCode"], json!(500));
    assert!(sfu.registry.is_empty());
    assert!(sfu.factory.last_session().session.is_closed());
    assert!(islb.pubs().is_empty());
    assert!(bob_rx.notifications_named("stream-add").is_empty());
}

#[tokio::test]
async fn test_unpublish_after_media_node_left_clears_stream_record() {
    let cluster = TestCluster::new();
    let islb = MockIslb::builder().start(&cluster.substrate).await;
    let sfu = cluster.sfu_node("sfu-1", 0).await;
    let biz = cluster.biz_node("biz-1").await;
    biz.sync().await;

    let (alice, _) = MockPeer::connect("alice");
    let (bob, bob_rx) = MockPeer::connect("bob");
    request(&biz, &alice, 1, "join", json!({"rid": "room-1"})).await;
    request(&biz, &bob, 1, "join", json!({"rid": "room-1"})).await;
    let response = request(
        &biz,
        &alice,
        2,
        "publish",
        json!({"rid": "room-1", "jsep": offer()}),
    )
    .await;
    let mid = response["data"]["mid"].as_str().unwrap().to_string();

    cluster.deregister(&sfu.node).await;
    biz.sync().await;

    let response = request(
        &biz,
        &alice,
        3,
        "unpublish",
        json!({"rid": "room-1", "mid": mid}),
    )
    .await;

    assert_eq!(response["ok"], json!(true), "{response}");
    assert!(islb.pubs().is_empty());
    assert_eq!(
        bob_rx.notifications_named("stream-remove"),
        vec![json!({"rid": "room-1", "uid": "alice", "mid": mid})]
    );
}

#[tokio::test]
async fn test_disconnect_leaves_every_joined_room() {
    let cluster = TestCluster::new();
    let islb = MockIslb::builder().start(&cluster.substrate).await;
    let biz = cluster.biz_node("biz-1").await;
    biz.sync().await;

    let (alice, _) = MockPeer::connect("alice");
    let (bob, bob_rx) = MockPeer::connect("bob");
    request(&biz, &alice, 1, "join", json!({"rid": "room-1"})).await;
    request(&biz, &alice, 2, "join", json!({"rid": "room-2"})).await;
    request(&biz, &bob, 1, "join", json!({"rid": "room-1"})).await;

    alice.close().await;
    assert_eq!(disconnect_peer(&biz.ctx, &alice).await, 2);

    assert!(biz.ctx.rooms().get_peer("room-1", "alice").await.is_none());
    assert!(islb.bizid_of("room-1", "alice").is_none());
    assert!(islb.bizid_of("room-2", "alice").is_none());
    assert_eq!(
        bob_rx.notifications_named("peer-leave"),
        vec![json!({"rid": "room-1", "uid": "alice"})]
    );
    assert!(biz.ctx.rooms().has_room("room-1").await);
    assert!(!biz.ctx.rooms().has_room("room-2").await);
    assert_eq!(biz.ctx.rooms().load(), 1);
}

#[tokio::test]
async fn test_disconnect_of_replaced_connection_keeps_rejoin() {
    let cluster = TestCluster::new();
    let islb = MockIslb::builder().start(&cluster.substrate).await;
    let biz = cluster.biz_node("biz-1").await;
    biz.sync().await;

    let (first, _) = MockPeer::connect("alice");
    let (second, _) = MockPeer::connect("alice");
    request(&biz, &first, 1, "join", json!({"rid": "room-1"})).await;
    request(&biz, &second, 1, "join", json!({"rid": "room-1"})).await;

    assert_eq!(disconnect_peer(&biz.ctx, &first).await, 0);

    let current = biz.ctx.rooms().get_peer("room-1", "alice").await.unwrap();
    assert!(Arc::ptr_eq(&current, &second));
    assert_eq!(islb.bizid_of("room-1", "alice").as_deref(), Some("biz-1"));
    assert!(islb.calls_named("clientLeave").is_empty());
}
