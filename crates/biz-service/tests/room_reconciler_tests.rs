//! Room reconciliation against a mock presence service.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use biz_service::tasks::check_rooms_once;
use cluster_test_utils::{MockIslb, MockPeer, TestCluster};
use common::types::{ServiceNode, SERVICE_BIZ};
use serde_json::json;

#[tokio::test]
async fn test_peer_on_dead_node_is_evicted() {
    let cluster = TestCluster::new();
    let islb = MockIslb::builder()
        .with_user("room-1", "alice", "biz-gone")
        .with_user("room-1", "bob", "biz-1")
        .start(&cluster.substrate)
        .await;
    let biz = cluster.biz_node("biz-1").await;
    biz.sync().await;

    let (alice, _alice_rx) = MockPeer::connect("alice");
    let (bob, bob_rx) = MockPeer::connect("bob");
    biz.ctx.rooms().add_peer("room-1", alice).await;
    biz.ctx.rooms().add_peer("room-1", bob).await;

    let evicted = check_rooms_once(&biz.ctx).await;

    assert_eq!(evicted, 1);
    assert!(biz.ctx.rooms().get_peer("room-1", "alice").await.is_none());
    assert!(biz.ctx.rooms().get_peer("room-1", "bob").await.is_some());
    assert!(biz.ctx.rooms().has_room("room-1").await);

    assert_eq!(
        islb.calls_named("clientLeave"),
        vec![json!({"rid": "room-1", "uid": "alice"})]
    );
    assert!(islb.bizid_of("room-1", "alice").is_none());

    let leaves = bob_rx.notifications_named("peer-leave");
    assert_eq!(leaves, vec![json!({"rid": "room-1", "uid": "alice"})]);
}

#[tokio::test]
async fn test_streams_of_evicted_peer_are_removed() {
    let cluster = TestCluster::new();
    let islb = MockIslb::builder()
        .with_user("room-1", "alice", "biz-gone")
        .with_user("room-1", "bob", "biz-1")
        .with_pub(common::protocol::RoomPub {
            rid: "room-1".to_string(),
            uid: "alice".to_string(),
            mid: "m-1".to_string(),
            sfuid: "sfu-1".to_string(),
            minfo: json!({}),
        })
        .start(&cluster.substrate)
        .await;
    let biz = cluster.biz_node("biz-1").await;
    biz.sync().await;

    let (alice, _) = MockPeer::connect("alice");
    let (bob, bob_rx) = MockPeer::connect("bob");
    biz.ctx.rooms().add_peer("room-1", alice).await;
    biz.ctx.rooms().add_peer("room-1", bob).await;

    check_rooms_once(&biz.ctx).await;

    assert!(islb.pubs().is_empty());
    assert_eq!(
        bob_rx.methods(),
        vec!["stream-remove".to_string(), "peer-leave".to_string()]
    );
    assert_eq!(
        bob_rx.notifications_named("stream-remove"),
        vec![json!({"rid": "room-1", "uid": "alice", "mid": "m-1"})]
    );
}

#[tokio::test]
async fn test_confirmed_peers_survive() {
    let cluster = TestCluster::new();
    let islb = MockIslb::builder()
        .with_user("room-1", "alice", "biz-1")
        .with_user("room-1", "carol", "biz-2")
        .start(&cluster.substrate)
        .await;
    cluster
        .register(&ServiceNode::new("biz-2", "dc1", SERVICE_BIZ))
        .await;
    let biz = cluster.biz_node("biz-1").await;
    biz.sync().await;

    // carol's presence points at another live signaling node
    let (alice, alice_rx) = MockPeer::connect("alice");
    let (carol, _) = MockPeer::connect("carol");
    biz.ctx.rooms().add_peer("room-1", alice).await;
    biz.ctx.rooms().add_peer("room-1", carol).await;

    assert_eq!(check_rooms_once(&biz.ctx).await, 0);
    assert_eq!(biz.ctx.rooms().room_peers("room-1").await.len(), 2);
    assert!(islb.calls_named("clientLeave").is_empty());
    assert!(alice_rx.notifications().is_empty());
}

#[tokio::test]
async fn test_room_of_only_evicted_peer_is_deleted() {
    let cluster = TestCluster::new();
    let _islb = MockIslb::builder().start(&cluster.substrate).await;
    let biz = cluster.biz_node("biz-1").await;
    biz.sync().await;

    // Unknown to presence: empty bizid
    let (ghost, _) = MockPeer::connect("ghost");
    biz.ctx.rooms().add_peer("room-9", ghost).await;

    assert_eq!(check_rooms_once(&biz.ctx).await, 1);
    assert!(!biz.ctx.rooms().has_room("room-9").await);
    assert_eq!(biz.ctx.rooms().load(), 0);
}

#[tokio::test]
async fn test_failed_presence_lookup_leaves_peer_alone() {
    let cluster = TestCluster::new();
    let islb = MockIslb::builder()
        .with_user("room-1", "alice", "biz-gone")
        .failing("getBizInfo")
        .start(&cluster.substrate)
        .await;
    let biz = cluster.biz_node("biz-1").await;
    biz.sync().await;

    let (alice, _) = MockPeer::connect("alice");
    biz.ctx.rooms().add_peer("room-1", alice).await;

    assert_eq!(check_rooms_once(&biz.ctx).await, 0);
    assert!(biz.ctx.rooms().get_peer("room-1", "alice").await.is_some());

    // Once presence answers again the stale peer goes
    islb.recover("getBizInfo");
    assert_eq!(check_rooms_once(&biz.ctx).await, 1);
}

#[tokio::test]
async fn test_no_presence_service_evicts_nobody() {
    let cluster = TestCluster::new();
    let biz = cluster.biz_node("biz-1").await;
    biz.sync().await;

    let (alice, _) = MockPeer::connect("alice");
    biz.ctx.rooms().add_peer("room-1", alice).await;

    assert_eq!(check_rooms_once(&biz.ctx).await, 0);
    assert!(biz.ctx.rooms().has_room("room-1").await);
}

#[tokio::test]
async fn test_peer_node_going_down_triggers_eviction() {
    let cluster = TestCluster::new();
    let _islb = MockIslb::builder()
        .with_user("room-1", "carol", "biz-2")
        .start(&cluster.substrate)
        .await;
    let biz2 = ServiceNode::new("biz-2", "dc1", SERVICE_BIZ);
    cluster.register(&biz2).await;
    let biz = cluster.biz_node("biz-1").await;
    biz.sync().await;

    let (carol, _) = MockPeer::connect("carol");
    biz.ctx.rooms().add_peer("room-1", carol).await;
    assert_eq!(check_rooms_once(&biz.ctx).await, 0);

    cluster.deregister(&biz2).await;
    biz.sync().await;
    assert!(!biz.coordinator.has_requestor("biz-2").await);

    assert_eq!(check_rooms_once(&biz.ctx).await, 1);
}
