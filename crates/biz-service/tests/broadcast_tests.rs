//! Cross-node event relay: signaling-to-signaling and media-to-signaling.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]

use biz_service::broadcast::handle_broadcast;
use biz_service::signaling::handle_frame;
use cluster_test_utils::{MockIslb, MockPeer, TestCluster};
use common::bus::Broadcaster;
use common::protocol::events;
use common::types::SERVICE_SFU;
use serde_json::json;
use sfu_service::rtc::{ConnectionState, MediaKind};
use std::sync::Arc;
use std::time::Duration;

const WAIT: Duration = Duration::from_secs(2);

#[tokio::test]
async fn test_join_on_one_node_reaches_peers_on_another() {
    let cluster = TestCluster::new();
    let _islb = MockIslb::builder().start(&cluster.substrate).await;
    let biz1 = cluster.biz_node("biz-1").await;
    let biz2 = cluster.biz_node("biz-2").await;
    biz1.sync().await;
    biz2.sync().await;

    let (bob, bob_rx) = MockPeer::connect("bob");
    biz2.ctx.rooms().add_peer("room-1", bob).await;

    let (alice, _) = MockPeer::connect("alice");
    let frame = json!({"request": true, "id": 1, "method": "join", "data": {"rid": "room-1"}});
    handle_frame(&biz1.ctx, &alice, &frame.to_string()).await.unwrap();

    let inbound = biz2.next_broadcast(WAIT).await;
    assert_eq!(inbound.from.id, "biz-1");
    assert_eq!(inbound.event.method, events::PEER_JOIN);

    handle_broadcast(&biz2.ctx, inbound).await;
    let joins = bob_rx.notifications_named("peer-join");
    assert_eq!(joins.len(), 1);
    assert_eq!(joins[0]["uid"], json!("alice"));
}

#[tokio::test]
async fn test_relay_skips_originating_user_and_other_rooms() {
    let cluster = TestCluster::new();
    let _islb = MockIslb::builder().start(&cluster.substrate).await;
    let biz1 = cluster.biz_node("biz-1").await;
    let biz2 = cluster.biz_node("biz-2").await;
    biz1.sync().await;
    biz2.sync().await;

    // alice has a second connection on biz-2; carol is in another room
    let (alice_other, alice_other_rx) = MockPeer::connect("alice");
    let (carol, carol_rx) = MockPeer::connect("carol");
    biz2.ctx.rooms().add_peer("room-1", alice_other).await;
    biz2.ctx.rooms().add_peer("room-2", carol).await;

    let (alice, _) = MockPeer::connect("alice");
    let frame = json!({"request": true, "id": 1, "method": "join", "data": {"rid": "room-1"}});
    handle_frame(&biz1.ctx, &alice, &frame.to_string()).await.unwrap();

    let inbound = biz2.next_broadcast(WAIT).await;
    handle_broadcast(&biz2.ctx, inbound).await;

    assert!(alice_other_rx.notifications().is_empty());
    assert!(carol_rx.notifications().is_empty());
}

#[tokio::test]
async fn test_dead_publisher_is_removed_from_presence_and_room() {
    let cluster = TestCluster::new();
    let islb = MockIslb::builder().start(&cluster.substrate).await;
    let sfu = cluster.sfu_node("sfu-1", 0).await;
    sfu.start_stream_cleanup().await;
    let biz = cluster.biz_node("biz-1").await;
    biz.sync().await;
    assert!(biz.coordinator.has_subscription("sfu-1").await);

    let (alice, _) = MockPeer::connect("alice");
    let (bob, bob_rx) = MockPeer::connect("bob");
    for (peer, id) in [(&alice, 1), (&bob, 2)] {
        let frame = json!({"request": true, "id": id, "method": "join", "data": {"rid": "room-1"}});
        handle_frame(&biz.ctx, peer, &frame.to_string()).await.unwrap();
    }
    let frame = json!({
        "request": true,
        "id": 3,
        "method": "publish",
        "data": {"rid": "room-1", "jsep": {"type": "offer", "sdp": "v=0"}}
    });
    let response = handle_frame(&biz.ctx, &alice, &frame.to_string()).await.unwrap();
    let mid = response["data"]["mid"].as_str().unwrap().to_string();
    assert_eq!(islb.pubs().len(), 1);

    // The publisher's connection fails and the reaper sweeps it
    let session = sfu.factory.session_for(&mid);
    let _audio = session.add_track(MediaKind::Audio).await;
    session.set_state(ConnectionState::Connected).await;
    session.set_state(ConnectionState::Failed).await;
    let publisher = sfu.registry.get(&mid).await.unwrap().publisher;
    tokio::time::timeout(WAIT, async {
        while !publisher.is_dead() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
    assert_eq!(sfu.registry.reap_once().await, 1);

    let inbound = biz.next_broadcast(WAIT).await;
    assert_eq!(inbound.from.name, SERVICE_SFU);
    assert_eq!(inbound.event.method, events::SFU_STREAM_REMOVE);
    assert_eq!(inbound.event.data["mid"], json!(mid));

    handle_broadcast(&biz.ctx, inbound).await;

    assert!(islb.pubs().is_empty());
    assert_eq!(
        islb.calls_named("streamRemove").last().unwrap(),
        &json!({"rid": "room-1", "uid": "alice", "mid": mid})
    );
    let removed = bob_rx.notifications_named("stream-remove");
    assert_eq!(removed, vec![json!({"rid": "room-1", "uid": "alice", "mid": mid})]);
}

#[tokio::test]
async fn test_media_node_events_reach_one_signaling_node() {
    let cluster = TestCluster::new();
    let sfu = cluster.sfu_node("sfu-1", 0).await;
    let biz1 = cluster.biz_node("biz-1").await;
    let biz2 = cluster.biz_node("biz-2").await;
    biz1.sync().await;
    biz2.sync().await;

    let broadcaster = Broadcaster::new(Arc::clone(&cluster.substrate.bus), sfu.node.event_channel());
    broadcaster
        .say(
            events::SFU_STREAM_REMOVE,
            &json!({"rid": "room-1", "uid": "alice", "mid": "m-1"}),
        )
        .await;

    let first = biz1.try_next_broadcast(Duration::from_millis(200)).await;
    let second = biz2.try_next_broadcast(Duration::from_millis(200)).await;
    assert_eq!(
        usize::from(first.is_some()) + usize::from(second.is_some()),
        1,
        "group delivery hands each media node event to exactly one signaling node"
    );
}
