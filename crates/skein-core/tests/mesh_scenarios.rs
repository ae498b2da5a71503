// End-to-end mesh scenarios over the in-process hub transport.
//
// Each test wires a small topology (line, triangle) out of MemoryAdapters
// with explicit links, starts full MeshNodes on top, and drives real
// announce/auto-connect machinery — nothing is stubbed below the adapter
// contract.

use skein_core::{DataPayload, MeshNode, Message, MessageType, NodeConfig, PongPayload};
use skein_transport::{DiscoveredPeer, MemoryAdapter, MemoryHub, TransportAdapter};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

async fn start_node(hub: &Arc<MemoryHub>, id: &str) -> MeshNode {
    let config = NodeConfig::new(format!("user-{id}"))
        .with_peer_id(id)
        .with_announce_interval(Duration::from_millis(50));
    let node = MeshNode::new(config);
    let adapter: Arc<dyn TransportAdapter> = Arc::new(MemoryAdapter::new(
        Arc::clone(hub),
        DiscoveredPeer::new(id, format!("user-{id}")),
    ));
    node.add_adapter(adapter).await.unwrap();
    node.start().await.unwrap();
    node
}

async fn wait_until<F: Fn() -> bool>(what: &str, condition: F) {
    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    while !condition() {
        if std::time::Instant::now() > deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

async fn recv_data(rx: &mut broadcast::Receiver<Message>) -> Message {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for message")
        .expect("message stream closed")
}

/// A—B—C line; every node sees every other through announces.
async fn start_line(hub: &Arc<MemoryHub>) -> (MeshNode, MeshNode, MeshNode) {
    hub.link("a", "b");
    hub.link("b", "c");
    let a = start_node(hub, "a").await;
    let b = start_node(hub, "b").await;
    let c = start_node(hub, "c").await;

    wait_until("line links up", || {
        a.get_peer("b").map(|p| p.is_direct()).unwrap_or(false)
            && b.get_peer("a").map(|p| p.is_direct()).unwrap_or(false)
            && b.get_peer("c").map(|p| p.is_direct()).unwrap_or(false)
            && c.get_peer("b").map(|p| p.is_direct()).unwrap_or(false)
    })
    .await;
    wait_until("routes propagate", || {
        a.get_peer("c").is_some() && c.get_peer("a").is_some()
    })
    .await;
    (a, b, c)
}

// S1: broadcast over a line, ttl accounting, no echo at the origin.
#[tokio::test]
async fn test_s1_broadcast_over_line() {
    let hub = MemoryHub::with_links();
    let (a, b, c) = start_line(&hub).await;

    let mut a_messages = a.on_message();
    let mut b_messages = b.on_message();
    let mut c_messages = c.on_message();

    let sent = a.broadcast("hi", vec![], HashMap::new(), Some(3)).unwrap();

    let at_b = recv_data(&mut b_messages).await;
    assert_eq!(at_b.id, sent.id);
    assert_eq!(at_b.ttl, 3, "first hop receives the full budget");

    let at_c = recv_data(&mut c_messages).await;
    assert_eq!(at_c.id, sent.id);
    assert_eq!(at_c.ttl, 2, "one hop spent crossing b");

    // The origin never gets a copy back (pre-marked id + horizon split).
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(a_messages.try_recv().is_err());

    for node in [a, b, c] {
        node.stop().await.unwrap();
    }
}

// S2: targeted send relayed by the middle node, which never delivers it.
#[tokio::test]
async fn test_s2_targeted_send_through_relay() {
    let hub = MemoryHub::with_links();
    let (a, b, c) = start_line(&hub).await;

    // a learned c via b's announces.
    let route = a.get_peer("c").unwrap();
    assert!(route.hop_count >= 1);
    assert_eq!(route.next_hop_peer_id.as_deref(), Some("b"));

    let mut b_messages = b.on_message();
    let mut c_messages = c.on_message();

    let sent = a
        .send_to_peer("c", "for C", vec![], HashMap::new(), Some(3))
        .unwrap();

    let at_c = recv_data(&mut c_messages).await;
    assert_eq!(at_c.id, sent.id);
    assert_eq!(at_c.ttl, 2);
    assert_eq!(
        at_c.decode_payload::<DataPayload>().unwrap().text,
        "for C"
    );

    // Not for b: relayed, never delivered there.
    assert!(b_messages.try_recv().is_err());

    for node in [a, b, c] {
        node.stop().await.unwrap();
    }
}

// S3: triangle flood — duplicates die in the dedup cache, exactly one
// delivery per node.
#[tokio::test]
async fn test_s3_triangle_duplicate_suppression() {
    let hub = MemoryHub::with_links();
    hub.link("a", "b");
    hub.link("b", "c");
    hub.link("a", "c");
    let a = start_node(&hub, "a").await;
    let b = start_node(&hub, "b").await;
    let c = start_node(&hub, "c").await;

    wait_until("triangle links up", || {
        a.direct_peers().len() == 2 && b.direct_peers().len() == 2 && c.direct_peers().len() == 2
    })
    .await;

    let mut b_messages = b.on_message();
    let mut c_messages = c.on_message();

    let sent = a.broadcast("flood", vec![], HashMap::new(), Some(5)).unwrap();

    let at_b = recv_data(&mut b_messages).await;
    let at_c = recv_data(&mut c_messages).await;
    assert_eq!(at_b.id, sent.id);
    assert_eq!(at_c.id, sent.id);

    // b forwarded to c and c forwarded to b; both copies must be dropped.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(b_messages.try_recv().is_err(), "duplicate delivered at b");
    assert!(c_messages.try_recv().is_err(), "duplicate delivered at c");

    assert!(b.stats().duplicates >= 1 || c.stats().duplicates >= 1);

    for node in [a, b, c] {
        node.stop().await.unwrap();
    }
}

// S6: ping a two-hop peer, pong comes back with the ping id.
#[tokio::test]
async fn test_s6_ping_pong_across_relay() {
    let hub = MemoryHub::with_links();
    let (a, b, c) = start_line(&hub).await;

    let mut a_deliveries = a.router().subscribe_delivery();
    let ping_id = a.ping("c").unwrap();

    let pong = loop {
        let delivery = tokio::time::timeout(Duration::from_secs(5), a_deliveries.recv())
            .await
            .expect("timed out waiting for pong")
            .expect("delivery stream closed");
        if delivery.message.message_type == MessageType::Pong {
            break delivery.message;
        }
    };

    assert_eq!(pong.source_id, "c");
    assert_eq!(pong.target_ids, vec!["a".to_string()]);
    let payload: PongPayload = pong.decode_payload().unwrap();
    assert_eq!(payload.ping_id, ping_id);

    for node in [a, b, c] {
        node.stop().await.unwrap();
    }
}

// Losing the relay cascades: the far end disappears from the table and is
// re-learned once the link heals.
#[tokio::test]
async fn test_relay_loss_cascades_and_relearns() {
    let hub = MemoryHub::with_links();
    let (a, b, c) = start_line(&hub).await;

    assert!(a.get_peer("c").is_some());
    a.disconnect_peer("b").await.unwrap();

    // b and c both routed through the dropped link.
    assert!(a.get_peer("b").is_none());
    assert!(a.get_peer("c").is_none());
    assert_eq!(a.peer_count(), 0);

    // b is still advertising on the hub, so an explicit reconnect heals
    // the link and announces rebuild the two-hop route.
    a.connect_to_peer("b").await.unwrap();
    assert!(a.get_peer("b").map(|p| p.is_direct()).unwrap_or(false));
    wait_until("route to c re-learned", || a.get_peer("c").is_some()).await;

    for node in [a, b, c] {
        node.stop().await.unwrap();
    }
}

// Reserved message types ride through relays untouched when addressed
// elsewhere.
#[tokio::test]
async fn test_reserved_type_forwarded_unchanged() {
    let hub = MemoryHub::with_links();
    let (a, b, c) = start_line(&hub).await;

    let mut c_deliveries = c.router().subscribe_delivery();

    let mut msg = Message::data(
        "a",
        "user-a",
        vec!["c".to_string()],
        &DataPayload::default(),
        4,
    );
    msg.message_type = MessageType::RouteRequest;
    msg.payload = Some(serde_json::json!({"probe": true, "nonce": 7}));
    a.router().send_message(&msg).unwrap();

    let delivery = loop {
        let delivery = tokio::time::timeout(Duration::from_secs(5), c_deliveries.recv())
            .await
            .expect("timed out waiting for reserved message")
            .expect("delivery stream closed");
        if delivery.message.message_type == MessageType::RouteRequest {
            break delivery;
        }
    };
    assert_eq!(delivery.message.id, msg.id);
    assert_eq!(delivery.received_from, "b");
    assert_eq!(
        delivery.message.payload,
        Some(serde_json::json!({"probe": true, "nonce": 7}))
    );

    for node in [a, b, c] {
        node.stop().await.unwrap();
    }
}
