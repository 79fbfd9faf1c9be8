//! End-to-end tests over real loopback sockets: two full peers, direct
//! TCP transport, no broker.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use peer_core::{Delivery, Peer, PeerOptions};
use serde_json::{json, Value};
use tokio::sync::mpsc;

fn free_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

struct Pair {
    a: Peer,
    b: Peer,
}

/// Two peers with symmetric address books, which replies and broadcasts
/// both depend on.
async fn pair(opts_a: PeerOptions, opts_b: PeerOptions) -> Pair {
    let bind_a = format!("127.0.0.1:{}", free_port());
    let bind_b = format!("127.0.0.1:{}", free_port());

    let mut book_a = HashMap::new();
    book_a.insert("b".to_string(), bind_b.clone());
    let mut book_b = HashMap::new();
    book_b.insert("a".to_string(), bind_a.clone());

    let a = Peer::tcp("a", &bind_a, book_a, opts_a).await.unwrap();
    let b = Peer::tcp("b", &bind_b, book_b, opts_b).await.unwrap();
    Pair { a, b }
}

#[tokio::test]
async fn rpc_round_trip_between_two_peers() {
    let pair = pair(PeerOptions::default(), PeerOptions::default()).await;

    pair.b.serve_keys(
        &["echo"],
        Arc::new(|payload, ctx| {
            json!({
                "echoed": Value::Object(payload.clone()),
                "from": ctx.source,
            })
        }),
    );

    let reply = pair
        .a
        .request("b", "echo", json!({ "n": 7 }), 2000)
        .await
        .unwrap();
    assert_eq!(reply.get("echoed"), Some(&json!({ "n": 7 })));
    assert_eq!(reply.get("from"), Some(&json!("a")));

    pair.a.stop().await;
    pair.b.stop().await;
}

#[tokio::test]
async fn request_to_silent_peer_times_out() {
    let pair = pair(PeerOptions::default(), PeerOptions::default()).await;

    // b serves nothing under this key, so no response ever comes back.
    let err = pair
        .a
        .request("b", "missing", json!({}), 300)
        .await
        .unwrap_err();
    assert!(err.is_timeout());

    pair.a.stop().await;
    pair.b.stop().await;
}

#[tokio::test]
async fn publish_without_subscribers_counts_zero() {
    let pair = pair(PeerOptions::default(), PeerOptions::default()).await;

    let delivery = pair
        .a
        .publish("alerts.status", json!({ "level": "info" }))
        .await
        .unwrap();
    assert_eq!(delivery, Delivery::Counted(0));

    pair.a.stop().await;
    pair.b.stop().await;
}

#[tokio::test]
async fn subscription_routes_publishes_to_the_listener() {
    let pair = pair(PeerOptions::default(), PeerOptions::default()).await;

    let (tx, mut rx) = mpsc::unbounded_channel();
    pair.b.listen(
        "alerts.status",
        Arc::new(move |msg| {
            tx.send((msg.source.clone(), msg.payload.clone())).ok();
        }),
    );
    pair.b.subscribe(&["alerts.status"]).await;

    // The subscription travels as a broadcast; give a a moment to record it.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    let mut delivery = Delivery::Counted(0);
    while delivery == Delivery::Counted(0) && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(20)).await;
        delivery = pair
            .a
            .publish("alerts.status", json!({ "level": "warn" }))
            .await
            .unwrap();
    }
    assert_eq!(delivery, Delivery::Counted(1));

    let (source, payload) = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("timed out")
        .expect("channel closed");
    assert_eq!(source, "a");
    assert_eq!(payload.get("level"), Some(&json!("warn")));

    pair.a.stop().await;
    pair.b.stop().await;
}

#[tokio::test]
async fn discovery_spreads_keys_between_peers() {
    let discovering = || PeerOptions {
        discovery: true,
        discovery_interval: Duration::from_millis(100),
        ..PeerOptions::default()
    };
    let pair = pair(
        PeerOptions {
            keys: vec!["stats.get".to_string()],
            ..discovering()
        },
        discovering(),
    )
    .await;

    assert!(
        pair.b
            .wait_for_key("a", "stats.get", Duration::from_secs(3), None)
            .await
    );
    assert!(pair.b.wait_for_peer("a", Duration::from_secs(1), None).await);
    assert!(pair.b.knows_key("a", "stats.get"));
    assert!(!pair.b.knows_key("a", "stats.other"));

    pair.a.stop().await;
    pair.b.stop().await;
}
