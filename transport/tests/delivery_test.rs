//! Integration tests for the datagram path and its throttle.
//!
//! Two nodes on an in-memory network: duplicate suppression, retry budget
//! exhaustion, probing, endpoint changes, and the token bucket's
//! burst/refill contract.

mod common;

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::time::Instant;

use common::{introduce, wait_until, within, Inbox, Node};
use relaynet_transport::chat::MemoryHomeserver;
use relaynet_transport::clock::ManualClock;
use relaynet_transport::config::DatagramConfig;
use relaynet_transport::datagram::{codec, DatagramLink, Frame, MemoryNetwork};
use relaynet_transport::{
    DatagramTransport, HealthTracker, Message, MessageId, NodeStatus, TokenBucket, Transport,
    TransportError, TransportKind, TransportStats,
};

fn three_attempts() -> DatagramConfig {
    DatagramConfig {
        max_attempts: 3,
        retry_interval: Duration::from_secs(1),
        ..DatagramConfig::default()
    }
}

// ---------------------------------------------------------------------------
// Delivery
// ---------------------------------------------------------------------------

#[tokio::test]
async fn datagram_roundtrip_reports_delivery() {
    let net = MemoryNetwork::new();
    let hs = MemoryHomeserver::new(common::SERVER);
    let a = Node::build(1, &net, &hs, DatagramConfig::default());
    let b = Node::build(2, &net, &hs, DatagramConfig::default());
    introduce(&a, &b);
    a.start();
    b.start();

    let id = within(
        Duration::from_secs(5),
        a.datagram
            .send_payload(b.address, Bytes::from_static(b"secret reveal")),
    )
    .await
    .unwrap();

    common::wait_until(Duration::from_secs(5), || b.inbox.len() == 1).await;
    let got = &b.inbox.messages()[0];
    assert_eq!(got.id, id);
    assert_eq!(got.sender, a.address);
    assert_eq!(&got.payload[..], b"secret reveal");
    assert_eq!(got.via, TransportKind::Datagram);

    assert_eq!(a.datagram.in_flight(), 0);
    assert_eq!(a.stats.snapshot().delivered, 1);
    assert_eq!(
        a.health.path_status(&b.address, TransportKind::Datagram),
        NodeStatus::Connected
    );
}

#[tokio::test]
async fn repeated_delivery_of_one_id_reaches_upper_layer_once() {
    let net = MemoryNetwork::new();
    let hs = MemoryHomeserver::new(common::SERVER);
    let a = Node::build(1, &net, &hs, DatagramConfig::default());
    let b = Node::build(2, &net, &hs, DatagramConfig::default());
    introduce(&a, &b);
    a.start();
    b.start();

    // Every datagram arrives twice, and the sender repeats the message too.
    net.set_duplicate(true);
    let message = Message::new(b.address, vec![7u8; 32]);
    for _ in 0..4 {
        within(Duration::from_secs(5), a.datagram.send(message.clone()))
            .await
            .unwrap();
    }

    common::wait_until(Duration::from_secs(5), || b.stats.snapshot().duplicates >= 1).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(b.inbox.len(), 1);
    assert_eq!(b.inbox.messages()[0].id, message.id);
    assert_eq!(b.stats.snapshot().received, 1);
}

#[tokio::test(start_paused = true)]
async fn exhausted_retry_budget_fails_the_send() {
    let net = MemoryNetwork::new();
    let hs = MemoryHomeserver::new(common::SERVER);
    let a = Node::build(1, &net, &hs, three_attempts());
    let b = Node::build(2, &net, &hs, DatagramConfig::default());
    introduce(&a, &b);
    a.start();
    b.start();

    net.set_link_down(b.datagram.local_endpoint().unwrap(), true);
    let started = Instant::now();
    let err = a
        .datagram
        .send(Message::new(b.address, vec![1, 2, 3]))
        .await
        .unwrap_err();

    match err {
        TransportError::DeliveryFailed { attempts, .. } => assert_eq!(attempts, 3),
        other => panic!("unexpected error: {other}"),
    }
    assert!(started.elapsed() >= Duration::from_secs(2));
    assert_eq!(net.dropped(), 3);
    assert_eq!(b.inbox.len(), 0);
    assert_eq!(
        a.health.path_status(&b.address, TransportKind::Datagram),
        NodeStatus::Disconnected
    );
    assert_eq!(a.stats.snapshot().failed, 1);
}

#[tokio::test]
async fn stop_resolves_in_flight_sends_with_shutdown() {
    let net = MemoryNetwork::new();
    let hs = MemoryHomeserver::new(common::SERVER);
    let a = Node::build(1, &net, &hs, DatagramConfig::default());
    let b = Node::build(2, &net, &hs, DatagramConfig::default());
    introduce(&a, &b);
    a.start();
    net.set_link_down(b.datagram.local_endpoint().unwrap(), true);

    let sender = Arc::clone(&a.datagram);
    let dest = b.address;
    let pending = tokio::spawn(async move { sender.send(Message::new(dest, vec![0])).await });
    common::wait_until(Duration::from_secs(5), || a.datagram.in_flight() == 1).await;

    a.mixed.stop();
    let err = within(Duration::from_secs(5), pending).await.unwrap().unwrap_err();
    assert!(matches!(err, TransportError::Shutdown));
    assert_eq!(a.datagram.in_flight(), 0);
}

#[tokio::test]
async fn probe_is_answered_and_marks_peer_connected() {
    let net = MemoryNetwork::new();
    let hs = MemoryHomeserver::new(common::SERVER);
    let a = Node::build(1, &net, &hs, DatagramConfig::default());
    let b = Node::build(2, &net, &hs, DatagramConfig::default());
    introduce(&a, &b);
    a.start();
    b.start();

    within(Duration::from_secs(5), a.datagram.probe(b.address))
        .await
        .unwrap();
    assert_eq!(a.health.status(&b.address), NodeStatus::Connected);
    // Probes never reach the upper layer.
    assert_eq!(b.inbox.len(), 0);
}

// ---------------------------------------------------------------------------
// Endpoint changes
// ---------------------------------------------------------------------------

#[tokio::test]
async fn forged_sender_does_not_redirect_datagrams() {
    let net = MemoryNetwork::new();
    let hs = MemoryHomeserver::new(common::SERVER);
    let a = Node::build(1, &net, &hs, DatagramConfig::default());
    let b = Node::build(2, &net, &hs, DatagramConfig::default());
    introduce(&a, &b);
    a.start();
    b.start();
    let b_endpoint = b.datagram.local_endpoint().unwrap();

    let forger = net.bind();
    let forged = codec::encode(&Frame::Message {
        id: MessageId::new(),
        sender: b.address,
        payload: b"redirect me".to_vec(),
    })
    .unwrap();
    forger
        .send_to(&forged, a.datagram.local_endpoint().unwrap())
        .await
        .unwrap();

    let forger_endpoint = forger.local_addr().unwrap();
    wait_until(Duration::from_secs(5), || {
        a.datagram.discovery().candidate(&b.address) == Some(forger_endpoint)
    })
    .await;
    assert_eq!(a.datagram.discovery().get(&b.address), Some(b_endpoint));

    within(
        Duration::from_secs(5),
        a.datagram
            .send_payload(b.address, Bytes::from_static(b"genuine")),
    )
    .await
    .unwrap();
    wait_until(Duration::from_secs(5), || b.inbox.len() == 1).await;
    assert_eq!(&b.inbox.messages()[0].payload[..], b"genuine");
    assert_eq!(a.datagram.discovery().get(&b.address), Some(b_endpoint));
}

#[tokio::test]
async fn peer_on_new_endpoint_is_followed_once_it_answers() {
    let net = MemoryNetwork::new();
    let hs = MemoryHomeserver::new(common::SERVER);
    let a = Node::build(1, &net, &hs, DatagramConfig::default());
    let b = Node::build(2, &net, &hs, DatagramConfig::default());
    introduce(&a, &b);
    a.start();

    // b restarts behind a different endpoint.
    let moved = Arc::new(DatagramTransport::new(
        b.address,
        net.bind(),
        DatagramConfig::default(),
        Arc::new(HealthTracker::default()),
        Arc::new(TransportStats::new()),
    ));
    moved
        .discovery()
        .insert(a.address, a.datagram.local_endpoint().unwrap());
    let inbox = Inbox::default();
    inbox.install(moved.as_ref());
    Arc::clone(&moved).start().unwrap();

    within(
        Duration::from_secs(5),
        moved.send_payload(a.address, Bytes::from_static(b"new endpoint")),
    )
    .await
    .unwrap();
    let new_endpoint = moved.local_endpoint().unwrap();
    wait_until(Duration::from_secs(5), || {
        a.datagram.discovery().get(&b.address) == Some(new_endpoint)
    })
    .await;
    assert_eq!(a.datagram.discovery().candidate(&b.address), None);

    within(
        Duration::from_secs(5),
        a.datagram
            .send_payload(b.address, Bytes::from_static(b"found you")),
    )
    .await
    .unwrap();
    wait_until(Duration::from_secs(5), || inbox.len() == 1).await;
    moved.stop();
}

// ---------------------------------------------------------------------------
// Throttle
// ---------------------------------------------------------------------------

#[test]
fn burst_of_ten_then_refusal_then_refill() {
    let clock = Arc::new(ManualClock::new());
    let bucket = TokenBucket::with_clock(10.0, 1.0, clock.clone());

    for i in 0..10 {
        assert!(bucket.consume(1.0), "consume {i} should succeed");
    }
    assert!(!bucket.consume(1.0));
    assert!(bucket.available() >= 0.0);

    clock.advance(Duration::from_secs(1));
    assert!(bucket.consume(1.0));
    assert!(!bucket.consume(1.0));
}

#[test]
fn tokens_stay_within_bounds_over_a_mixed_sequence() {
    let clock = Arc::new(ManualClock::new());
    let bucket = TokenBucket::with_clock(10.0, 1.0, clock.clone());

    let steps: [(u64, f64); 8] = [
        (0, 4.0),
        (0, 7.0),
        (3, 2.5),
        (100, 0.0),
        (0, 10.0),
        (0, 0.5),
        (2, 3.0),
        (1, 1.0),
    ];
    for (advance, n) in steps {
        clock.advance(Duration::from_secs(advance));
        let before = bucket.available();
        let ok = bucket.consume(n);
        assert_eq!(ok, before >= n, "consume({n}) with {before} available");
        let after = bucket.available();
        assert!((0.0..=10.0).contains(&after), "balance {after} out of bounds");
    }
}
