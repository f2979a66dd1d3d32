//! Shared fixtures for the integration tests: two-node setups over the
//! in-memory datagram network and the in-memory homeserver.

#![allow(dead_code)]

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use relaynet_transport::chat::{
    user_id_for, ChatBackend, ChatTransport, MemoryHomeserver, MemoryRoomStore,
};
use relaynet_transport::config::{ChatConfig, DatagramConfig, MixedConfig};
use relaynet_transport::datagram::MemoryNetwork;
use relaynet_transport::{
    DatagramTransport, HealthTracker, InboundMessage, MixedTransport, PeerAddress, Transport,
    TransportStats,
};

pub const SERVER: &str = "hs.test";

pub fn addr(b: u8) -> PeerAddress {
    PeerAddress([b; 20])
}

/// Collects every inbound message a transport hands up.
#[derive(Clone, Default)]
pub struct Inbox(pub Arc<Mutex<Vec<InboundMessage>>>);

impl Inbox {
    pub fn install(&self, transport: &dyn Transport) {
        let sink = Arc::clone(&self.0);
        transport.set_handler(Arc::new(move |m: InboundMessage| sink.lock().push(m)));
    }

    pub fn len(&self) -> usize {
        self.0.lock().len()
    }

    pub fn messages(&self) -> Vec<InboundMessage> {
        self.0.lock().clone()
    }
}

/// Polls `check` every 10ms until it holds. Panics after `limit`.
pub async fn wait_until<F: FnMut() -> bool>(limit: Duration, mut check: F) {
    let deadline = tokio::time::Instant::now() + limit;
    while !check() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not reached within {limit:?}"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

pub async fn within<T>(limit: Duration, fut: impl Future<Output = T>) -> T {
    tokio::time::timeout(limit, fut)
        .await
        .expect("future did not complete in time")
}

pub struct Node {
    pub address: PeerAddress,
    pub health: Arc<HealthTracker>,
    pub stats: Arc<TransportStats>,
    pub datagram: Arc<DatagramTransport>,
    pub chat: Arc<ChatTransport>,
    pub mixed: Arc<MixedTransport>,
    pub inbox: Inbox,
}

impl Node {
    pub fn build(
        who: u8,
        net: &Arc<MemoryNetwork>,
        hs: &Arc<MemoryHomeserver>,
        datagram_config: DatagramConfig,
    ) -> Self {
        let address = addr(who);
        let health = Arc::new(HealthTracker::default());
        let stats = Arc::new(TransportStats::new());
        let datagram = Arc::new(DatagramTransport::new(
            address,
            net.bind(),
            datagram_config,
            Arc::clone(&health),
            Arc::clone(&stats),
        ));
        let backend: Arc<dyn ChatBackend> = hs.login(user_id_for(&address, SERVER));
        let mut chat_config = ChatConfig::new(SERVER);
        chat_config.long_poll_timeout = Duration::from_secs(1);
        let chat = ChatTransport::new(
            address,
            backend,
            Arc::new(MemoryRoomStore::new()),
            chat_config,
            Arc::clone(&health),
            Arc::clone(&stats),
        );
        let mixed = MixedTransport::new(
            Arc::clone(&datagram),
            Arc::clone(&chat),
            Arc::clone(&health),
            Arc::clone(&stats),
            MixedConfig::default(),
        );
        let inbox = Inbox::default();
        inbox.install(mixed.as_ref());
        Self {
            address,
            health,
            stats,
            datagram,
            chat,
            mixed,
            inbox,
        }
    }

    pub fn start(&self) {
        Arc::clone(&self.mixed).start().unwrap();
    }

    pub fn user_id(&self) -> String {
        user_id_for(&self.address, SERVER)
    }
}

/// Makes each node's datagram endpoint known to the other.
pub fn introduce(a: &Node, b: &Node) {
    a.datagram
        .discovery()
        .insert(b.address, b.datagram.local_endpoint().unwrap());
    b.datagram
        .discovery()
        .insert(a.address, a.datagram.local_endpoint().unwrap());
}

/// Waits until every node's sync loop has finished its baseline round.
/// Anything the homeserver holds before that is never dispatched.
pub async fn wait_for_baseline(nodes: &[&Node]) {
    wait_until(Duration::from_secs(10), || {
        nodes
            .iter()
            .all(|n| !n.chat.sync_loop().since().is_empty())
    })
    .await;
}

/// Opens the chat room between `a` and `b`. `open_room` returns once `b`
/// has completed the room handshake, so timeline events from then on
/// reach both sides.
pub async fn establish_chat_room(hs: &Arc<MemoryHomeserver>, a: &Node, b: &Node) -> String {
    wait_for_baseline(&[a, b]).await;
    let room = a.chat.open_room(b.address).await.unwrap();
    assert!(hs.is_joined(&room, &b.user_id()));
    assert!(a.chat.is_room_ready(&b.address));
    room
}
