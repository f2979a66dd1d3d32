//! # Chat Transport
//!
//! Carries protocol messages as `protocol.message` timeline events in one
//! private room per peer pair.
//!
//! ## Rooms
//!
//! The room for peers `a` and `b` has the alias
//! `#relaynet_<blake3(min(a,b) ‖ max(a,b))[..16]>:<server>`, so both sides
//! derive the same alias independently. The first sender creates it and
//! invites the other; if both race, the loser's create fails with
//! `RoomInUse` and it joins the winner's room through the alias.
//!
//! ## Handshake
//!
//! A member only sees timeline events from its own join onwards, and the
//! sync batch carrying that join is skipped whole. A room is therefore not
//! used for protocol messages until the peer has shown it can see it:
//!
//! 1. The joining side repeats `protocol.ready {"seen": false}` every
//!    [`READY_ANNOUNCE_INTERVAL`].
//! 2. Any `protocol.ready` a node receives proves its own sync is past its
//!    join. It answers a `seen: false` with `seen: true`, and sends
//!    `seen: true` once on the first `seen: true` it receives.
//! 3. A `seen: true` from the peer marks the room ready for sending.
//!
//! [`ChatTransport::open_room`] waits for step 3, bounded by
//! `ChatConfig::join_timeout`.
//!
//! ## Event content
//!
//! ```json
//! {"id": "<uuid>", "sender": "0x<address>", "payload": "<hex>"}
//! ```
//!
//! Outbound publish is one backend request. A failure is returned to the
//! caller as-is; retrying is the caller's decision.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::RwLock;
use serde_json::{Map, Value};
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use super::backend::{BackendError, ChatBackend, Presence};
use super::event::Event;
use super::room::RoomStore;
use super::sync_loop::{SyncLoop, SyncState};
use super::syncer::DefaultSyncer;
use crate::config::{
    ChatConfig, MEMBER_EVENT, PRESENCE_EVENT, PROTOCOL_MESSAGE_EVENT, READY_ANNOUNCE_INTERVAL,
    READY_EVENT, ROOM_ALIAS_PREFIX, SEEN_CACHE_SIZE, SEEN_CACHE_TTL,
};
use crate::dedup::SeenCache;
use crate::error::TransportError;
use crate::health::{HealthTracker, NodeStatus};
use crate::message::{InboundMessage, Message, MessageHandler, MessageId, PeerAddress};
use crate::stats::TransportStats;
use crate::transport::{Transport, TransportKind};

/// `@<hex address>:<server>`
pub fn user_id_for(address: &PeerAddress, server_name: &str) -> String {
    format!("@{}:{}", address.to_hex(), server_name)
}

/// Inverse of [`user_id_for`]. `None` for users that are not nodes.
pub fn address_from_user_id(user_id: &str) -> Option<PeerAddress> {
    let localpart = user_id.strip_prefix('@')?.split(':').next()?;
    localpart.parse().ok()
}

/// Alias localpart of the room shared by `a` and `b`. Symmetric.
pub fn room_alias_localpart(a: &PeerAddress, b: &PeerAddress) -> String {
    let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
    let mut hasher = blake3::Hasher::new();
    hasher.update(&lo.0);
    hasher.update(&hi.0);
    let hash = hasher.finalize();
    format!("{}{}", ROOM_ALIAS_PREFIX, hex::encode(&hash.as_bytes()[..16]))
}

/// Decoded `protocol.message` content.
#[derive(Debug, PartialEq, Eq)]
struct WireMessage {
    id: MessageId,
    payload: Vec<u8>,
}

#[derive(Debug, thiserror::Error)]
enum ContentError {
    #[error("missing field {0}")]
    Missing(&'static str),
    #[error("bad message id: {0}")]
    Id(#[from] uuid::Error),
    #[error("bad payload hex: {0}")]
    Payload(#[from] hex::FromHexError),
}

fn encode_content(local: &PeerAddress, message: &Message) -> Map<String, Value> {
    let mut content = Map::new();
    content.insert("id".into(), Value::from(message.id.to_string()));
    content.insert("sender".into(), Value::from(local.to_string()));
    content.insert("payload".into(), Value::from(hex::encode(&message.payload)));
    content
}

fn decode_content(event: &Event) -> Result<WireMessage, ContentError> {
    let id = event
        .content_str("id")
        .ok_or(ContentError::Missing("id"))?
        .parse::<MessageId>()?;
    let payload = hex::decode(
        event
            .content_str("payload")
            .ok_or(ContentError::Missing("payload"))?,
    )?;
    Ok(WireMessage { id, payload })
}

fn ready_content(seen: bool) -> Map<String, Value> {
    let mut content = Map::new();
    content.insert("seen".into(), Value::from(seen));
    content
}

/// Handshake progress in one room.
struct Handshake {
    /// Flips to true on the peer's `seen: true`.
    peer_ready: watch::Sender<bool>,
    announcing: AtomicBool,
    /// Set once this node has sent `seen: true`.
    confirmed: AtomicBool,
}

impl Handshake {
    fn new() -> Self {
        let (peer_ready, _) = watch::channel(false);
        Self {
            peer_ready,
            announcing: AtomicBool::new(false),
            confirmed: AtomicBool::new(false),
        }
    }
}

pub struct ChatTransport {
    local: PeerAddress,
    config: ChatConfig,
    backend: Arc<dyn ChatBackend>,
    syncer: Arc<DefaultSyncer>,
    sync_loop: Arc<SyncLoop>,
    /// peer → room id
    rooms: DashMap<PeerAddress, String>,
    /// room id → handshake
    handshakes: DashMap<String, Arc<Handshake>>,
    seen: SeenCache,
    health: Arc<HealthTracker>,
    stats: Arc<TransportStats>,
    handler: RwLock<Option<Arc<dyn MessageHandler>>>,
    shutdown: watch::Sender<bool>,
    started: AtomicBool,
}

impl ChatTransport {
    /// Builds the transport and registers its event listeners. The backend
    /// must be logged in as this node's user.
    pub fn new(
        local: PeerAddress,
        backend: Arc<dyn ChatBackend>,
        store: Arc<dyn RoomStore>,
        config: ChatConfig,
        health: Arc<HealthTracker>,
        stats: Arc<TransportStats>,
    ) -> Arc<Self> {
        let expected = user_id_for(&local, &config.server_name);
        if backend.user_id() != expected {
            warn!(
                backend_user = %backend.user_id(),
                %expected,
                "chat backend user does not match node address"
            );
        }

        let syncer = Arc::new(DefaultSyncer::new(backend.user_id(), Arc::clone(&store)));
        let sync_loop = Arc::new(SyncLoop::new(
            Arc::clone(&backend),
            syncer.clone(),
            store,
            Arc::clone(&stats),
            config.long_poll_timeout,
        ));
        let (shutdown, _) = watch::channel(false);

        Arc::new_cyclic(|weak: &Weak<Self>| {
            register_listeners(&syncer, weak);
            Self {
                local,
                config,
                backend,
                syncer,
                sync_loop,
                rooms: DashMap::new(),
                handshakes: DashMap::new(),
                seen: SeenCache::new(SEEN_CACHE_SIZE, SEEN_CACHE_TTL),
                health,
                stats,
                handler: RwLock::new(None),
                shutdown,
                started: AtomicBool::new(false),
            }
        })
    }

    pub fn user_id(&self) -> &str {
        self.backend.user_id()
    }

    pub fn local_address(&self) -> PeerAddress {
        self.local
    }

    /// For registering additional listeners.
    pub fn syncer(&self) -> &Arc<DefaultSyncer> {
        &self.syncer
    }

    pub fn sync_state(&self) -> SyncState {
        self.sync_loop.state()
    }

    pub fn sync_loop(&self) -> &Arc<SyncLoop> {
        &self.sync_loop
    }

    /// Room currently used for `peer`, if known.
    pub fn room_for(&self, peer: &PeerAddress) -> Option<String> {
        self.rooms.get(peer).map(|r| r.clone())
    }

    /// Whether the peer has completed the handshake in the room shared
    /// with it.
    pub fn is_room_ready(&self, peer: &PeerAddress) -> bool {
        self.room_for(peer).is_some_and(|room| self.room_ready(&room))
    }

    fn room_ready(&self, room_id: &str) -> bool {
        self.handshakes
            .get(room_id)
            .is_some_and(|h| *h.peer_ready.borrow())
    }

    fn handshake(&self, room_id: &str) -> Arc<Handshake> {
        self.handshakes
            .entry(room_id.to_string())
            .or_insert_with(|| Arc::new(Handshake::new()))
            .clone()
    }

    fn is_running(&self) -> bool {
        self.started.load(Ordering::Acquire) && !*self.shutdown.borrow()
    }

    /// Finds or creates the room shared with `peer`, makes sure this node
    /// is joined, and waits until the peer has completed the handshake.
    /// Fails with [`BackendError::PeerNotJoined`] if that takes longer than
    /// `join_timeout`.
    pub async fn open_room(&self, peer: PeerAddress) -> Result<String, BackendError> {
        if let Some(room) = self.room_for(&peer) {
            if self.room_ready(&room) {
                return Ok(room);
            }
        }

        let localpart = room_alias_localpart(&self.local, &peer);
        let alias = format!("#{}:{}", localpart, self.config.server_name);
        let (room_id, joined) = match self.backend.resolve_alias(&alias).await? {
            Some(id) => (self.backend.join_room(&id).await?, true),
            None => {
                let invite = [user_id_for(&peer, &self.config.server_name)];
                match self.backend.create_room(&localpart, &invite).await {
                    Ok(id) => {
                        info!(peer = %peer, room = %id, "chat room created");
                        (id, false)
                    }
                    Err(BackendError::RoomInUse) => {
                        debug!(peer = %peer, %alias, "lost room creation race, joining");
                        (self.backend.join_room(&alias).await?, true)
                    }
                    Err(e) => return Err(e),
                }
            }
        };
        self.rooms.insert(peer, room_id.clone());

        // The invitee announces from its invite handler.
        if joined {
            self.announce(&room_id).await;
        }
        self.await_peer(&room_id).await?;
        Ok(room_id)
    }

    async fn await_peer(&self, room_id: &str) -> Result<(), BackendError> {
        let mut ready = self.handshake(room_id).peer_ready.subscribe();
        let joined = tokio::time::timeout(self.config.join_timeout, ready.wait_for(|r| *r))
            .await
            .is_ok_and(|r| r.is_ok());
        if joined {
            Ok(())
        } else {
            warn!(
                room = %room_id,
                timeout = ?self.config.join_timeout,
                "peer did not complete room handshake"
            );
            Err(BackendError::PeerNotJoined(room_id.to_string()))
        }
    }

    /// Repeats `seen: false` in `room_id` until the peer answers with
    /// `seen: true`, the join timeout passes, or the transport stops.
    async fn announce(&self, room_id: &str) {
        let handshake = self.handshake(room_id);
        if handshake.announcing.swap(true, Ordering::AcqRel) {
            return;
        }
        let mut ready = handshake.peer_ready.subscribe();
        let mut shutdown = self.shutdown.subscribe();
        let give_up = Instant::now() + self.config.join_timeout;

        while !*ready.borrow() && !*shutdown.borrow() && Instant::now() < give_up {
            self.publish_ready(room_id, false).await;
            let next = (Instant::now() + READY_ANNOUNCE_INTERVAL).min(give_up);
            tokio::select! {
                _ = ready.changed() => {}
                _ = shutdown.changed() => {}
                _ = tokio::time::sleep_until(next) => {}
            }
        }
        handshake.announcing.store(false, Ordering::Release);
    }

    async fn publish_ready(&self, room_id: &str, seen: bool) {
        let txn = uuid::Uuid::new_v4().to_string();
        match self
            .backend
            .send_event(room_id, READY_EVENT, &ready_content(seen), &txn)
            .await
        {
            Ok(_) => trace!(room = %room_id, seen, "ready published"),
            Err(e) => debug!(room = %room_id, seen, error = %e, "ready publish failed"),
        }
    }

    // -----------------------------------------------------------------------
    // Listeners
    // -----------------------------------------------------------------------

    fn on_protocol_message(&self, event: &Event) {
        if event.sender == self.user_id() {
            return;
        }
        let Some(sender) = address_from_user_id(&event.sender) else {
            self.stats.record_malformed();
            debug!(sender = %event.sender, "protocol message from non-node user ignored");
            return;
        };
        let wire = match decode_content(event) {
            Ok(w) => w,
            Err(e) => {
                self.stats.record_malformed();
                debug!(peer = %sender, error = %e, "malformed protocol message dropped");
                return;
            }
        };

        if let Some(room_id) = &event.room_id {
            self.rooms.entry(sender).or_insert_with(|| room_id.clone());
            // Peers only publish after their own handshake completed.
            self.handshake(room_id).peer_ready.send_replace(true);
        }
        self.health.record_success(sender, TransportKind::Chat);

        if !self.seen.insert(wire.id) {
            self.stats.record_duplicate();
            trace!(peer = %sender, id = %wire.id, "duplicate chat message");
            return;
        }
        self.stats.record_received();
        let handler = self.handler.read().clone();
        match handler {
            Some(h) => h.on_message(InboundMessage {
                id: wire.id,
                sender,
                payload: Bytes::from(wire.payload),
                via: TransportKind::Chat,
            }),
            None => debug!(id = %wire.id, "no handler installed, message dropped"),
        }
    }

    fn on_member(self: Arc<Self>, event: &Event) {
        if event.state_key.as_deref() != Some(self.user_id()) || event.membership() != Some("invite")
        {
            return;
        }
        let Some(room_id) = event.room_id.clone() else {
            return;
        };
        if let Some(inviter) = address_from_user_id(&event.sender) {
            self.rooms.entry(inviter).or_insert_with(|| room_id.clone());
        }
        if !self.config.auto_join || !self.is_running() {
            return;
        }

        // Joining is a backend round trip; never on the sync worker.
        tokio::spawn(async move {
            match self.backend.join_room(&room_id).await {
                Ok(_) => {
                    info!(room = %room_id, "joined invited room");
                    self.announce(&room_id).await;
                }
                Err(e) => warn!(room = %room_id, error = %e, "auto-join failed"),
            }
        });
    }

    fn on_ready(self: Arc<Self>, event: &Event) {
        if event.sender == self.user_id() {
            return;
        }
        let Some(peer) = address_from_user_id(&event.sender) else {
            return;
        };
        let Some(room_id) = event.room_id.clone() else {
            return;
        };
        let seen = event
            .content
            .get("seen")
            .and_then(Value::as_bool)
            .unwrap_or(false);

        self.rooms.insert(peer, room_id.clone());
        let handshake = self.handshake(&room_id);
        if seen && !handshake.peer_ready.send_replace(true) {
            info!(peer = %peer, room = %room_id, "chat room ready");
        }

        let first_confirm = !handshake.confirmed.swap(true, Ordering::AcqRel);
        if (!seen || first_confirm) && self.is_running() {
            tokio::spawn(async move {
                self.publish_ready(&room_id, true).await;
            });
        }
    }

    fn on_presence(&self, event: &Event) {
        if event.sender == self.user_id() {
            return;
        }
        let Some(peer) = address_from_user_id(&event.sender) else {
            return;
        };
        let status = match event.content_str("presence").and_then(Presence::parse) {
            Some(Presence::Online) => NodeStatus::Connected,
            Some(Presence::Offline) | Some(Presence::Unavailable) => NodeStatus::Disconnected,
            None => return,
        };
        self.health.record(peer, TransportKind::Chat, status);
    }

    fn publish_presence(self: &Arc<Self>, presence: Presence) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let this = Arc::clone(self);
        handle.spawn(async move {
            if let Err(e) = this.backend.set_presence(presence).await {
                debug!(%presence, error = %e, "presence update failed");
            }
        });
    }
}

fn register_listeners(syncer: &DefaultSyncer, weak: &Weak<ChatTransport>) {
    let w = weak.clone();
    syncer.on_event_type(PROTOCOL_MESSAGE_EVENT, move |e: &Event| {
        if let Some(t) = w.upgrade() {
            t.on_protocol_message(e);
        }
    });
    let w = weak.clone();
    syncer.on_event_type(MEMBER_EVENT, move |e: &Event| {
        if let Some(t) = w.upgrade() {
            t.on_member(e);
        }
    });
    let w = weak.clone();
    syncer.on_event_type(READY_EVENT, move |e: &Event| {
        if let Some(t) = w.upgrade() {
            t.on_ready(e);
        }
    });
    let w = weak.clone();
    syncer.on_event_type(PRESENCE_EVENT, move |e: &Event| {
        if let Some(t) = w.upgrade() {
            t.on_presence(e);
        }
    });
}

#[async_trait]
impl Transport for ChatTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Chat
    }

    fn start(self: Arc<Self>) -> Result<(), TransportError> {
        if *self.shutdown.borrow() {
            return Err(TransportError::Shutdown);
        }
        if self.started.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        info!(user = %self.user_id(), server = %self.config.server_name, "chat transport starting");
        tokio::spawn(Arc::clone(&self.sync_loop).run(self.shutdown.subscribe()));
        self.publish_presence(Presence::Online);
        Ok(())
    }

    async fn send(&self, message: Message) -> Result<(), TransportError> {
        if !self.is_running() {
            return Err(TransportError::Shutdown);
        }
        let result = async {
            let room = self.open_room(message.destination).await?;
            let content = encode_content(&self.local, &message);
            self.backend
                .send_event(&room, PROTOCOL_MESSAGE_EVENT, &content, &message.id.to_string())
                .await
        }
        .await;

        match result {
            Ok(event_id) => {
                self.stats.record_sent();
                self.stats.record_delivered();
                trace!(peer = %message.destination, id = %message.id, %event_id, "published");
                Ok(())
            }
            Err(e) => {
                self.stats.record_failed();
                warn!(peer = %message.destination, id = %message.id, error = %e, "chat publish failed");
                Err(TransportError::Backend(e.to_string()))
            }
        }
    }

    fn set_handler(&self, handler: Arc<dyn MessageHandler>) {
        *self.handler.write() = Some(handler);
    }

    fn stop(&self) {
        if self.shutdown.send_replace(true) {
            return;
        }
        info!(user = %self.user_id(), "chat transport stopped");
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let backend = Arc::clone(&self.backend);
            handle.spawn(async move {
                let _ = backend.set_presence(Presence::Offline).await;
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_ids_roundtrip() {
        let addr = PeerAddress([0x1f; 20]);
        let uid = user_id_for(&addr, "hs.example");
        assert_eq!(uid, format!("@{}:hs.example", "1f".repeat(20)));
        assert_eq!(address_from_user_id(&uid), Some(addr));
        assert_eq!(address_from_user_id("@alice:hs.example"), None);
        assert_eq!(address_from_user_id("nobody"), None);
    }

    #[test]
    fn alias_is_symmetric_and_pair_specific() {
        let a = PeerAddress([1; 20]);
        let b = PeerAddress([2; 20]);
        let c = PeerAddress([3; 20]);
        let ab = room_alias_localpart(&a, &b);
        assert_eq!(ab, room_alias_localpart(&b, &a));
        assert_ne!(ab, room_alias_localpart(&a, &c));
        assert!(ab.starts_with(ROOM_ALIAS_PREFIX));
        assert_eq!(ab.len(), ROOM_ALIAS_PREFIX.len() + 32);
    }

    #[test]
    fn content_roundtrip_and_rejects() {
        let local = PeerAddress([9; 20]);
        let msg = Message::new(PeerAddress([8; 20]), vec![0xde, 0xad]);
        let mut event = Event::new(PROTOCOL_MESSAGE_EVENT, "@x:hs");
        event.content = encode_content(&local, &msg);
        assert_eq!(
            decode_content(&event).unwrap(),
            WireMessage {
                id: msg.id,
                payload: vec![0xde, 0xad]
            }
        );

        let missing = Event::new(PROTOCOL_MESSAGE_EVENT, "@x:hs").with_content("id", "abc123");
        assert!(matches!(
            decode_content(&missing),
            Err(ContentError::Id(_))
        ));
        let bad_hex = Event::new(PROTOCOL_MESSAGE_EVENT, "@x:hs")
            .with_content("id", msg.id.to_string())
            .with_content("payload", "zz");
        assert!(matches!(
            decode_content(&bad_hex),
            Err(ContentError::Payload(_))
        ));
    }
}
