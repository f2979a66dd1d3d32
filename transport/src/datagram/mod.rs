//! # Datagram Transport
//!
//! Best-effort, rate-limited delivery of single-datagram frames with ack and
//! bounded retry.
//!
//! ## Workers
//!
//! Two tasks per transport, both stopped by one `watch` channel:
//!
//! - **sender**: polls the [`RetryQueue`] and puts due frames on the wire.
//!   Sleeps until the queue's next wake time or until a new send nudges it.
//! - **receiver**: reads the link, decodes, dedups, answers acks/pongs and
//!   hands fresh messages to the upper layer. Malformed or oversized
//!   datagrams are dropped; a panic while handling one frame is caught and
//!   logged and the loop keeps going.
//!
//! Inbound frames never redirect a peer on their own: see [`Discovery`].
//! A frame from an unexpected endpoint triggers a `Ping` there, and only
//! the answering `Pong` moves the peer.
//!
//! Acks and pongs bypass the throttle: a node that is rate-limiting its own
//! traffic must still confirm what it received, or its peers would retry
//! into the same congestion.

pub mod codec;
pub mod discovery;
pub mod link;
pub mod retry;

use std::net::SocketAddr;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use tokio::net::UdpSocket;
use tokio::sync::{watch, Notify};
use tracing::{debug, error, info, trace, warn};

use crate::clock::{system_clock, SharedClock};
use crate::config::{DatagramConfig, SEEN_CACHE_TTL, UDP_MAX_MESSAGE_SIZE};
use crate::dedup::SeenCache;
use crate::error::{panic_message, CodecError, TransportError};
use crate::health::HealthTracker;
use crate::message::{InboundMessage, Message, MessageHandler, MessageId, PeerAddress};
use crate::ratelimit::TokenBucket;
use crate::stats::TransportStats;
use crate::transport::{Transport, TransportKind};

pub use codec::Frame;
pub use discovery::{Discovery, Sighting};
pub use link::{DatagramLink, MemoryLink, MemoryNetwork};
pub use retry::{EntryKind, Pending, RetryQueue};

/// Pause after a failed socket read before reading again.
const RECV_ERROR_BACKOFF: Duration = Duration::from_millis(50);

pub struct DatagramTransport {
    local: PeerAddress,
    link: Arc<dyn DatagramLink>,
    config: DatagramConfig,
    queue: RetryQueue,
    limiter: TokenBucket,
    seen: SeenCache,
    discovery: Discovery,
    health: Arc<HealthTracker>,
    stats: Arc<TransportStats>,
    handler: RwLock<Option<Arc<dyn MessageHandler>>>,
    clock: SharedClock,
    max_payload: usize,
    wake: Notify,
    shutdown: watch::Sender<bool>,
    started: AtomicBool,
}

impl DatagramTransport {
    pub fn new(
        local: PeerAddress,
        link: Arc<dyn DatagramLink>,
        config: DatagramConfig,
        health: Arc<HealthTracker>,
        stats: Arc<TransportStats>,
    ) -> Self {
        Self::with_clock(local, link, config, health, stats, system_clock())
    }

    pub fn with_clock(
        local: PeerAddress,
        link: Arc<dyn DatagramLink>,
        config: DatagramConfig,
        health: Arc<HealthTracker>,
        stats: Arc<TransportStats>,
        clock: SharedClock,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            local,
            link,
            queue: RetryQueue::new(config.max_attempts, config.retry_interval),
            limiter: TokenBucket::with_clock(
                config.throttle_capacity,
                config.throttle_fill_rate,
                clock.clone(),
            ),
            seen: SeenCache::with_clock(config.seen_cache_size, SEEN_CACHE_TTL, clock.clone()),
            discovery: Discovery::new(),
            health,
            stats,
            handler: RwLock::new(None),
            clock,
            max_payload: codec::max_payload_len(),
            wake: Notify::new(),
            shutdown,
            started: AtomicBool::new(false),
            config,
        }
    }

    /// Binds a UDP socket at `addr` and builds a transport on it.
    pub async fn bind(
        local: PeerAddress,
        addr: SocketAddr,
        config: DatagramConfig,
        health: Arc<HealthTracker>,
        stats: Arc<TransportStats>,
    ) -> Result<Self, TransportError> {
        let socket = UdpSocket::bind(addr).await?;
        info!(addr = %socket.local_addr()?, "datagram socket bound");
        Ok(Self::new(local, Arc::new(socket), config, health, stats))
    }

    pub fn local_address(&self) -> PeerAddress {
        self.local
    }

    pub fn local_endpoint(&self) -> std::io::Result<SocketAddr> {
        self.link.local_addr()
    }

    pub fn discovery(&self) -> &Discovery {
        &self.discovery
    }

    pub fn config(&self) -> &DatagramConfig {
        &self.config
    }

    /// Frames waiting for confirmation.
    pub fn in_flight(&self) -> usize {
        self.queue.len()
    }

    /// Whether a payload of `len` bytes fits in one frame.
    pub fn can_carry(&self, len: usize) -> bool {
        len <= self.max_payload
    }

    /// Whether this path could take a message to `peer` right now.
    pub fn has_route(&self, peer: &PeerAddress) -> bool {
        self.discovery.get(peer).is_some()
    }

    fn is_stopped(&self) -> bool {
        *self.shutdown.borrow()
    }

    fn is_running(&self) -> bool {
        self.started.load(Ordering::Acquire) && !self.is_stopped()
    }

    /// Queues a frame and waits for its confirmation.
    async fn enqueue_and_wait(
        &self,
        id: MessageId,
        peer: PeerAddress,
        kind: EntryKind,
        frame: Vec<u8>,
        endpoint: SocketAddr,
    ) -> Result<(), TransportError> {
        let now = self.clock.now();
        let rx = self.queue.enqueue(
            Pending {
                id,
                peer,
                kind,
                frame,
                endpoint,
                deadline: now + self.config.delivery_deadline,
            },
            now,
        );
        // stop() may have drained the queue between the running check and
        // the enqueue above.
        if self.is_stopped() {
            self.queue.drain_all();
        }
        self.wake.notify_one();

        match rx.await {
            Ok(result) => result,
            Err(_) => Err(TransportError::Shutdown),
        }
    }

    /// Sends a `Ping` to `peer` through the retry machinery. Resolves when
    /// the `Pong` arrives; the outcome is also reported to the health
    /// tracker.
    pub async fn probe(&self, peer: PeerAddress) -> Result<(), TransportError> {
        if !self.is_running() {
            return Err(TransportError::Shutdown);
        }
        let endpoint = self
            .discovery
            .get(&peer)
            .ok_or(TransportError::UnknownPeer(peer))?;
        let id = MessageId::new();
        let frame = codec::encode(&Frame::Ping {
            id,
            sender: self.local,
        })?;
        trace!(peer = %peer, id = %id, "probing");
        self.enqueue_and_wait(id, peer, EntryKind::Probe, frame, endpoint)
            .await
    }

    // -----------------------------------------------------------------------
    // Workers
    // -----------------------------------------------------------------------

    async fn run_sender(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        debug!("datagram sender started");
        loop {
            let outcome = self.queue.poll_due(self.clock.now(), &self.limiter);

            for tx in outcome.transmissions {
                match self.link.send_to(&tx.frame, tx.endpoint).await {
                    Ok(_) => {
                        self.stats.record_sent();
                        trace!(
                            peer = %tx.peer,
                            id = %tx.id,
                            attempt = tx.attempt,
                            endpoint = %tx.endpoint,
                            "frame transmitted"
                        );
                    }
                    // The attempt still counts; the retry timer covers it.
                    Err(e) => debug!(peer = %tx.peer, id = %tx.id, error = %e, "send_to failed"),
                }
            }

            for expired in outcome.expired {
                let peer = expired.entry.peer;
                match expired.entry.kind {
                    EntryKind::Message => {
                        warn!(
                            peer = %peer,
                            id = %expired.entry.id,
                            attempts = expired.entry.attempts,
                            error = %expired.error,
                            "datagram delivery failed"
                        );
                        self.health.record_failure(peer, TransportKind::Datagram);
                    }
                    EntryKind::Probe => {
                        debug!(peer = %peer, error = %expired.error, "probe unanswered");
                        self.health.record_failure(peer, TransportKind::Datagram);
                    }
                    EntryKind::Verify => {
                        self.discovery.reject(&peer, expired.entry.endpoint);
                    }
                }
                expired.resolve();
            }

            let next_wake = outcome.next_wake;
            tokio::select! {
                _ = async {
                    match next_wake {
                        Some(at) => tokio::time::sleep_until(at).await,
                        None => std::future::pending::<()>().await,
                    }
                } => {}
                _ = self.wake.notified() => {}
                res = shutdown.changed() => {
                    if res.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        let abandoned = self.queue.drain_all();
        debug!(abandoned, "datagram sender stopped");
    }

    async fn run_receiver(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        debug!("datagram receiver started");
        // One spare byte so an oversized datagram shows up as len > MAX
        // instead of being silently truncated to MAX.
        let mut buf = vec![0u8; UDP_MAX_MESSAGE_SIZE + 1];

        loop {
            let (n, from) = tokio::select! {
                res = self.link.recv_from(&mut buf) => match res {
                    Ok(v) => v,
                    Err(e) => {
                        debug!(error = %e, "recv_from failed");
                        tokio::time::sleep(RECV_ERROR_BACKOFF).await;
                        continue;
                    }
                },
                res = shutdown.changed() => {
                    if res.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            };

            if n > UDP_MAX_MESSAGE_SIZE {
                self.stats.record_malformed();
                debug!(%from, "oversized datagram dropped");
                continue;
            }
            let frame = match codec::decode(&buf[..n]) {
                Ok(f) => f,
                Err(e) => {
                    self.stats.record_malformed();
                    debug!(%from, len = n, error = %e, "malformed datagram dropped");
                    continue;
                }
            };

            let reply = match catch_unwind(AssertUnwindSafe(|| self.handle_frame(frame, from))) {
                Ok(reply) => reply,
                Err(panic) => {
                    error!(%from, panic = %panic_message(&*panic), "panic while handling datagram");
                    None
                }
            };

            if let Some(reply) = reply {
                match codec::encode(&reply) {
                    Ok(bytes) => {
                        if let Err(e) = self.link.send_to(&bytes, from).await {
                            debug!(%from, error = %e, "reply send failed");
                        }
                    }
                    Err(e) => warn!(error = %e, "failed to encode reply"),
                }
            }
        }
        debug!("datagram receiver stopped");
    }

    /// Queues a `Ping` to `endpoint` on behalf of `peer`. Nobody waits on
    /// it; the sender loop and [`Self::handle_frame`] act on the outcome.
    fn verify_endpoint(&self, peer: PeerAddress, endpoint: SocketAddr) {
        let id = MessageId::new();
        let frame = match codec::encode(&Frame::Ping {
            id,
            sender: self.local,
        }) {
            Ok(f) => f,
            Err(e) => {
                warn!(error = %e, "failed to encode ping");
                return;
            }
        };
        let now = self.clock.now();
        drop(self.queue.enqueue(
            Pending {
                id,
                peer,
                kind: EntryKind::Verify,
                frame,
                endpoint,
                deadline: now + self.config.delivery_deadline,
            },
            now,
        ));
        self.wake.notify_one();
    }

    fn observe_sender(&self, sender: PeerAddress, from: SocketAddr) {
        if self.discovery.observe(sender, from) == Sighting::Moved && !self.is_stopped() {
            trace!(peer = %sender, %from, "verifying new endpoint");
            self.verify_endpoint(sender, from);
        }
    }

    /// Applies one inbound frame. Returns the frame to answer with, if any.
    fn handle_frame(&self, frame: Frame, from: SocketAddr) -> Option<Frame> {
        match frame {
            Frame::Message {
                id,
                sender,
                payload,
            } => {
                self.observe_sender(sender, from);
                self.health.record_success(sender, TransportKind::Datagram);

                if self.seen.insert(id) {
                    self.stats.record_received();
                    trace!(peer = %sender, id = %id, len = payload.len(), "message received");
                    let handler = self.handler.read().clone();
                    match handler {
                        Some(h) => h.on_message(InboundMessage {
                            id,
                            sender,
                            payload: Bytes::from(payload),
                            via: TransportKind::Datagram,
                        }),
                        None => debug!(id = %id, "no handler installed, message dropped"),
                    }
                } else {
                    self.stats.record_duplicate();
                    trace!(peer = %sender, id = %id, "duplicate message, re-acking");
                }
                Some(Frame::Ack { id })
            }
            Frame::Ping { id, sender } => {
                self.observe_sender(sender, from);
                self.health.record_success(sender, TransportKind::Datagram);
                Some(Frame::Pong { id })
            }
            Frame::Ack { id } | Frame::Pong { id } => {
                if let Some(entry) = self.queue.complete(&id) {
                    // Only frames we sent carry this id, so `from` is the peer.
                    self.discovery.confirm(entry.peer, from);
                    self.health.record_success(entry.peer, TransportKind::Datagram);
                    trace!(peer = %entry.peer, id = %id, attempts = entry.attempts, "confirmed");
                }
                None
            }
        }
    }
}

#[async_trait]
impl Transport for DatagramTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Datagram
    }

    fn start(self: Arc<Self>) -> Result<(), TransportError> {
        if self.is_stopped() {
            return Err(TransportError::Shutdown);
        }
        if self.started.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        info!(
            local = %self.local,
            endpoint = ?self.link.local_addr().ok(),
            max_attempts = self.config.max_attempts,
            "datagram transport starting"
        );
        tokio::spawn(Arc::clone(&self).run_sender(self.shutdown.subscribe()));
        tokio::spawn(Arc::clone(&self).run_receiver(self.shutdown.subscribe()));
        Ok(())
    }

    async fn send(&self, message: Message) -> Result<(), TransportError> {
        if !self.is_running() {
            return Err(TransportError::Shutdown);
        }
        let Some(endpoint) = self.discovery.get(&message.destination) else {
            self.stats.record_failed();
            return Err(TransportError::UnknownPeer(message.destination));
        };
        let frame = codec::encode(&Frame::Message {
            id: message.id,
            sender: self.local,
            payload: message.payload.to_vec(),
        })
        .map_err(|e| match e {
            CodecError::Oversized { .. } => TransportError::PayloadTooLarge {
                size: message.payload.len(),
                max: self.max_payload,
            },
            other => other.into(),
        });
        let frame = match frame {
            Ok(f) => f,
            Err(e) => {
                self.stats.record_failed();
                return Err(e);
            }
        };

        let result = self
            .enqueue_and_wait(
                message.id,
                message.destination,
                EntryKind::Message,
                frame,
                endpoint,
            )
            .await;
        match &result {
            Ok(()) => self.stats.record_delivered(),
            Err(_) => self.stats.record_failed(),
        }
        result
    }

    fn set_handler(&self, handler: Arc<dyn MessageHandler>) {
        *self.handler.write() = Some(handler);
    }

    fn stop(&self) {
        if self.shutdown.send_replace(true) {
            return;
        }
        let abandoned = self.queue.drain_all();
        info!(local = %self.local, abandoned, "datagram transport stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DatagramConfig;

    fn addr(b: u8) -> PeerAddress {
        PeerAddress([b; 20])
    }

    fn node(net: &Arc<MemoryNetwork>, who: u8, config: DatagramConfig) -> Arc<DatagramTransport> {
        Arc::new(DatagramTransport::new(
            addr(who),
            net.bind(),
            config,
            Arc::new(HealthTracker::default()),
            Arc::new(TransportStats::new()),
        ))
    }

    #[test]
    fn duplicate_frames_are_acked_but_delivered_once() {
        let net = MemoryNetwork::new();
        let t = node(&net, 1, DatagramConfig::default());
        let delivered = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let sink = delivered.clone();
        t.set_handler(Arc::new(move |m: InboundMessage| sink.lock().push(m.id)));

        let id = MessageId::new();
        let from = SocketAddr::from(([127, 0, 0, 1], 50000));
        for _ in 0..4 {
            let reply = t.handle_frame(
                Frame::Message {
                    id,
                    sender: addr(2),
                    payload: vec![1, 2, 3],
                },
                from,
            );
            assert_eq!(reply, Some(Frame::Ack { id }));
        }

        assert_eq!(*delivered.lock(), vec![id]);
        let snap = t.stats.snapshot();
        assert_eq!(snap.received, 1);
        assert_eq!(snap.duplicates, 3);
        assert_eq!(t.discovery().get(&addr(2)), Some(from));
        assert_eq!(
            t.health.status(&addr(2)),
            crate::health::NodeStatus::Connected
        );
    }

    #[test]
    fn ping_is_answered_with_pong() {
        let net = MemoryNetwork::new();
        let t = node(&net, 1, DatagramConfig::default());
        let id = MessageId::new();
        let reply = t.handle_frame(
            Frame::Ping {
                id,
                sender: addr(3),
            },
            SocketAddr::from(([127, 0, 0, 1], 50001)),
        );
        assert_eq!(reply, Some(Frame::Pong { id }));
    }

    #[tokio::test]
    async fn only_an_answered_ping_moves_a_peer() {
        let net = MemoryNetwork::new();
        let t = node(&net, 1, DatagramConfig::default());
        let old = SocketAddr::from(([127, 0, 0, 1], 50002));
        let new = SocketAddr::from(([127, 0, 0, 1], 50003));
        t.discovery().insert(addr(2), old);

        let reply = t.handle_frame(
            Frame::Ping {
                id: MessageId::new(),
                sender: addr(2),
            },
            new,
        );
        assert!(matches!(reply, Some(Frame::Pong { .. })));
        assert_eq!(t.discovery().get(&addr(2)), Some(old));
        assert_eq!(t.in_flight(), 1);

        // A pong for an id we never sent changes nothing.
        let stray = t.handle_frame(Frame::Pong { id: MessageId::new() }, new);
        assert_eq!(stray, None);
        assert_eq!(t.discovery().get(&addr(2)), Some(old));

        let due = t.queue.poll_due(t.clock.now(), &t.limiter);
        let ping = &due.transmissions[0];
        assert_eq!(ping.endpoint, new);
        assert_eq!(t.handle_frame(Frame::Pong { id: ping.id }, new), None);
        assert_eq!(t.discovery().get(&addr(2)), Some(new));
        assert_eq!(t.discovery().candidate(&addr(2)), None);
        assert_eq!(t.in_flight(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn unanswered_endpoint_check_leaves_peer_alone() {
        let net = MemoryNetwork::new();
        let t = node(
            &net,
            1,
            DatagramConfig {
                max_attempts: 2,
                retry_interval: Duration::from_millis(100),
                ..DatagramConfig::default()
            },
        );
        let known = SocketAddr::from(([127, 0, 0, 1], 50004));
        let elsewhere = SocketAddr::from(([127, 0, 0, 1], 50005));
        t.discovery().insert(addr(2), known);
        Arc::clone(&t).start().unwrap();

        t.handle_frame(
            Frame::Ping {
                id: MessageId::new(),
                sender: addr(2),
            },
            elsewhere,
        );
        assert_eq!(t.discovery().candidate(&addr(2)), Some(elsewhere));
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert_eq!(t.in_flight(), 0);
        assert_eq!(t.discovery().candidate(&addr(2)), None);
        assert_eq!(t.discovery().get(&addr(2)), Some(known));
        assert_eq!(
            t.health.status(&addr(2)),
            crate::health::NodeStatus::Connected
        );
        t.stop();
    }

    #[tokio::test]
    async fn send_requires_running_transport_and_known_peer() {
        let net = MemoryNetwork::new();
        let t = node(&net, 1, DatagramConfig::default());
        let err = t.send(Message::new(addr(2), vec![0])).await.unwrap_err();
        assert!(matches!(err, TransportError::Shutdown));

        Arc::clone(&t).start().unwrap();
        let err = t.send(Message::new(addr(2), vec![0])).await.unwrap_err();
        assert!(matches!(err, TransportError::UnknownPeer(_)));
        t.stop();
    }

    #[tokio::test]
    async fn oversized_payload_is_refused_up_front() {
        let net = MemoryNetwork::new();
        let t = node(&net, 1, DatagramConfig::default());
        t.discovery()
            .insert(addr(2), SocketAddr::from(([127, 0, 0, 1], 40999)));
        Arc::clone(&t).start().unwrap();

        let too_big = vec![0u8; UDP_MAX_MESSAGE_SIZE];
        assert!(!t.can_carry(too_big.len()));
        let err = t.send(Message::new(addr(2), too_big)).await.unwrap_err();
        assert!(matches!(err, TransportError::PayloadTooLarge { .. }));
        assert_eq!(t.in_flight(), 0);
        t.stop();
    }
}
