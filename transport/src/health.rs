//! # Peer Health Tracking
//!
//! Keeps, per peer, a reachability status for each path and derives the
//! overall status and preferred transport from them. Inputs:
//!
//! - delivery outcomes reported by the datagram transport (ack, exhaustion)
//! - inbound traffic on either path
//! - presence updates from the chat backend
//! - periodic datagram probes from the [`Prober`], so idle peers are still
//!   refreshed
//!
//! Every update is a single `DashMap` entry operation, so it is atomic per
//! peer. Readers (path selection) may see a slightly stale status; that is
//! fine, the next outcome corrects it.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, watch};
use tracing::{debug, info};

use crate::config::HealthConfig;
use crate::datagram::DatagramTransport;
use crate::message::PeerAddress;
use crate::transport::TransportKind;

/// Reachability classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    #[default]
    Unknown,
    Connected,
    Disconnected,
}

/// What the node knows about one peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Peer {
    pub address: PeerAddress,
    /// Signing key of the peer, when the upper layer registered one.
    pub public_key: Option<[u8; 32]>,
    /// Overall status derived from the per-path statuses.
    pub status: NodeStatus,
    /// Path the mixed transport should try first.
    pub preferred: TransportKind,
    pub datagram: NodeStatus,
    pub chat: NodeStatus,
    pub last_seen: Option<DateTime<Utc>>,
}

impl Peer {
    fn new(address: PeerAddress) -> Self {
        Self {
            address,
            public_key: None,
            status: NodeStatus::Unknown,
            preferred: TransportKind::Datagram,
            datagram: NodeStatus::Unknown,
            chat: NodeStatus::Unknown,
            last_seen: None,
        }
    }

    /// Status of one path.
    pub fn path_status(&self, path: TransportKind) -> NodeStatus {
        match path {
            TransportKind::Datagram => self.datagram,
            TransportKind::Chat => self.chat,
            TransportKind::Mixed => self.status,
        }
    }

    fn recompute(&mut self) {
        use NodeStatus::*;
        self.status = match (self.datagram, self.chat) {
            (Connected, _) | (_, Connected) => Connected,
            (Disconnected, Disconnected) => Disconnected,
            _ => Unknown,
        };
        self.preferred = if self.datagram == Disconnected {
            TransportKind::Chat
        } else {
            TransportKind::Datagram
        };
    }
}

/// Emitted whenever a peer's overall status changes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusChange {
    pub address: PeerAddress,
    pub old: NodeStatus,
    pub new: NodeStatus,
}

pub struct HealthTracker {
    peers: DashMap<PeerAddress, Peer>,
    events: broadcast::Sender<StatusChange>,
    config: HealthConfig,
}

impl HealthTracker {
    pub fn new(config: HealthConfig) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        Self {
            peers: DashMap::new(),
            events,
            config,
        }
    }

    pub fn config(&self) -> &HealthConfig {
        &self.config
    }

    /// Makes a peer known ahead of any traffic, optionally with its key.
    pub fn register_peer(&self, address: PeerAddress, public_key: Option<[u8; 32]>) {
        self.peers
            .entry(address)
            .and_modify(|p| {
                if public_key.is_some() {
                    p.public_key = public_key;
                }
            })
            .or_insert_with(|| Peer {
                public_key,
                ..Peer::new(address)
            });
    }

    /// Overall status; `Unknown` for peers never heard of.
    pub fn status(&self, address: &PeerAddress) -> NodeStatus {
        self.peers
            .get(address)
            .map(|p| p.status)
            .unwrap_or(NodeStatus::Unknown)
    }

    pub fn path_status(&self, address: &PeerAddress, path: TransportKind) -> NodeStatus {
        self.peers
            .get(address)
            .map(|p| p.path_status(path))
            .unwrap_or(NodeStatus::Unknown)
    }

    /// Path the mixed transport should try first.
    pub fn preferred(&self, address: &PeerAddress) -> TransportKind {
        self.peers
            .get(address)
            .map(|p| p.preferred)
            .unwrap_or(TransportKind::Datagram)
    }

    pub fn peer(&self, address: &PeerAddress) -> Option<Peer> {
        self.peers.get(address).map(|p| p.clone())
    }

    /// Snapshot of every known peer, sorted by address.
    pub fn peers(&self) -> Vec<Peer> {
        let mut peers: Vec<Peer> = self.peers.iter().map(|p| p.value().clone()).collect();
        peers.sort_by_key(|p| p.address);
        peers
    }

    pub fn connected_count(&self) -> usize {
        self.peers
            .iter()
            .filter(|p| p.status == NodeStatus::Connected)
            .count()
    }

    /// Receives every overall status change from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<StatusChange> {
        self.events.subscribe()
    }

    /// Update hook used by the transports. `Mixed` is not a path and is
    /// ignored.
    pub fn record(&self, address: PeerAddress, path: TransportKind, status: NodeStatus) {
        let change = {
            let mut peer = self
                .peers
                .entry(address)
                .or_insert_with(|| Peer::new(address));
            let old = peer.status;
            match path {
                TransportKind::Datagram => peer.datagram = status,
                TransportKind::Chat => peer.chat = status,
                TransportKind::Mixed => return,
            }
            if status == NodeStatus::Connected {
                peer.last_seen = Some(Utc::now());
            }
            peer.recompute();
            (old != peer.status).then(|| StatusChange {
                address,
                old,
                new: peer.status,
            })
        };

        if let Some(change) = change {
            info!(
                peer = %change.address,
                path = %path,
                old = ?change.old,
                new = ?change.new,
                "peer status changed"
            );
            // No subscribers is fine.
            let _ = self.events.send(change);
        }
    }

    pub fn record_success(&self, address: PeerAddress, path: TransportKind) {
        self.record(address, path, NodeStatus::Connected);
    }

    pub fn record_failure(&self, address: PeerAddress, path: TransportKind) {
        self.record(address, path, NodeStatus::Disconnected);
    }
}

impl Default for HealthTracker {
    fn default() -> Self {
        Self::new(HealthConfig::default())
    }
}

// ---------------------------------------------------------------------------
// Prober
// ---------------------------------------------------------------------------

/// Periodic probe ticker.
///
/// Independent of application traffic: every tick it pings each peer the
/// datagram transport has an endpoint for. Each probe runs in its own task
/// so one unreachable peer cannot delay the others; the datagram transport
/// reports the outcome to the tracker itself.
pub struct Prober {
    datagram: Arc<DatagramTransport>,
    interval: Duration,
}

impl Prober {
    pub fn new(datagram: Arc<DatagramTransport>, interval: Duration) -> Self {
        Self { datagram, interval }
    }

    /// Runs until `shutdown` flips to `true` or its sender is dropped.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(interval_ms = self.interval.as_millis() as u64, "health prober starting");
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                res = shutdown.changed() => {
                    if res.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            }
            if *shutdown.borrow() {
                break;
            }

            for peer in self.datagram.discovery().peers() {
                let datagram = Arc::clone(&self.datagram);
                tokio::spawn(async move {
                    if let Err(e) = datagram.probe(peer).await {
                        debug!(peer = %peer, error = %e, "probe failed");
                    }
                });
            }
        }
        info!("health prober stopped");
    }
}
