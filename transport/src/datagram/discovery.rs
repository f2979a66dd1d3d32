//! Peer address → datagram endpoint table.
//!
//! Seeded with static entries by the node. Inbound frames carry an
//! unauthenticated sender address, so they only ever fill in a peer that
//! has no endpoint yet. A frame from a different endpoint than the one on
//! record leaves a candidate; the entry moves only when a `Pong` or `Ack`
//! for one of our own outstanding frames comes back from it (NAT
//! rebinding, roaming device).

use std::net::SocketAddr;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::debug;

use crate::message::PeerAddress;

/// What an inbound frame revealed about its claimed sender.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sighting {
    /// Matches the endpoint on record, or a candidate already noted.
    Unchanged,
    /// The peer had no endpoint; this one is now on record.
    Learned,
    /// New candidate endpoint. Needs confirming before it is used.
    Moved,
}

#[derive(Default)]
pub struct Discovery {
    endpoints: DashMap<PeerAddress, SocketAddr>,
    /// Unconfirmed endpoints seen on inbound frames.
    candidates: DashMap<PeerAddress, SocketAddr>,
}

impl Discovery {
    pub fn new() -> Self {
        Self::default()
    }

    /// Static entry, e.g. from configuration.
    pub fn insert(&self, peer: PeerAddress, endpoint: SocketAddr) {
        self.endpoints.insert(peer, endpoint);
        self.candidates.remove(&peer);
    }

    /// Notes the endpoint an inbound frame claiming to be from `peer`
    /// arrived from. Never replaces an endpoint on record.
    pub fn observe(&self, peer: PeerAddress, endpoint: SocketAddr) -> Sighting {
        match self.endpoints.entry(peer) {
            Entry::Vacant(slot) => {
                slot.insert(endpoint);
                debug!(peer = %peer, %endpoint, "datagram endpoint learned");
                Sighting::Learned
            }
            Entry::Occupied(known) if *known.get() == endpoint => Sighting::Unchanged,
            Entry::Occupied(known) => {
                let current = *known.get();
                drop(known);
                if self.candidates.insert(peer, endpoint) == Some(endpoint) {
                    return Sighting::Unchanged;
                }
                debug!(peer = %peer, %endpoint, %current, "unconfirmed datagram endpoint");
                Sighting::Moved
            }
        }
    }

    /// Records `endpoint` for `peer` after it answered one of our frames.
    /// Returns `true` if the table changed.
    pub fn confirm(&self, peer: PeerAddress, endpoint: SocketAddr) -> bool {
        self.candidates.remove_if(&peer, |_, c| *c == endpoint);
        let previous = self.endpoints.insert(peer, endpoint);
        let changed = previous != Some(endpoint);
        if changed {
            debug!(peer = %peer, %endpoint, ?previous, "datagram endpoint confirmed");
        }
        changed
    }

    /// Forgets a candidate that never answered.
    pub fn reject(&self, peer: &PeerAddress, endpoint: SocketAddr) {
        if self
            .candidates
            .remove_if(peer, |_, c| *c == endpoint)
            .is_some()
        {
            debug!(peer = %peer, %endpoint, "candidate endpoint rejected");
        }
    }

    pub fn candidate(&self, peer: &PeerAddress) -> Option<SocketAddr> {
        self.candidates.get(peer).map(|e| *e)
    }

    pub fn get(&self, peer: &PeerAddress) -> Option<SocketAddr> {
        self.endpoints.get(peer).map(|e| *e)
    }

    pub fn remove(&self, peer: &PeerAddress) -> Option<SocketAddr> {
        self.candidates.remove(peer);
        self.endpoints.remove(peer).map(|(_, e)| e)
    }

    pub fn peers(&self) -> Vec<PeerAddress> {
        self.endpoints.iter().map(|e| *e.key()).collect()
    }

    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }
}
