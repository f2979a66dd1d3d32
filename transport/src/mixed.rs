//! # Mixed Transport
//!
//! One [`Transport`] over both paths.
//!
//! ## Path selection
//!
//! The datagram path is tried first when all of these hold:
//!
//! - the health tracker does not report the peer `Disconnected` on it,
//! - discovery knows an endpoint for the peer,
//! - the payload fits in one datagram.
//!
//! Otherwise the message goes straight to chat. A datagram failure that
//! another path could fix (retries exhausted, deadline passed, no route)
//! falls back to chat for the same message id, so a receiver that got
//! both copies still delivers once.
//!
//! ## Inbound
//!
//! Both transports feed one handler installed here. Ids are deduplicated
//! again across the two paths before the upper layer sees them.

use std::sync::{Arc, Weak};

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::{debug, info, trace, warn};

use crate::chat::ChatTransport;
use crate::config::{MixedConfig, SEEN_CACHE_TTL};
use crate::datagram::DatagramTransport;
use crate::dedup::SeenCache;
use crate::error::TransportError;
use crate::health::{HealthTracker, NodeStatus};
use crate::message::{InboundMessage, Message, MessageHandler};
use crate::stats::TransportStats;
use crate::transport::{Transport, TransportKind};

pub struct MixedTransport {
    datagram: Arc<DatagramTransport>,
    chat: Arc<ChatTransport>,
    health: Arc<HealthTracker>,
    stats: Arc<TransportStats>,
    config: MixedConfig,
    seen: SeenCache,
    handler: RwLock<Option<Arc<dyn MessageHandler>>>,
}

/// Forwards one path's inbound messages into the shared stream.
struct Merge(Weak<MixedTransport>);

impl MessageHandler for Merge {
    fn on_message(&self, message: InboundMessage) {
        if let Some(mixed) = self.0.upgrade() {
            mixed.deliver(message);
        }
    }
}

impl MixedTransport {
    pub fn new(
        datagram: Arc<DatagramTransport>,
        chat: Arc<ChatTransport>,
        health: Arc<HealthTracker>,
        stats: Arc<TransportStats>,
        config: MixedConfig,
    ) -> Arc<Self> {
        let seen = SeenCache::new(config.seen_cache_size, SEEN_CACHE_TTL);
        Arc::new_cyclic(|weak: &Weak<Self>| {
            datagram.set_handler(Arc::new(Merge(weak.clone())));
            chat.set_handler(Arc::new(Merge(weak.clone())));
            Self {
                datagram,
                chat,
                health,
                stats,
                config,
                seen,
                handler: RwLock::new(None),
            }
        })
    }

    pub fn datagram(&self) -> &Arc<DatagramTransport> {
        &self.datagram
    }

    pub fn chat(&self) -> &Arc<ChatTransport> {
        &self.chat
    }

    /// Whether a send to `message.destination` would start on the datagram
    /// path.
    pub fn prefers_datagram(&self, message: &Message) -> bool {
        let peer = &message.destination;
        self.health.path_status(peer, TransportKind::Datagram) != NodeStatus::Disconnected
            && self.datagram.has_route(peer)
            && self.datagram.can_carry(message.payload.len())
    }

    fn deliver(&self, message: InboundMessage) {
        if !self.seen.insert(message.id) {
            self.stats.record_duplicate();
            trace!(id = %message.id, via = %message.via, "already delivered on the other path");
            return;
        }
        let handler = self.handler.read().clone();
        match handler {
            Some(h) => h.on_message(message),
            None => debug!(id = %message.id, "no handler installed, message dropped"),
        }
    }

    async fn route(&self, message: Message) -> Result<(), TransportError> {
        let id = message.id;
        let peer = message.destination;

        if !self.prefers_datagram(&message) {
            trace!(%peer, %id, "datagram path skipped");
            return self.chat.send(message).await;
        }

        let datagram_err = match self.datagram.send(message.clone()).await {
            Ok(()) => return Ok(()),
            Err(e) if e.is_path_failure() => e,
            Err(e) => return Err(e),
        };

        self.stats.record_fallback();
        info!(%peer, %id, error = %datagram_err, "datagram path failed, falling back to chat");
        match self.chat.send(message).await {
            Ok(()) => Ok(()),
            Err(chat_err) => {
                warn!(%peer, %id, datagram = %datagram_err, chat = %chat_err, "all paths failed");
                Err(TransportError::AllPathsFailed {
                    id,
                    datagram: datagram_err.to_string(),
                    chat: chat_err.to_string(),
                })
            }
        }
    }
}

#[async_trait]
impl Transport for MixedTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Mixed
    }

    fn start(self: Arc<Self>) -> Result<(), TransportError> {
        Arc::clone(&self.datagram).start()?;
        if let Err(e) = Arc::clone(&self.chat).start() {
            self.datagram.stop();
            return Err(e);
        }
        Ok(())
    }

    async fn send(&self, message: Message) -> Result<(), TransportError> {
        let id = message.id;
        match tokio::time::timeout(self.config.request_timeout, self.route(message)).await {
            Ok(result) => result,
            Err(_) => {
                warn!(%id, timeout_secs = self.config.request_timeout.as_secs(), "send timed out");
                Err(TransportError::Timeout { id })
            }
        }
    }

    fn set_handler(&self, handler: Arc<dyn MessageHandler>) {
        *self.handler.write() = Some(handler);
    }

    fn stop(&self) {
        self.datagram.stop();
        self.chat.stop();
    }
}
