//! The transport capability shared by the datagram, chat and mixed
//! transports.
//!
//! Call sites hold an `Arc<dyn Transport>` and never switch on which
//! concrete path they got.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::TransportError;
use crate::message::{Message, MessageHandler, MessageId, PeerAddress};

/// Which path a transport (or an inbound message) belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    Datagram,
    Chat,
    Mixed,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TransportKind::Datagram => "datagram",
            TransportKind::Chat => "chat",
            TransportKind::Mixed => "mixed",
        })
    }
}

#[async_trait]
pub trait Transport: Send + Sync {
    fn kind(&self) -> TransportKind;

    /// Spawns the transport's workers. Must be called from inside a tokio
    /// runtime. Calling it twice is a no-op.
    fn start(self: Arc<Self>) -> Result<(), TransportError>;

    /// Delivers one message. Resolves `Ok` once the path confirms delivery,
    /// `Err` when the path gives up or the transport stops.
    async fn send(&self, message: Message) -> Result<(), TransportError>;

    /// Installs the inbound callback, replacing any previous one.
    fn set_handler(&self, handler: Arc<dyn MessageHandler>);

    /// Stops every worker promptly. In-flight sends resolve with
    /// [`TransportError::Shutdown`].
    fn stop(&self);

    /// Upper-layer entry point: wraps `payload` in a fresh [`Message`].
    async fn send_payload(
        &self,
        destination: PeerAddress,
        payload: Bytes,
    ) -> Result<MessageId, TransportError> {
        let message = Message::new(destination, payload);
        let id = message.id;
        self.send(message).await?;
        Ok(id)
    }
}
