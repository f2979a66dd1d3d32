//! Error types crossing module boundaries.
//!
//! Only [`TransportError`] reaches the upper layer. The chat-side errors
//! (`BackendError`, `SyncError`, `StoreError`) are defined next to the code
//! that raises them and are contained inside the chat module.

use thiserror::Error;

use crate::message::{MessageId, PeerAddress};

/// Failures of the send path and of transport lifecycle.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Every attempt on the path was spent without confirmation.
    #[error("delivery of {id} failed after {attempts} attempt(s)")]
    DeliveryFailed { id: MessageId, attempts: u32 },

    /// The message sat queued past its deadline (usually throttled).
    #[error("delivery of {id} expired before confirmation")]
    DeadlineExceeded { id: MessageId },

    /// The transport was stopped while the message was in flight.
    #[error("transport is shut down")]
    Shutdown,

    /// The encoded frame does not fit in a single datagram.
    #[error("payload too large: {size} bytes (max {max})")]
    PayloadTooLarge { size: usize, max: usize },

    /// No route to the peer on this path (e.g. no known endpoint).
    #[error("no route to peer {0}")]
    UnknownPeer(PeerAddress),

    /// The chat backend refused or failed the publish.
    #[error("chat backend error: {0}")]
    Backend(String),

    /// Both paths of the mixed transport failed.
    #[error("all paths failed for {id}: datagram: {datagram}; chat: {chat}")]
    AllPathsFailed {
        id: MessageId,
        datagram: String,
        chat: String,
    },

    /// The end-to-end ceiling elapsed.
    #[error("no confirmation for {id} within the request timeout")]
    Timeout { id: MessageId },

    /// Frame encoding failed.
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl TransportError {
    /// Whether another path might still succeed where this one failed.
    pub fn is_path_failure(&self) -> bool {
        matches!(
            self,
            TransportError::DeliveryFailed { .. }
                | TransportError::DeadlineExceeded { .. }
                | TransportError::PayloadTooLarge { .. }
                | TransportError::UnknownPeer(_)
                | TransportError::Io(_)
        )
    }
}

/// Datagram frame encode/decode failures.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("frame too short ({0} bytes)")]
    Truncated(usize),

    #[error("bad protocol magic")]
    BadMagic,

    #[error("unsupported wire version {0}")]
    UnsupportedVersion(u8),

    #[error("frame exceeds {max} bytes")]
    Oversized { max: usize },

    #[error("bincode: {0}")]
    Bincode(#[from] bincode::Error),
}

/// Best-effort text of a caught panic payload.
pub(crate) fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_failures_are_classified() {
        let id = MessageId::new();
        assert!(TransportError::DeliveryFailed { id, attempts: 3 }.is_path_failure());
        assert!(TransportError::UnknownPeer(PeerAddress([0; 20])).is_path_failure());
        assert!(!TransportError::Shutdown.is_path_failure());
        assert!(!TransportError::Timeout { id }.is_path_failure());
    }

    #[test]
    fn display_includes_context() {
        let id = MessageId::new();
        let msg = TransportError::DeliveryFailed { id, attempts: 3 }.to_string();
        assert!(msg.contains(&id.to_string()));
        assert!(msg.contains("3 attempt"));
    }
}
