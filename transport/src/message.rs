//! Messages, identifiers and the upper-layer delivery callback.

use std::fmt;
use std::str::FromStr;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::transport::TransportKind;

// ---------------------------------------------------------------------------
// PeerAddress
// ---------------------------------------------------------------------------

/// A node's 20-byte network address.
///
/// Displays as lowercase `0x`-prefixed hex. Parsing accepts the prefix as
/// optional and either case.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerAddress(pub [u8; 20]);

impl PeerAddress {
    /// Length of an address in bytes.
    pub const LEN: usize = 20;

    /// Hex without the `0x` prefix. Used where a prefix is not allowed,
    /// e.g. chat user id localparts.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Short form for log lines.
    pub fn short(&self) -> String {
        format!("0x{}", &self.to_hex()[..8])
    }
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", self.to_hex())
    }
}

impl fmt::Debug for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerAddress({})", self)
    }
}

/// Failure to parse a [`PeerAddress`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AddressParseError {
    #[error("invalid hex: {0}")]
    InvalidHex(String),
    #[error("expected {expected} bytes, got {got}")]
    InvalidLength { expected: usize, got: usize },
}

impl FromStr for PeerAddress {
    type Err = AddressParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s
            .strip_prefix("0x")
            .or_else(|| s.strip_prefix("0X"))
            .unwrap_or(s);
        let bytes = hex::decode(s).map_err(|e| AddressParseError::InvalidHex(e.to_string()))?;
        let arr: [u8; 20] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| AddressParseError::InvalidLength {
                expected: Self::LEN,
                got: bytes.len(),
            })?;
        Ok(Self(arr))
    }
}

// ---------------------------------------------------------------------------
// MessageId
// ---------------------------------------------------------------------------

/// Globally unique message identifier. Drives dedup and retry correlation.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MessageId(pub Uuid);

impl MessageId {
    /// Fresh random id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl fmt::Debug for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MessageId({})", self.0)
    }
}

impl FromStr for MessageId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

// ---------------------------------------------------------------------------
// Message
// ---------------------------------------------------------------------------

/// An outbound protocol message.
///
/// The payload is opaque: framing and signing belong to the upper layer.
/// Lives until delivery is confirmed or every path has given up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub id: MessageId,
    pub destination: PeerAddress,
    pub payload: Bytes,
    pub created_at: DateTime<Utc>,
}

impl Message {
    pub fn new(destination: PeerAddress, payload: impl Into<Bytes>) -> Self {
        Self {
            id: MessageId::new(),
            destination,
            payload: payload.into(),
            created_at: Utc::now(),
        }
    }
}

/// A message delivered to the upper layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub id: MessageId,
    pub sender: PeerAddress,
    pub payload: Bytes,
    /// Path it arrived over. Informational only.
    pub via: TransportKind,
}

/// Upper-layer delivery callback.
///
/// Invoked on the receiving worker: implementations must hand work off
/// rather than block.
pub trait MessageHandler: Send + Sync {
    fn on_message(&self, message: InboundMessage);
}

impl<F> MessageHandler for F
where
    F: Fn(InboundMessage) + Send + Sync,
{
    fn on_message(&self, message: InboundMessage) {
        self(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_display_roundtrip() {
        let addr = PeerAddress([0xab; 20]);
        let s = addr.to_string();
        assert!(s.starts_with("0xabab"));
        assert_eq!(s.len(), 42);
        assert_eq!(s.parse::<PeerAddress>().unwrap(), addr);
        assert_eq!(addr.to_hex().parse::<PeerAddress>().unwrap(), addr);
    }

    #[test]
    fn address_rejects_wrong_length() {
        let err = "0x1234".parse::<PeerAddress>().unwrap_err();
        assert_eq!(
            err,
            AddressParseError::InvalidLength {
                expected: 20,
                got: 2
            }
        );
        assert!(matches!(
            "0xzz".parse::<PeerAddress>(),
            Err(AddressParseError::InvalidHex(_))
        ));
    }

    #[test]
    fn message_ids_are_unique() {
        let a = Message::new(PeerAddress([1; 20]), vec![1, 2, 3]);
        let b = Message::new(PeerAddress([1; 20]), vec![1, 2, 3]);
        assert_ne!(a.id, b.id);
        assert_eq!(a.id.to_string().parse::<MessageId>().unwrap(), a.id);
    }

    #[test]
    fn closures_are_handlers() {
        let seen = std::sync::Arc::new(parking_lot::Mutex::new(Vec::new()));
        let sink = seen.clone();
        let handler = move |m: InboundMessage| sink.lock().push(m.id);
        let id = MessageId::new();
        handler.on_message(InboundMessage {
            id,
            sender: PeerAddress([2; 20]),
            payload: Bytes::from_static(b"x"),
            via: TransportKind::Datagram,
        });
        assert_eq!(*seen.lock(), vec![id]);
    }
}
