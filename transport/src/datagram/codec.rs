//! Datagram frame codec.
//!
//! Layout: `magic (4) | version (1) | bincode(Frame)`. The whole frame,
//! header included, must fit in [`UDP_MAX_MESSAGE_SIZE`]. Anything else on
//! the socket is rejected before bincode ever sees it.

use bincode::Options;
use serde::{Deserialize, Serialize};

use crate::config::{PROTOCOL_MAGIC, UDP_MAX_MESSAGE_SIZE, WIRE_VERSION};
use crate::error::CodecError;
use crate::message::{MessageId, PeerAddress};

const HEADER_LEN: usize = PROTOCOL_MAGIC.len() + 1;

/// One datagram on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Frame {
    /// A protocol message. Answered with `Ack`, even when it is a duplicate.
    Message {
        id: MessageId,
        sender: PeerAddress,
        payload: Vec<u8>,
    },
    Ack { id: MessageId },
    /// Health probe. Answered with `Pong`.
    Ping { id: MessageId, sender: PeerAddress },
    Pong { id: MessageId },
}

impl Frame {
    pub fn id(&self) -> MessageId {
        match self {
            Frame::Message { id, .. }
            | Frame::Ack { id }
            | Frame::Ping { id, .. }
            | Frame::Pong { id } => *id,
        }
    }

    /// Sender address, for frames that carry one.
    pub fn sender(&self) -> Option<PeerAddress> {
        match self {
            Frame::Message { sender, .. } | Frame::Ping { sender, .. } => Some(*sender),
            Frame::Ack { .. } | Frame::Pong { .. } => None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Frame::Message { .. } => "message",
            Frame::Ack { .. } => "ack",
            Frame::Ping { .. } => "ping",
            Frame::Pong { .. } => "pong",
        }
    }
}

fn options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_limit((UDP_MAX_MESSAGE_SIZE - HEADER_LEN) as u64)
        .reject_trailing_bytes()
}

/// Encodes `frame`, failing with [`CodecError::Oversized`] if the result
/// would not fit in one datagram.
pub fn encode(frame: &Frame) -> Result<Vec<u8>, CodecError> {
    let body = options().serialize(frame).map_err(|e| {
        if matches!(*e, bincode::ErrorKind::SizeLimit) {
            CodecError::Oversized {
                max: UDP_MAX_MESSAGE_SIZE,
            }
        } else {
            CodecError::Bincode(e)
        }
    })?;

    let mut out = Vec::with_capacity(HEADER_LEN + body.len());
    out.extend_from_slice(&PROTOCOL_MAGIC);
    out.push(WIRE_VERSION);
    out.extend_from_slice(&body);
    Ok(out)
}

pub fn decode(bytes: &[u8]) -> Result<Frame, CodecError> {
    if bytes.len() > UDP_MAX_MESSAGE_SIZE {
        return Err(CodecError::Oversized {
            max: UDP_MAX_MESSAGE_SIZE,
        });
    }
    if bytes.len() < HEADER_LEN {
        return Err(CodecError::Truncated(bytes.len()));
    }
    if bytes[..PROTOCOL_MAGIC.len()] != PROTOCOL_MAGIC {
        return Err(CodecError::BadMagic);
    }
    let version = bytes[PROTOCOL_MAGIC.len()];
    if version != WIRE_VERSION {
        return Err(CodecError::UnsupportedVersion(version));
    }
    Ok(options().deserialize(&bytes[HEADER_LEN..])?)
}

/// Largest payload a `Frame::Message` can carry.
///
/// Measured with a sample payload whose varint length prefix has the same
/// width (3 bytes) as any payload near the ceiling.
pub fn max_payload_len() -> usize {
    const SAMPLE: usize = 256;
    let sample = Frame::Message {
        id: MessageId::default(),
        sender: PeerAddress([0; 20]),
        payload: vec![0; SAMPLE],
    };
    let overhead = bincode::DefaultOptions::new()
        .serialized_size(&sample)
        .map(|n| n as usize - SAMPLE)
        .unwrap_or(UDP_MAX_MESSAGE_SIZE);
    UDP_MAX_MESSAGE_SIZE.saturating_sub(HEADER_LEN + overhead)
}
