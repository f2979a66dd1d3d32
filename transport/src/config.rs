//! # Transport Configuration & Constants
//!
//! Every tunable the messaging layer depends on lives here. Component
//! configs (`DatagramConfig`, `ChatConfig`, ...) default to these values;
//! the node binary overrides individual fields from the command line.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Wire
// ---------------------------------------------------------------------------

/// Magic bytes prefixed to every datagram frame. Lets a node throw away
/// stray traffic without attempting a full decode.
pub const PROTOCOL_MAGIC: [u8; 4] = *b"RLNT";

/// Datagram frame format version. Bumped on incompatible frame changes.
pub const WIRE_VERSION: u8 = 1;

/// Largest datagram we will send or accept, frame header included. Stays
/// under the common path MTU so messages are not fragmented.
pub const UDP_MAX_MESSAGE_SIZE: usize = 1200;

/// Default port nodes listen on for datagram traffic.
pub const DEFAULT_LISTEN_PORT: u16 = 40001;

/// Default port for the node's metrics endpoint.
pub const DEFAULT_METRICS_PORT: u16 = 40002;

// ---------------------------------------------------------------------------
// Datagram retry & throttle
// ---------------------------------------------------------------------------

/// Physical transmissions per message before delivery is reported failed.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// Fixed delay between transmissions of the same message.
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(1);

/// Hard ceiling on how long a single datagram message may stay queued,
/// including time spent deferred by the throttle.
pub const DEFAULT_DELIVERY_DEADLINE: Duration = Duration::from_secs(60);

/// Token bucket burst size for outbound datagrams.
pub const DEFAULT_THROTTLE_CAPACITY: f64 = 10.0;

/// Token bucket refill rate, tokens per second.
pub const DEFAULT_THROTTLE_FILL_RATE: f64 = 1.0;

// ---------------------------------------------------------------------------
// Deduplication
// ---------------------------------------------------------------------------

/// Number of recently seen message ids kept for duplicate suppression.
pub const SEEN_CACHE_SIZE: usize = 10_000;

/// Age after which a seen id may be forgotten.
pub const SEEN_CACHE_TTL: Duration = Duration::from_secs(600);

// ---------------------------------------------------------------------------
// Chat backend sync
// ---------------------------------------------------------------------------

/// Delay before retrying after any failed sync round. Never escalated.
pub const SYNC_BACKOFF: Duration = Duration::from_secs(2);

/// Timeline events per room per sync round.
pub const SYNC_TIMELINE_LIMIT: usize = 50;

/// Long-poll timeout passed to the backend on each sync request.
pub const SYNC_LONG_POLL_TIMEOUT: Duration = Duration::from_secs(30);

/// Event type carrying protocol messages inside room timelines.
pub const PROTOCOL_MESSAGE_EVENT: &str = "protocol.message";

/// Event type of the room handshake. Content `{"seen": bool}`; `seen`
/// is true once the sender's own sync has delivered events from the room.
pub const READY_EVENT: &str = "protocol.ready";

/// How long `open_room` waits for the peer's side of the handshake.
pub const DEFAULT_JOIN_TIMEOUT: Duration = Duration::from_secs(30);

/// Interval between repeated `protocol.ready` announcements after a join.
pub const READY_ANNOUNCE_INTERVAL: Duration = Duration::from_millis(500);

/// Room membership state event type.
pub const MEMBER_EVENT: &str = "m.room.member";

/// Presence event type.
pub const PRESENCE_EVENT: &str = "m.presence";

/// Prefix for per-peer-pair room aliases.
pub const ROOM_ALIAS_PREFIX: &str = "relaynet_";

// ---------------------------------------------------------------------------
// Health & end-to-end
// ---------------------------------------------------------------------------

/// How often idle peers are probed over the datagram path.
pub const DEFAULT_PROBE_INTERVAL: Duration = Duration::from_secs(15);

/// Longest an upper-layer caller should wait for end-to-end confirmation
/// of a single message, across every path and retry.
pub const MAX_REQUEST_TIMEOUT: Duration = Duration::from_secs(20 * 60);

// ---------------------------------------------------------------------------
// Network mode
// ---------------------------------------------------------------------------

/// Which transports a node runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NetworkMode {
    /// Datagram transport bound to loopback only. Used when the node must
    /// stay off the network, e.g. while settling channels.
    NoNetwork,
    /// Datagram transport only.
    UdpOnly,
    /// Chat transport only.
    ChatOnly,
    /// Both transports behind the mixed transport.
    Mixed,
}

impl NetworkMode {
    /// Mobile devices always run mixed: their datagram path is too often
    /// blocked to be trusted alone.
    pub fn effective(self, mobile: bool) -> Self {
        if mobile {
            NetworkMode::Mixed
        } else {
            self
        }
    }
}

impl fmt::Display for NetworkMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NetworkMode::NoNetwork => "no-network",
            NetworkMode::UdpOnly => "udp-only",
            NetworkMode::ChatOnly => "chat-only",
            NetworkMode::Mixed => "mixed",
        };
        f.write_str(s)
    }
}

impl FromStr for NetworkMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "no-network" | "none" => Ok(NetworkMode::NoNetwork),
            "udp-only" | "udp" => Ok(NetworkMode::UdpOnly),
            "chat-only" | "chat" => Ok(NetworkMode::ChatOnly),
            "mixed" => Ok(NetworkMode::Mixed),
            other => Err(format!("unknown network mode: {other}")),
        }
    }
}

// ---------------------------------------------------------------------------
// Component configs
// ---------------------------------------------------------------------------

/// Datagram transport tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatagramConfig {
    /// Transmissions per message before failure is reported.
    pub max_attempts: u32,
    /// Delay between transmissions of the same message.
    pub retry_interval: Duration,
    /// Overall ceiling for one queued message.
    pub delivery_deadline: Duration,
    /// Token bucket burst size.
    pub throttle_capacity: f64,
    /// Token bucket refill rate (tokens per second).
    pub throttle_fill_rate: f64,
    /// Recent-id window size for inbound dedup.
    pub seen_cache_size: usize,
}

impl Default for DatagramConfig {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            retry_interval: DEFAULT_RETRY_INTERVAL,
            delivery_deadline: DEFAULT_DELIVERY_DEADLINE,
            throttle_capacity: DEFAULT_THROTTLE_CAPACITY,
            throttle_fill_rate: DEFAULT_THROTTLE_FILL_RATE,
            seen_cache_size: SEEN_CACHE_SIZE,
        }
    }
}

/// Chat transport tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatConfig {
    /// Server part of user ids and room aliases, e.g. `chat.example.org`.
    pub server_name: String,
    /// Long-poll timeout for each sync request.
    pub long_poll_timeout: Duration,
    /// Whether invites addressed to this node are joined automatically.
    pub auto_join: bool,
    /// Upper bound on waiting for a peer to complete the room handshake.
    pub join_timeout: Duration,
}

impl ChatConfig {
    /// Config for a node on the given homeserver, defaults elsewhere.
    pub fn new(server_name: impl Into<String>) -> Self {
        Self {
            server_name: server_name.into(),
            long_poll_timeout: SYNC_LONG_POLL_TIMEOUT,
            auto_join: true,
            join_timeout: DEFAULT_JOIN_TIMEOUT,
        }
    }
}

/// Health tracker tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    /// Interval between probe rounds. `None` disables probing.
    pub probe_interval: Option<Duration>,
    /// Capacity of the status-change broadcast channel.
    pub event_capacity: usize,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            probe_interval: Some(DEFAULT_PROBE_INTERVAL),
            event_capacity: 256,
        }
    }
}

/// Mixed transport tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MixedConfig {
    /// End-to-end ceiling for one `send`.
    pub request_timeout: Duration,
    /// Recent-id window size for cross-path dedup.
    pub seen_cache_size: usize,
}

impl Default for MixedConfig {
    fn default() -> Self {
        Self {
            request_timeout: MAX_REQUEST_TIMEOUT,
            seen_cache_size: SEEN_CACHE_SIZE,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_magic_is_ascii() {
        assert!(PROTOCOL_MAGIC.iter().all(|b| b.is_ascii_alphabetic()));
    }

    #[test]
    fn test_network_mode_parse_and_display() {
        for mode in [
            NetworkMode::NoNetwork,
            NetworkMode::UdpOnly,
            NetworkMode::ChatOnly,
            NetworkMode::Mixed,
        ] {
            assert_eq!(mode.to_string().parse::<NetworkMode>(), Ok(mode));
        }
        assert_eq!("UDP".parse::<NetworkMode>(), Ok(NetworkMode::UdpOnly));
        assert!("carrier-pigeon".parse::<NetworkMode>().is_err());
    }

    #[test]
    fn test_mobile_forces_mixed() {
        assert_eq!(NetworkMode::UdpOnly.effective(true), NetworkMode::Mixed);
        assert_eq!(NetworkMode::UdpOnly.effective(false), NetworkMode::UdpOnly);
    }

    #[test]
    fn test_timing_constants_sanity() {
        // A message must get all its attempts in before the deadline hits.
        assert!(DEFAULT_RETRY_INTERVAL * DEFAULT_MAX_ATTEMPTS < DEFAULT_DELIVERY_DEADLINE);
        assert!(DEFAULT_DELIVERY_DEADLINE < MAX_REQUEST_TIMEOUT);
        assert_eq!(SYNC_BACKOFF, Duration::from_secs(2));
        assert!(READY_ANNOUNCE_INTERVAL < DEFAULT_JOIN_TIMEOUT);
        assert!(DEFAULT_JOIN_TIMEOUT < MAX_REQUEST_TIMEOUT);
    }
}
