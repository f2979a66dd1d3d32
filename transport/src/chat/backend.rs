//! The federated chat backend, as seen by this node.
//!
//! One logged-in user per backend instance. Implemented over HTTP by
//! [`HttpBackend`](super::http::HttpBackend) and in-process by
//! [`MemoryBackend`](super::memory::MemoryBackend).

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::event::SyncBatch;

/// Request-level failures from the chat backend.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BackendError {
    /// Transport-level failure: connect, timeout, TLS.
    #[error("request failed: {0}")]
    Http(String),

    /// The server answered with an error status.
    #[error("server returned {status} {errcode}: {message}")]
    Status {
        status: u16,
        errcode: String,
        message: String,
    },

    /// The requested room alias is already taken.
    #[error("room alias already in use")]
    RoomInUse,

    /// Caller is not allowed to do that (not joined, not invited).
    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// The peer did not complete the room handshake in time.
    #[error("peer has not joined room {0}")]
    PeerNotJoined(String),

    /// The response body did not match the expected shape.
    #[error("malformed response: {0}")]
    Decode(String),

    /// The server is down or refusing service.
    #[error("backend unavailable")]
    Unavailable,
}

impl BackendError {
    /// Whether a later retry of the same request could succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            BackendError::Http(_) | BackendError::Unavailable | BackendError::PeerNotJoined(_) => {
                true
            }
            BackendError::Status { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }
}

/// Presence states we publish.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Presence {
    Online,
    Unavailable,
    Offline,
}

impl Presence {
    pub fn as_str(self) -> &'static str {
        match self {
            Presence::Online => "online",
            Presence::Unavailable => "unavailable",
            Presence::Offline => "offline",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "online" => Some(Presence::Online),
            "unavailable" => Some(Presence::Unavailable),
            "offline" => Some(Presence::Offline),
            _ => None,
        }
    }
}

impl fmt::Display for Presence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[async_trait]
pub trait ChatBackend: Send + Sync {
    /// Fully qualified id of the logged-in user, e.g. `@ab12..:hs.example`.
    fn user_id(&self) -> &str;

    /// Uploads a sync filter. Returns its id.
    async fn create_filter(&self, filter_json: &str) -> Result<String, BackendError>;

    /// One incremental sync request. `since = None` asks for the initial
    /// snapshot. Long-polls up to `timeout` when nothing is new.
    async fn sync(
        &self,
        since: Option<&str>,
        filter_id: Option<&str>,
        timeout: Duration,
    ) -> Result<SyncBatch, BackendError>;

    /// Publishes one timeline event. `txn_id` makes retries idempotent.
    /// Returns the event id.
    async fn send_event(
        &self,
        room_id: &str,
        event_type: &str,
        content: &Map<String, Value>,
        txn_id: &str,
    ) -> Result<String, BackendError>;

    /// Room id for a full alias (`#local:server`), `None` if unassigned.
    async fn resolve_alias(&self, alias: &str) -> Result<Option<String>, BackendError>;

    /// Creates a private room with the given alias localpart, inviting
    /// `invite`. Fails with [`BackendError::RoomInUse`] if the alias exists.
    async fn create_room(
        &self,
        alias_localpart: &str,
        invite: &[String],
    ) -> Result<String, BackendError>;

    /// Joins a room by id or alias. Joining a room already joined succeeds.
    async fn join_room(&self, room_id_or_alias: &str) -> Result<String, BackendError>;

    async fn set_presence(&self, presence: Presence) -> Result<(), BackendError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_errors() {
        assert!(BackendError::Unavailable.is_transient());
        assert!(BackendError::Status {
            status: 502,
            errcode: "M_UNKNOWN".into(),
            message: String::new()
        }
        .is_transient());
        assert!(!BackendError::RoomInUse.is_transient());
        assert!(!BackendError::Forbidden("x".into()).is_transient());
        assert!(BackendError::PeerNotJoined("!r:hs".into()).is_transient());
    }

    #[test]
    fn presence_strings() {
        for p in [Presence::Online, Presence::Unavailable, Presence::Offline] {
            assert_eq!(Presence::parse(p.as_str()), Some(p));
        }
        assert_eq!(Presence::parse("busy"), None);
    }
}
