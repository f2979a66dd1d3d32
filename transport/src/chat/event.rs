//! Chat backend wire model: events and incremental sync batches.
//!
//! Field names follow the backend's client-server JSON. Everything is
//! defaulted so a sparse or partial response still decodes; a batch that
//! omits `rooms` simply has no room updates.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// One room or account event.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Event {
    #[serde(rename = "type")]
    pub event_type: String,
    /// Absent on the wire inside per-room sections; filled in by the
    /// syncer before dispatch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room_id: Option<String>,
    #[serde(default)]
    pub sender: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub event_id: String,
    /// Present on state events only. `Some("")` is a valid state key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_key: Option<String>,
    #[serde(default)]
    pub content: Map<String, Value>,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub origin_server_ts: u64,
}

fn is_zero(v: &u64) -> bool {
    *v == 0
}

impl Event {
    pub fn new(event_type: impl Into<String>, sender: impl Into<String>) -> Self {
        Self {
            event_type: event_type.into(),
            sender: sender.into(),
            ..Default::default()
        }
    }

    pub fn with_state_key(mut self, key: impl Into<String>) -> Self {
        self.state_key = Some(key.into());
        self
    }

    pub fn with_content(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.content.insert(key.into(), value.into());
        self
    }

    pub fn is_state(&self) -> bool {
        self.state_key.is_some()
    }

    /// `content.<key>` as a string, if it is one.
    pub fn content_str(&self, key: &str) -> Option<&str> {
        self.content.get(key).and_then(Value::as_str)
    }

    /// `content.membership` of an `m.room.member` event.
    pub fn membership(&self) -> Option<&str> {
        self.content_str("membership")
    }
}

/// `{"events": [...]}` wrapper used throughout the sync response.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct EventList {
    #[serde(default)]
    pub events: Vec<Event>,
}

impl From<Vec<Event>> for EventList {
    fn from(events: Vec<Event>) -> Self {
        Self { events }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct JoinedRoom {
    #[serde(default)]
    pub state: EventList,
    #[serde(default)]
    pub timeline: EventList,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct InvitedRoom {
    #[serde(default, rename = "invite_state")]
    pub state: EventList,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct LeftRoom {
    #[serde(default)]
    pub timeline: EventList,
}

/// Room sections of a batch, keyed by room id. Ordered maps keep dispatch
/// order deterministic.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Rooms {
    #[serde(default)]
    pub join: BTreeMap<String, JoinedRoom>,
    #[serde(default)]
    pub invite: BTreeMap<String, InvitedRoom>,
    #[serde(default)]
    pub leave: BTreeMap<String, LeftRoom>,
}

/// One incremental sync response.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SyncBatch {
    /// Cursor to pass as `since` on the next request.
    #[serde(default)]
    pub next_batch: String,
    #[serde(default)]
    pub presence: EventList,
    #[serde(default)]
    pub account_data: EventList,
    #[serde(default)]
    pub rooms: Rooms,
}

impl SyncBatch {
    /// Number of events of every kind in the batch.
    pub fn event_count(&self) -> usize {
        let rooms = &self.rooms;
        self.presence.events.len()
            + self.account_data.events.len()
            + rooms
                .join
                .values()
                .map(|r| r.state.events.len() + r.timeline.events.len())
                .sum::<usize>()
            + rooms.invite.values().map(|r| r.state.events.len()).sum::<usize>()
            + rooms.leave.values().map(|r| r.timeline.events.len()).sum::<usize>()
    }
}
