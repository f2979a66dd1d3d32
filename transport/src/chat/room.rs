//! Rooms and the room store.
//!
//! A [`Room`] holds last-write-wins state keyed by (event type, state key)
//! plus a short window of recent timeline events. Rooms are created lazily
//! the first time a sync batch mentions them and persisted through a
//! [`RoomStore`].
//!
//! ## Sled layout
//!
//! | Tree      | Key               | Value              |
//! |-----------|-------------------|--------------------|
//! | `rooms`   | room id (UTF-8)   | `serde_json(Room)` |
//! | `filters` | user id (UTF-8)   | filter id (UTF-8)  |
//!
//! Event content is arbitrary JSON, so rooms are stored as JSON rather
//! than bincode.

use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use sled::{Db, Tree};

use super::event::Event;
use crate::config::{MEMBER_EVENT, SYNC_TIMELINE_LIMIT};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("sled error: {0}")]
    Sled(#[from] sled::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("invalid utf-8 in stored value")]
    Utf8(#[from] std::string::FromUtf8Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

// ---------------------------------------------------------------------------
// Room
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Room {
    pub id: String,
    /// event type → state key → latest event.
    pub state: HashMap<String, HashMap<String, Event>>,
    /// Most recent timeline events, oldest first.
    pub timeline: VecDeque<Event>,
}

impl Room {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Default::default()
        }
    }

    /// Records a state event, replacing any earlier one with the same type
    /// and state key. Events without a state key are ignored.
    pub fn update_state(&mut self, event: &Event) {
        let Some(key) = &event.state_key else {
            return;
        };
        self.state
            .entry(event.event_type.clone())
            .or_default()
            .insert(key.clone(), event.clone());
    }

    pub fn get_state(&self, event_type: &str, state_key: &str) -> Option<&Event> {
        self.state.get(event_type)?.get(state_key)
    }

    /// Appends to the recent-timeline window, dropping the oldest entry
    /// once the window is full.
    pub fn push_timeline(&mut self, event: Event) {
        if self.timeline.len() >= SYNC_TIMELINE_LIMIT {
            self.timeline.pop_front();
        }
        self.timeline.push_back(event);
    }

    /// Current membership of `user_id` (`join`, `invite`, `leave`, ...).
    pub fn membership_of(&self, user_id: &str) -> Option<&str> {
        self.get_state(MEMBER_EVENT, user_id)?.membership()
    }

    /// User ids whose membership is `join`, sorted.
    pub fn joined_members(&self) -> Vec<String> {
        let mut members: Vec<String> = self
            .state
            .get(MEMBER_EVENT)
            .map(|by_key| {
                by_key
                    .iter()
                    .filter(|(_, e)| e.membership() == Some("join"))
                    .map(|(k, _)| k.clone())
                    .collect()
            })
            .unwrap_or_default();
        members.sort();
        members
    }
}

// ---------------------------------------------------------------------------
// Store trait
// ---------------------------------------------------------------------------

/// Persistence collaborator for rooms and the uploaded sync filter.
pub trait RoomStore: Send + Sync {
    fn load_room(&self, room_id: &str) -> StoreResult<Option<Room>>;

    fn save_room(&self, room: &Room) -> StoreResult<()>;

    fn load_filter_id(&self, user_id: &str) -> StoreResult<Option<String>>;

    fn save_filter_id(&self, user_id: &str, filter_id: &str) -> StoreResult<()>;
}

// ---------------------------------------------------------------------------
// In-memory store
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct MemoryRoomStore {
    rooms: RwLock<HashMap<String, Room>>,
    filters: RwLock<HashMap<String, String>>,
    saves: AtomicU64,
}

impl MemoryRoomStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of `save_room` calls so far.
    pub fn save_count(&self) -> u64 {
        self.saves.load(Ordering::Relaxed)
    }

    pub fn room_count(&self) -> usize {
        self.rooms.read().len()
    }

    pub fn room_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.rooms.read().keys().cloned().collect();
        ids.sort();
        ids
    }
}

impl RoomStore for MemoryRoomStore {
    fn load_room(&self, room_id: &str) -> StoreResult<Option<Room>> {
        Ok(self.rooms.read().get(room_id).cloned())
    }

    fn save_room(&self, room: &Room) -> StoreResult<()> {
        self.saves.fetch_add(1, Ordering::Relaxed);
        self.rooms.write().insert(room.id.clone(), room.clone());
        Ok(())
    }

    fn load_filter_id(&self, user_id: &str) -> StoreResult<Option<String>> {
        Ok(self.filters.read().get(user_id).cloned())
    }

    fn save_filter_id(&self, user_id: &str, filter_id: &str) -> StoreResult<()> {
        self.filters
            .write()
            .insert(user_id.to_string(), filter_id.to_string());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Sled store
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct SledRoomStore {
    db: Db,
    rooms: Tree,
    filters: Tree,
}

impl SledRoomStore {
    pub fn open<P: AsRef<Path>>(path: P) -> StoreResult<Self> {
        Self::from_db(sled::open(path)?)
    }

    /// Throwaway store, removed when dropped.
    pub fn open_temporary() -> StoreResult<Self> {
        Self::from_db(sled::Config::new().temporary(true).open()?)
    }

    fn from_db(db: Db) -> StoreResult<Self> {
        let rooms = db.open_tree("rooms")?;
        let filters = db.open_tree("filters")?;
        Ok(Self { db, rooms, filters })
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    pub fn flush(&self) -> StoreResult<()> {
        self.db.flush()?;
        Ok(())
    }
}

impl RoomStore for SledRoomStore {
    fn load_room(&self, room_id: &str) -> StoreResult<Option<Room>> {
        match self.rooms.get(room_id.as_bytes())? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    fn save_room(&self, room: &Room) -> StoreResult<()> {
        let bytes = serde_json::to_vec(room)?;
        self.rooms.insert(room.id.as_bytes(), bytes)?;
        Ok(())
    }

    fn load_filter_id(&self, user_id: &str) -> StoreResult<Option<String>> {
        match self.filters.get(user_id.as_bytes())? {
            Some(bytes) => Ok(Some(String::from_utf8(bytes.to_vec())?)),
            None => Ok(None),
        }
    }

    fn save_filter_id(&self, user_id: &str, filter_id: &str) -> StoreResult<()> {
        self.filters.insert(user_id.as_bytes(), filter_id.as_bytes())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn member(user: &str, membership: &str) -> Event {
        Event::new(MEMBER_EVENT, user)
            .with_state_key(user)
            .with_content("membership", membership)
    }

    #[test]
    fn state_is_last_write_wins() {
        let mut room = Room::new("!r:hs");
        room.update_state(&member("@a:hs", "invite"));
        room.update_state(&member("@a:hs", "join"));
        room.update_state(&member("@b:hs", "leave"));
        room.update_state(&Event::new("m.room.message", "@a:hs"));

        assert_eq!(room.membership_of("@a:hs"), Some("join"));
        assert_eq!(room.joined_members(), vec!["@a:hs".to_string()]);
        assert_eq!(room.state.len(), 1);
    }

    #[test]
    fn timeline_window_is_bounded() {
        let mut room = Room::new("!r:hs");
        for i in 0..(SYNC_TIMELINE_LIMIT + 5) {
            room.push_timeline(Event::new("protocol.message", "@a:hs").with_content("n", i));
        }
        assert_eq!(room.timeline.len(), SYNC_TIMELINE_LIMIT);
        assert_eq!(
            room.timeline.front().and_then(|e| e.content.get("n")),
            Some(&serde_json::json!(5))
        );
    }

    #[test]
    fn memory_store_counts_saves() {
        let store = MemoryRoomStore::new();
        assert!(store.load_room("!r:hs").unwrap().is_none());
        store.save_room(&Room::new("!r:hs")).unwrap();
        assert_eq!(store.save_count(), 1);
        assert_eq!(store.room_ids(), vec!["!r:hs".to_string()]);
    }

    #[test]
    fn sled_store_persists_across_reopen() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut room = Room::new("!persist:hs");
        room.update_state(&member("@a:hs", "join"));
        room.push_timeline(Event::new("protocol.message", "@b:hs").with_content("payload", "00ff"));

        {
            let store = SledRoomStore::open(dir.path()).unwrap();
            store.save_room(&room).unwrap();
            store.save_filter_id("@a:hs", "filter-1").unwrap();
            store.flush().unwrap();
        }

        let store = SledRoomStore::open(dir.path()).unwrap();
        assert_eq!(store.load_room("!persist:hs").unwrap(), Some(room));
        assert_eq!(
            store.load_filter_id("@a:hs").unwrap().as_deref(),
            Some("filter-1")
        );
        assert!(store.load_filter_id("@nobody:hs").unwrap().is_none());
        assert_eq!(store.room_count(), 1);
    }
}
