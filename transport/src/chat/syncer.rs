//! # Sync Batch Processing
//!
//! A [`Syncer`] turns one incremental sync batch into room updates and
//! listener callbacks. [`DefaultSyncer`] is the only implementation the
//! node uses; the trait exists so the sync loop can be driven by a test
//! double.
//!
//! ## Processing a batch
//!
//! 1. An empty `since` cursor means this is the baseline round: nothing is
//!    applied or dispatched. Backlog that predates this node's observation
//!    is dropped on purpose so stale protocol messages are never replayed.
//! 2. Self-join filter: any joined room whose timeline contains this
//!    user's own `join` membership event is removed from both the joined
//!    and invited sections. The room's whole contribution to the batch
//!    goes with it, including unrelated events in the same round.
//! 3. Dispatch, in order: presence, account data, joined rooms (state
//!    events update the room and dispatch; timeline events dispatch),
//!    invited rooms (state events update and dispatch), left rooms (only
//!    events carrying a state key update and dispatch).
//!
//! Listeners run synchronously on the sync worker in registration order.
//! Event types without listeners are ignored. A panic anywhere in steps
//! 2-3 is caught and returned as [`SyncError::Panicked`].

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tracing::{debug, trace};

use super::backend::BackendError;
use super::event::{Event, SyncBatch};
use super::room::{Room, RoomStore, StoreError};
use crate::config::{MEMBER_EVENT, SYNC_BACKOFF};
use crate::error::panic_message;

/// Sync filter uploaded once per user: 50 timeline events per room per
/// round.
pub const FILTER_JSON: &str = r#"{"room":{"timeline":{"limit":50}}}"#;

/// Callback for one event type.
pub type EventListener = Arc<dyn Fn(&Event) + Send + Sync>;

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    /// A listener or the processing itself panicked.
    #[error("process_response panicked: user_id={user_id} since={since} panic={message}\n{backtrace}")]
    Panicked {
        user_id: String,
        since: String,
        message: String,
        backtrace: String,
    },

    #[error("room store failed: user_id={user_id} since={since}: {source}")]
    Store {
        user_id: String,
        since: String,
        #[source]
        source: StoreError,
    },

    #[error("backend: {0}")]
    Backend(#[from] BackendError),
}

pub trait Syncer: Send + Sync {
    /// Applies `batch`, which was fetched with cursor `since`. May remove
    /// rooms from the batch (see the self-join filter).
    fn process_response(&self, batch: &mut SyncBatch, since: &str) -> Result<(), SyncError>;

    /// How long to wait before the next sync after a failed one. An `Err`
    /// stops the sync loop.
    fn on_failed_sync(
        &self,
        batch: Option<&SyncBatch>,
        err: &(dyn std::error::Error + Send + Sync),
    ) -> Result<Duration, SyncError>;

    /// Filter definition to upload for `user_id`.
    fn filter_json(&self, user_id: &str) -> String;
}

pub struct DefaultSyncer {
    user_id: String,
    store: Arc<dyn RoomStore>,
    listeners: RwLock<HashMap<String, Vec<EventListener>>>,
}

impl DefaultSyncer {
    pub fn new(user_id: impl Into<String>, store: Arc<dyn RoomStore>) -> Self {
        Self {
            user_id: user_id.into(),
            store,
            listeners: RwLock::new(HashMap::new()),
        }
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn store(&self) -> &Arc<dyn RoomStore> {
        &self.store
    }

    /// Adds a listener for `event_type`. Append-only: no duplicate check,
    /// no removal.
    pub fn on_event_type<F>(&self, event_type: impl Into<String>, listener: F)
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.listeners
            .write()
            .entry(event_type.into())
            .or_default()
            .push(Arc::new(listener));
    }

    pub fn listener_count(&self, event_type: &str) -> usize {
        self.listeners
            .read()
            .get(event_type)
            .map(Vec::len)
            .unwrap_or(0)
    }

    fn notify_listeners(&self, event: &Event) {
        // Cloned out so a listener may register further listeners.
        let listeners = match self.listeners.read().get(&event.event_type) {
            Some(l) => l.clone(),
            None => return,
        };
        for listener in listeners {
            listener(event);
        }
    }

    /// Returns `false` for the baseline round. Otherwise applies the
    /// self-join filter to `batch` and returns `true`.
    fn should_process_response(&self, batch: &mut SyncBatch, since: &str) -> bool {
        if since.is_empty() {
            return false;
        }

        let self_joined: Vec<String> = batch
            .rooms
            .join
            .iter()
            .filter(|(_, room)| {
                room.timeline.events.iter().rev().any(|e| {
                    e.event_type == MEMBER_EVENT
                        && e.state_key.as_deref() == Some(self.user_id.as_str())
                        && e.membership() == Some("join")
                })
            })
            .map(|(id, _)| id.clone())
            .collect();

        for room_id in self_joined {
            debug!(room = %room_id, "own join in timeline, skipping room for this batch");
            batch.rooms.join.remove(&room_id);
            batch.rooms.invite.remove(&room_id);
        }
        true
    }

    /// Loads a room, creating and persisting it on first reference.
    fn get_or_create_room(&self, room_id: &str) -> Result<Room, StoreError> {
        if let Some(room) = self.store.load_room(room_id)? {
            return Ok(room);
        }
        let room = Room::new(room_id);
        self.store.save_room(&room)?;
        trace!(room = %room_id, "room created");
        Ok(room)
    }

    fn apply(&self, batch: &mut SyncBatch) -> Result<(), StoreError> {
        for event in &batch.presence.events {
            self.notify_listeners(event);
        }
        for event in &batch.account_data.events {
            self.notify_listeners(event);
        }

        for (room_id, data) in batch.rooms.join.iter_mut() {
            let mut room = self.get_or_create_room(room_id)?;
            for event in data.state.events.iter_mut() {
                event.room_id = Some(room_id.clone());
                room.update_state(event);
                self.notify_listeners(event);
            }
            for event in data.timeline.events.iter_mut() {
                event.room_id = Some(room_id.clone());
                self.notify_listeners(event);
                room.push_timeline(event.clone());
            }
            self.store.save_room(&room)?;
        }

        for (room_id, data) in batch.rooms.invite.iter_mut() {
            let mut room = self.get_or_create_room(room_id)?;
            for event in data.state.events.iter_mut() {
                event.room_id = Some(room_id.clone());
                room.update_state(event);
                self.notify_listeners(event);
            }
            self.store.save_room(&room)?;
        }

        for (room_id, data) in batch.rooms.leave.iter_mut() {
            let mut room = self.get_or_create_room(room_id)?;
            for event in data.timeline.events.iter_mut() {
                if event.state_key.is_some() {
                    event.room_id = Some(room_id.clone());
                    room.update_state(event);
                    self.notify_listeners(event);
                }
            }
            self.store.save_room(&room)?;
        }
        Ok(())
    }
}

impl Syncer for DefaultSyncer {
    fn process_response(&self, batch: &mut SyncBatch, since: &str) -> Result<(), SyncError> {
        let outcome = catch_unwind(AssertUnwindSafe(|| {
            if !self.should_process_response(batch, since) {
                return Ok(());
            }
            self.apply(batch)
        }));

        match outcome {
            Ok(Ok(())) => Ok(()),
            Ok(Err(source)) => Err(SyncError::Store {
                user_id: self.user_id.clone(),
                since: since.to_string(),
                source,
            }),
            Err(panic) => Err(SyncError::Panicked {
                user_id: self.user_id.clone(),
                since: since.to_string(),
                message: panic_message(&*panic),
                backtrace: std::backtrace::Backtrace::force_capture().to_string(),
            }),
        }
    }

    fn on_failed_sync(
        &self,
        _batch: Option<&SyncBatch>,
        _err: &(dyn std::error::Error + Send + Sync),
    ) -> Result<Duration, SyncError> {
        Ok(SYNC_BACKOFF)
    }

    fn filter_json(&self, _user_id: &str) -> String {
        FILTER_JSON.to_string()
    }
}
