//! In-process chat homeserver.
//!
//! Models just enough of a federated chat server for two or more nodes to
//! talk through it in one process: rooms with aliases, invite → join
//! membership, timeline events, presence, cursor-based incremental sync
//! with long-polling, and switches to make requests fail.
//!
//! Visibility rule: a member sees timeline events from its own join event
//! onwards. Invited users see only the invite itself.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{Map, Value};
use tokio::sync::Notify;
use tokio::time::Instant;

use super::backend::{BackendError, ChatBackend, Presence};
use super::event::{Event, EventList, InvitedRoom, JoinedRoom, LeftRoom, SyncBatch};
use crate::config::{MEMBER_EVENT, PRESENCE_EVENT, SYNC_TIMELINE_LIMIT};

#[derive(Debug, Default)]
struct HsRoom {
    /// user id → (membership, seq of the membership event)
    members: BTreeMap<String, (String, u64)>,
    /// (seq, event), in order.
    timeline: Vec<(u64, Event)>,
}

#[derive(Debug, Default)]
struct HsState {
    seq: u64,
    next_room: u64,
    next_filter: u64,
    rooms: BTreeMap<String, HsRoom>,
    aliases: HashMap<String, String>,
    presence: Vec<(u64, Event)>,
    txns: HashMap<(String, String), String>,
}

impl HsState {
    fn bump(&mut self) -> u64 {
        self.seq += 1;
        self.seq
    }

    fn append(&mut self, room_id: &str, mut event: Event) -> Option<String> {
        let seq = self.bump();
        event.event_id = format!("${seq}");
        event.origin_server_ts = seq;
        let room = self.rooms.get_mut(room_id)?;
        if event.event_type == MEMBER_EVENT {
            if let (Some(key), Some(m)) = (event.state_key.clone(), event.membership()) {
                room.members.insert(key, (m.to_string(), seq));
            }
        }
        let id = event.event_id.clone();
        room.timeline.push((seq, event));
        Some(id)
    }

    fn membership(&self, room_id: &str, user_id: &str) -> Option<(&str, u64)> {
        let (m, seq) = self.rooms.get(room_id)?.members.get(user_id)?;
        Some((m.as_str(), *seq))
    }

    /// Everything `user_id` should see after cursor `since`.
    fn collect(&self, user_id: &str, since: u64) -> SyncBatch {
        let mut batch = SyncBatch {
            next_batch: format!("s{}", self.seq),
            ..Default::default()
        };

        batch.presence.events = self
            .presence
            .iter()
            .filter(|(seq, _)| *seq > since)
            .map(|(_, e)| e.clone())
            .collect();

        for (room_id, room) in &self.rooms {
            let Some((membership, member_seq)) = room.members.get(user_id) else {
                continue;
            };
            match membership.as_str() {
                "join" => {
                    let from = since.max(member_seq.saturating_sub(1));
                    let mut events: Vec<Event> = room
                        .timeline
                        .iter()
                        .filter(|(seq, _)| *seq > from)
                        .map(|(_, e)| without_room_id(e))
                        .collect();
                    if events.is_empty() {
                        continue;
                    }
                    if events.len() > SYNC_TIMELINE_LIMIT {
                        events.drain(..events.len() - SYNC_TIMELINE_LIMIT);
                    }
                    batch.rooms.join.insert(
                        room_id.clone(),
                        JoinedRoom {
                            state: EventList::default(),
                            timeline: events.into(),
                        },
                    );
                }
                "invite" if *member_seq > since => {
                    let invite = room
                        .timeline
                        .iter()
                        .find(|(seq, _)| seq == member_seq)
                        .map(|(_, e)| without_room_id(e));
                    batch.rooms.invite.insert(
                        room_id.clone(),
                        InvitedRoom {
                            state: invite.into_iter().collect::<Vec<_>>().into(),
                        },
                    );
                }
                "leave" if *member_seq > since => {
                    let events: Vec<Event> = room
                        .timeline
                        .iter()
                        .filter(|(seq, _)| *seq > since && seq <= member_seq)
                        .map(|(_, e)| without_room_id(e))
                        .collect();
                    batch.rooms.leave.insert(
                        room_id.clone(),
                        LeftRoom {
                            timeline: events.into(),
                        },
                    );
                }
                _ => {}
            }
        }
        batch
    }
}

fn without_room_id(e: &Event) -> Event {
    Event {
        room_id: None,
        ..e.clone()
    }
}

fn parse_cursor(since: &str) -> Result<u64, BackendError> {
    since
        .strip_prefix('s')
        .and_then(|n| n.parse().ok())
        .ok_or_else(|| BackendError::Status {
            status: 400,
            errcode: "M_INVALID_PARAM".into(),
            message: format!("bad since token {since}"),
        })
}

/// The shared server. Hand each node its own [`MemoryBackend`] via
/// [`MemoryHomeserver::login`].
pub struct MemoryHomeserver {
    server_name: String,
    state: Mutex<HsState>,
    changed: Notify,
    offline: AtomicBool,
    fail_sends: AtomicBool,
    fail_syncs: AtomicU32,
}

impl MemoryHomeserver {
    pub fn new(server_name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            server_name: server_name.into(),
            state: Mutex::new(HsState::default()),
            changed: Notify::new(),
            offline: AtomicBool::new(false),
            fail_sends: AtomicBool::new(false),
            fail_syncs: AtomicU32::new(0),
        })
    }

    pub fn server_name(&self) -> &str {
        &self.server_name
    }

    /// A backend session for `user_id`.
    pub fn login(self: &Arc<Self>, user_id: impl Into<String>) -> Arc<MemoryBackend> {
        Arc::new(MemoryBackend {
            server: Arc::clone(self),
            user_id: user_id.into(),
        })
    }

    /// Every request fails with `Unavailable` while set.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::Relaxed);
        self.changed.notify_waiters();
    }

    /// `send_event` fails with a 500 while set.
    pub fn set_fail_sends(&self, fail: bool) {
        self.fail_sends.store(fail, Ordering::Relaxed);
    }

    /// The next `n` sync requests fail.
    pub fn fail_next_syncs(&self, n: u32) {
        self.fail_syncs.store(n, Ordering::Relaxed);
    }

    pub fn membership(&self, room_id: &str, user_id: &str) -> Option<String> {
        self.state
            .lock()
            .membership(room_id, user_id)
            .map(|(m, _)| m.to_string())
    }

    pub fn is_joined(&self, room_id: &str, user_id: &str) -> bool {
        self.membership(room_id, user_id).as_deref() == Some("join")
    }

    pub fn resolve(&self, alias: &str) -> Option<String> {
        self.state.lock().aliases.get(alias).cloned()
    }

    pub fn room_count(&self) -> usize {
        self.state.lock().rooms.len()
    }

    /// Events of `event_type` in a room's timeline.
    pub fn count_events(&self, room_id: &str, event_type: &str) -> usize {
        self.state
            .lock()
            .rooms
            .get(room_id)
            .map(|r| {
                r.timeline
                    .iter()
                    .filter(|(_, e)| e.event_type == event_type)
                    .count()
            })
            .unwrap_or(0)
    }

    fn check_online(&self) -> Result<(), BackendError> {
        if self.offline.load(Ordering::Relaxed) {
            Err(BackendError::Unavailable)
        } else {
            Ok(())
        }
    }

    fn forbidden(msg: impl Into<String>) -> BackendError {
        BackendError::Forbidden(msg.into())
    }

    fn member_event(sender: &str, target: &str, membership: &str) -> Event {
        Event::new(MEMBER_EVENT, sender)
            .with_state_key(target)
            .with_content("membership", membership)
    }

    async fn sync_for(
        &self,
        user_id: &str,
        since: Option<&str>,
        timeout: Duration,
    ) -> Result<SyncBatch, BackendError> {
        self.check_online()?;
        let consumed = self
            .fail_syncs
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
        if consumed.is_ok() {
            return Err(BackendError::Status {
                status: 502,
                errcode: "M_UNKNOWN".into(),
                message: "injected sync failure".into(),
            });
        }

        let Some(since) = since else {
            // Initial snapshot: cursor only, plus current invites.
            let state = self.state.lock();
            let mut batch = state.collect(user_id, 0);
            batch.rooms.join.clear();
            batch.rooms.leave.clear();
            return Ok(batch);
        };
        let since = parse_cursor(since)?;
        let deadline = Instant::now() + timeout;

        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let state = self.state.lock();
                let batch = state.collect(user_id, since);
                if state.seq > since && batch.event_count() > 0 {
                    return Ok(batch);
                }
                if Instant::now() >= deadline {
                    return Ok(batch);
                }
            }

            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep_until(deadline) => {}
            }
            self.check_online()?;
        }
    }

    fn send_event_for(
        &self,
        user_id: &str,
        room_id: &str,
        event_type: &str,
        content: &Map<String, Value>,
        txn_id: &str,
    ) -> Result<String, BackendError> {
        self.check_online()?;
        if self.fail_sends.load(Ordering::Relaxed) {
            return Err(BackendError::Status {
                status: 500,
                errcode: "M_UNKNOWN".into(),
                message: "injected send failure".into(),
            });
        }

        let mut state = self.state.lock();
        let key = (user_id.to_string(), txn_id.to_string());
        if let Some(event_id) = state.txns.get(&key) {
            return Ok(event_id.clone());
        }
        match state.membership(room_id, user_id) {
            Some(("join", _)) => {}
            None if !state.rooms.contains_key(room_id) => {
                return Err(BackendError::NotFound(room_id.to_string()))
            }
            _ => return Err(Self::forbidden(format!("{user_id} not in {room_id}"))),
        }

        let event = Event {
            event_type: event_type.to_string(),
            sender: user_id.to_string(),
            content: content.clone(),
            ..Default::default()
        };
        let event_id = state
            .append(room_id, event)
            .ok_or_else(|| BackendError::NotFound(room_id.to_string()))?;
        state.txns.insert(key, event_id.clone());
        drop(state);
        self.changed.notify_waiters();
        Ok(event_id)
    }

    fn create_room_for(
        &self,
        user_id: &str,
        alias_localpart: &str,
        invite: &[String],
    ) -> Result<String, BackendError> {
        self.check_online()?;
        let alias = format!("#{}:{}", alias_localpart, self.server_name);
        let mut state = self.state.lock();
        if state.aliases.contains_key(&alias) {
            return Err(BackendError::RoomInUse);
        }

        state.next_room += 1;
        let room_id = format!("!{}:{}", state.next_room, self.server_name);
        state.rooms.insert(room_id.clone(), HsRoom::default());
        state.aliases.insert(alias, room_id.clone());
        state.append(&room_id, Self::member_event(user_id, user_id, "join"));
        for invitee in invite {
            state.append(&room_id, Self::member_event(user_id, invitee, "invite"));
        }
        drop(state);
        self.changed.notify_waiters();
        Ok(room_id)
    }

    fn join_room_for(&self, user_id: &str, room_id_or_alias: &str) -> Result<String, BackendError> {
        self.check_online()?;
        let mut state = self.state.lock();
        let room_id = if room_id_or_alias.starts_with('#') {
            state
                .aliases
                .get(room_id_or_alias)
                .cloned()
                .ok_or_else(|| BackendError::NotFound(room_id_or_alias.to_string()))?
        } else {
            room_id_or_alias.to_string()
        };

        match state.membership(&room_id, user_id) {
            Some(("join", _)) => return Ok(room_id),
            Some(("invite", _)) => {}
            _ if !state.rooms.contains_key(&room_id) => {
                return Err(BackendError::NotFound(room_id))
            }
            _ => return Err(Self::forbidden(format!("{user_id} not invited to {room_id}"))),
        }
        state.append(&room_id, Self::member_event(user_id, user_id, "join"));
        drop(state);
        self.changed.notify_waiters();
        Ok(room_id)
    }

    fn leave_room_for(&self, user_id: &str, room_id: &str) -> Result<(), BackendError> {
        self.check_online()?;
        let mut state = self.state.lock();
        if state.membership(room_id, user_id).is_none() {
            return Err(BackendError::NotFound(room_id.to_string()));
        }
        state.append(room_id, Self::member_event(user_id, user_id, "leave"));
        drop(state);
        self.changed.notify_waiters();
        Ok(())
    }

    fn set_presence_for(&self, user_id: &str, presence: Presence) -> Result<(), BackendError> {
        self.check_online()?;
        let mut state = self.state.lock();
        let seq = state.bump();
        let event = Event::new(PRESENCE_EVENT, user_id).with_content("presence", presence.as_str());
        state.presence.push((seq, event));
        drop(state);
        self.changed.notify_waiters();
        Ok(())
    }
}

/// One user's session on a [`MemoryHomeserver`].
pub struct MemoryBackend {
    server: Arc<MemoryHomeserver>,
    user_id: String,
}

impl MemoryBackend {
    pub fn server(&self) -> &Arc<MemoryHomeserver> {
        &self.server
    }

    pub fn leave_room(&self, room_id: &str) -> Result<(), BackendError> {
        self.server.leave_room_for(&self.user_id, room_id)
    }
}

#[async_trait]
impl ChatBackend for MemoryBackend {
    fn user_id(&self) -> &str {
        &self.user_id
    }

    async fn create_filter(&self, _filter_json: &str) -> Result<String, BackendError> {
        self.server.check_online()?;
        let mut state = self.server.state.lock();
        state.next_filter += 1;
        Ok(format!("f{}", state.next_filter))
    }

    async fn sync(
        &self,
        since: Option<&str>,
        _filter_id: Option<&str>,
        timeout: Duration,
    ) -> Result<SyncBatch, BackendError> {
        self.server.sync_for(&self.user_id, since, timeout).await
    }

    async fn send_event(
        &self,
        room_id: &str,
        event_type: &str,
        content: &Map<String, Value>,
        txn_id: &str,
    ) -> Result<String, BackendError> {
        self.server
            .send_event_for(&self.user_id, room_id, event_type, content, txn_id)
    }

    async fn resolve_alias(&self, alias: &str) -> Result<Option<String>, BackendError> {
        self.server.check_online()?;
        Ok(self.server.resolve(alias))
    }

    async fn create_room(
        &self,
        alias_localpart: &str,
        invite: &[String],
    ) -> Result<String, BackendError> {
        self.server
            .create_room_for(&self.user_id, alias_localpart, invite)
    }

    async fn join_room(&self, room_id_or_alias: &str) -> Result<String, BackendError> {
        self.server.join_room_for(&self.user_id, room_id_or_alias)
    }

    async fn set_presence(&self, presence: Presence) -> Result<(), BackendError> {
        self.server.set_presence_for(&self.user_id, presence)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const A: &str = "@a:hs";
    const B: &str = "@b:hs";

    fn content(id: &str) -> Map<String, Value> {
        let mut m = Map::new();
        m.insert("id".into(), Value::from(id));
        m
    }

    #[tokio::test]
    async fn invite_join_and_timeline_visibility() {
        let hs = MemoryHomeserver::new("hs");
        let a = hs.login(A);
        let b = hs.login(B);

        let base = b.sync(None, None, Duration::ZERO).await.unwrap().next_batch;
        let room = a.create_room("pair", &[B.to_string()]).await.unwrap();
        a.send_event(&room, "protocol.message", &content("early"), "t1")
            .await
            .unwrap();

        // B is only invited: no timeline yet.
        let batch = b.sync(Some(&base), None, Duration::ZERO).await.unwrap();
        assert!(batch.rooms.join.is_empty());
        let invite = &batch.rooms.invite[&room].state.events[0];
        assert_eq!(invite.state_key.as_deref(), Some(B));
        assert_eq!(invite.membership(), Some("invite"));

        // Not a member yet, so B cannot post.
        assert!(matches!(
            b.send_event(&room, "protocol.message", &content("x"), "t1").await,
            Err(BackendError::Forbidden(_))
        ));

        b.join_room(&room).await.unwrap();
        assert!(hs.is_joined(&room, B));
        a.send_event(&room, "protocol.message", &content("late"), "t2")
            .await
            .unwrap();

        let batch = b
            .sync(Some(&batch.next_batch), None, Duration::ZERO)
            .await
            .unwrap();
        let tl = &batch.rooms.join[&room].timeline.events;
        // Own join first, then the later message; the early one stays hidden.
        assert_eq!(tl.len(), 2);
        assert_eq!(tl[0].membership(), Some("join"));
        assert_eq!(tl[1].content_str("id"), Some("late"));
    }

    #[tokio::test]
    async fn alias_collision_and_idempotent_txn() {
        let hs = MemoryHomeserver::new("hs");
        let a = hs.login(A);
        let b = hs.login(B);
        let room = a.create_room("pair", &[B.to_string()]).await.unwrap();
        assert_eq!(
            b.create_room("pair", &[A.to_string()]).await,
            Err(BackendError::RoomInUse)
        );
        assert_eq!(
            b.resolve_alias("#pair:hs").await.unwrap().as_deref(),
            Some(room.as_str())
        );
        assert_eq!(b.join_room("#pair:hs").await.unwrap(), room);
        assert_eq!(b.join_room(&room).await.unwrap(), room);

        let e1 = a.send_event(&room, "t", &content("1"), "same").await.unwrap();
        let e2 = a.send_event(&room, "t", &content("1"), "same").await.unwrap();
        assert_eq!(e1, e2);
        assert_eq!(hs.count_events(&room, "t"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn long_poll_wakes_on_new_event() {
        let hs = MemoryHomeserver::new("hs");
        let a = hs.login(A);
        let b = hs.login(B);
        let room = a.create_room("pair", &[B.to_string()]).await.unwrap();
        b.join_room(&room).await.unwrap();
        let cursor = b.sync(None, None, Duration::ZERO).await.unwrap().next_batch;

        let poll = tokio::spawn({
            let b = Arc::clone(&b);
            async move { b.sync(Some(&cursor), None, Duration::from_secs(30)).await }
        });
        tokio::task::yield_now().await;
        a.send_event(&room, "protocol.message", &content("wake"), "t")
            .await
            .unwrap();

        let batch = poll.await.unwrap().unwrap();
        assert_eq!(batch.rooms.join[&room].timeline.events.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn long_poll_times_out_empty() {
        let hs = MemoryHomeserver::new("hs");
        let b = hs.login(B);
        let cursor = b.sync(None, None, Duration::ZERO).await.unwrap().next_batch;
        let started = Instant::now();
        let batch = b
            .sync(Some(&cursor), None, Duration::from_secs(30))
            .await
            .unwrap();
        assert_eq!(batch.event_count(), 0);
        assert_eq!(batch.next_batch, cursor);
        assert!(started.elapsed() >= Duration::from_secs(30));
    }

    #[tokio::test]
    async fn failure_switches() {
        let hs = MemoryHomeserver::new("hs");
        let a = hs.login(A);
        hs.fail_next_syncs(1);
        assert!(a.sync(None, None, Duration::ZERO).await.is_err());
        assert!(a.sync(None, None, Duration::ZERO).await.is_ok());

        hs.set_offline(true);
        assert_eq!(
            a.set_presence(Presence::Online).await,
            Err(BackendError::Unavailable)
        );
        hs.set_offline(false);
        let room = a.create_room("solo", &[]).await.unwrap();
        hs.set_fail_sends(true);
        assert!(a.send_event(&room, "t", &Map::new(), "x").await.is_err());
    }
}
