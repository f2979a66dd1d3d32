//! # Chat Path
//!
//! Protocol messages ride a federated chat backend as timeline events in
//! a private two-member room per peer pair.
//!
//! | Module      | Role                                              |
//! |-------------|---------------------------------------------------|
//! | `event`     | Sync batch and event wire model                   |
//! | `backend`   | [`ChatBackend`] trait and its error type          |
//! | `http`      | Client-server HTTP implementation                 |
//! | `memory`    | In-process homeserver for tests and scenarios     |
//! | `room`      | Room state and [`RoomStore`] (memory / sled)      |
//! | `syncer`    | Batch processing and listener dispatch            |
//! | `sync_loop` | Long-poll worker with backoff                     |
//! | `transport` | [`ChatTransport`]: the `Transport` on top         |

pub mod backend;
pub mod event;
pub mod http;
pub mod memory;
pub mod room;
pub mod sync_loop;
pub mod syncer;
pub mod transport;

pub use backend::{BackendError, ChatBackend, Presence};
pub use event::{Event, SyncBatch};
pub use http::HttpBackend;
pub use memory::{MemoryBackend, MemoryHomeserver};
pub use room::{MemoryRoomStore, Room, RoomStore, SledRoomStore, StoreError};
pub use sync_loop::{SyncLoop, SyncState};
pub use syncer::{DefaultSyncer, EventListener, SyncError, Syncer, FILTER_JSON};
pub use transport::{address_from_user_id, room_alias_localpart, user_id_for, ChatTransport};
