//! # Sync Loop
//!
//! The long-running worker that keeps a node's view of the chat backend
//! current:
//!
//! ```text
//!   Idle ─► Syncing ─┬─► ProcessingBatch ─┬─► Syncing ...
//!                    │                    └─► Backoff ─► Syncing ...
//!                    └─► Backoff ─► Syncing ...
//!   (any) ─► Stopped            on shutdown
//! ```
//!
//! Each round long-polls the backend, hands the batch to the [`Syncer`] on
//! this same task, then loops. The cursor moves to the batch's
//! `next_batch` even when processing fails, so one poisoned batch is
//! skipped instead of replayed forever. Failures of any kind back off for
//! whatever [`Syncer::on_failed_sync`] says and try again.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use super::backend::ChatBackend;
use super::event::SyncBatch;
use super::room::RoomStore;
use super::syncer::{SyncError, Syncer};
use crate::stats::TransportStats;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    Idle,
    Syncing,
    ProcessingBatch,
    Backoff,
    Stopped,
}

pub struct SyncLoop {
    backend: Arc<dyn ChatBackend>,
    syncer: Arc<dyn Syncer>,
    store: Arc<dyn RoomStore>,
    stats: Arc<TransportStats>,
    long_poll_timeout: Duration,
    since: RwLock<String>,
    state: watch::Sender<SyncState>,
}

impl SyncLoop {
    pub fn new(
        backend: Arc<dyn ChatBackend>,
        syncer: Arc<dyn Syncer>,
        store: Arc<dyn RoomStore>,
        stats: Arc<TransportStats>,
        long_poll_timeout: Duration,
    ) -> Self {
        let (state, _) = watch::channel(SyncState::Idle);
        Self {
            backend,
            syncer,
            store,
            stats,
            long_poll_timeout,
            since: RwLock::new(String::new()),
            state,
        }
    }

    pub fn state(&self) -> SyncState {
        *self.state.borrow()
    }

    /// Follows state transitions.
    pub fn watch_state(&self) -> watch::Receiver<SyncState> {
        self.state.subscribe()
    }

    /// Current cursor. Empty until the first round completes.
    pub fn since(&self) -> String {
        self.since.read().clone()
    }

    fn set_state(&self, state: SyncState) {
        self.state.send_replace(state);
    }

    /// Filter id for this user: cached in the store, uploaded on first use.
    async fn ensure_filter(&self) -> Result<String, SyncError> {
        let user_id = self.backend.user_id();
        let cached = self
            .store
            .load_filter_id(user_id)
            .map_err(|source| SyncError::Store {
                user_id: user_id.to_string(),
                since: self.since(),
                source,
            })?;
        if let Some(id) = cached {
            return Ok(id);
        }

        let id = self
            .backend
            .create_filter(&self.syncer.filter_json(user_id))
            .await?;
        self.store
            .save_filter_id(user_id, &id)
            .map_err(|source| SyncError::Store {
                user_id: user_id.to_string(),
                since: self.since(),
                source,
            })?;
        debug!(user = %user_id, filter = %id, "sync filter uploaded");
        Ok(id)
    }

    /// Runs one round against the backend and applies the result.
    ///
    /// The cursor advances whenever a batch was fetched, whether or not
    /// processing it succeeded. On failure the batch (if any) is returned
    /// alongside the error for [`Syncer::on_failed_sync`].
    pub async fn sync_once(
        &self,
        filter_id: Option<&str>,
    ) -> Result<(), (Option<SyncBatch>, SyncError)> {
        self.set_state(SyncState::Syncing);
        let since = self.since();
        let since_arg = (!since.is_empty()).then_some(since.as_str());

        let mut batch = self
            .backend
            .sync(since_arg, filter_id, self.long_poll_timeout)
            .await
            .map_err(|e| (None, SyncError::from(e)))?;

        self.set_state(SyncState::ProcessingBatch);
        let result = self.syncer.process_response(&mut batch, &since);
        if !batch.next_batch.is_empty() {
            *self.since.write() = batch.next_batch.clone();
        }
        self.stats.record_sync_round();
        result.map_err(|e| (Some(batch), e))
    }

    /// Loops until `shutdown` flips to `true` or its sender is dropped. An
    /// in-flight round is abandoned on shutdown.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!(user = %self.backend.user_id(), "sync loop starting");
        self.set_state(SyncState::Idle);
        let mut filter_id: Option<String> = None;

        loop {
            if *shutdown.borrow() {
                break;
            }

            let round = async {
                if filter_id.is_none() {
                    filter_id = Some(self.ensure_filter().await.map_err(|e| (None, e))?);
                }
                self.sync_once(filter_id.as_deref()).await
            };

            let outcome = tokio::select! {
                res = round => res,
                res = shutdown.changed() => {
                    if res.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            };

            let Err((batch, err)) = outcome else {
                continue;
            };

            self.stats.record_sync_failure();
            match &err {
                SyncError::Panicked { .. } => error!(error = %err, "sync batch processing panicked"),
                SyncError::Store { .. } => error!(error = %err, "sync batch processing failed"),
                SyncError::Backend(e) => warn!(error = %e, "sync request failed"),
            }

            let delay = match self.syncer.on_failed_sync(batch.as_ref(), &err) {
                Ok(d) => d,
                Err(fatal) => {
                    error!(error = %fatal, "syncer gave up, stopping sync loop");
                    break;
                }
            };

            self.set_state(SyncState::Backoff);
            debug!(delay_ms = delay.as_millis() as u64, "sync backing off");
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                res = shutdown.changed() => {
                    if res.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        self.set_state(SyncState::Stopped);
        info!(user = %self.backend.user_id(), since = %self.since(), "sync loop stopped");
    }
}
