//! Bounded recent-id window for duplicate suppression.
//!
//! Retransmissions are the normal case on the datagram path: the peer got
//! our message, its ack got lost, we sent again. Ids are remembered with
//! their first-seen time. When the window outgrows its capacity, expired
//! ids go first, then the oldest, until the window is back to 75%.

use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::time::Instant;
use tracing::trace;

use crate::clock::{system_clock, SharedClock};
use crate::message::MessageId;

pub struct SeenCache {
    seen: DashMap<MessageId, Instant>,
    capacity: usize,
    ttl: Duration,
    clock: SharedClock,
}

impl SeenCache {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self::with_clock(capacity, ttl, system_clock())
    }

    pub fn with_clock(capacity: usize, ttl: Duration, clock: SharedClock) -> Self {
        Self {
            seen: DashMap::new(),
            capacity: capacity.max(1),
            ttl,
            clock,
        }
    }

    /// Records `id`. Returns `true` the first time an id is seen within the
    /// window, `false` for a duplicate. Check and insert are one atomic step
    /// per id, so two workers racing on the same id cannot both win.
    pub fn insert(&self, id: MessageId) -> bool {
        let now = self.clock.now();
        let fresh = match self.seen.entry(id) {
            Entry::Occupied(mut e) => {
                if now.saturating_duration_since(*e.get()) > self.ttl {
                    e.insert(now);
                    true
                } else {
                    false
                }
            }
            Entry::Vacant(e) => {
                e.insert(now);
                true
            }
        };
        if fresh {
            self.maybe_evict(now);
        }
        fresh
    }

    pub fn contains(&self, id: &MessageId) -> bool {
        self.seen.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }

    fn maybe_evict(&self, now: Instant) {
        if self.seen.len() <= self.capacity {
            return;
        }

        let ttl = self.ttl;
        self.seen
            .retain(|_, first_seen| now.saturating_duration_since(*first_seen) <= ttl);

        let target = self.capacity * 3 / 4;
        if self.seen.len() <= target {
            return;
        }

        let mut entries: Vec<(MessageId, Instant)> =
            self.seen.iter().map(|e| (*e.key(), *e.value())).collect();
        entries.sort_by_key(|(_, ts)| *ts);

        let to_remove = entries.len().saturating_sub(target);
        for (id, _) in entries.iter().take(to_remove) {
            self.seen.remove(id);
        }
        trace!(removed = to_remove, remaining = self.seen.len(), "seen cache evicted");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::clock::ManualClock;

    #[test]
    fn duplicates_are_rejected() {
        let cache = SeenCache::new(100, Duration::from_secs(60));
        let id = MessageId::new();
        assert!(cache.insert(id));
        for _ in 0..5 {
            assert!(!cache.insert(id));
        }
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn window_stays_bounded_and_drops_oldest() {
        let clock = Arc::new(ManualClock::new());
        let cache = SeenCache::with_clock(8, Duration::from_secs(600), clock.clone());
        let ids: Vec<MessageId> = (0..9).map(|_| MessageId::new()).collect();
        for id in &ids {
            clock.advance(Duration::from_millis(10));
            assert!(cache.insert(*id));
        }
        // Overflow on the 9th insert trims back to 75% of capacity.
        assert_eq!(cache.len(), 6);
        assert!(!cache.contains(&ids[0]));
        assert!(cache.contains(&ids[8]));
    }

    #[test]
    fn expired_ids_are_accepted_again() {
        let clock = Arc::new(ManualClock::new());
        let cache = SeenCache::with_clock(8, Duration::from_secs(5), clock.clone());
        let id = MessageId::new();
        assert!(cache.insert(id));
        clock.advance(Duration::from_secs(6));
        assert!(cache.insert(id));
    }
}
