//! Per-message retry bookkeeping for the datagram sender.
//!
//! The queue does no I/O. [`RetryQueue::poll_due`] looks at the clock and
//! the throttle and answers three questions: what to transmit now, what to
//! give up on, and when to look again. The sender loop in `mod.rs` does the
//! socket work and sleeps until the returned wake time.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::error::TransportError;
use crate::message::{MessageId, PeerAddress};
use crate::ratelimit::TokenBucket;

/// Delivery confirmation channel for one queued frame.
pub type Responder = oneshot::Sender<Result<(), TransportError>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    /// Application message, confirmed by `Ack`.
    Message,
    /// Health probe, confirmed by `Pong`.
    Probe,
    /// `Ping` to a candidate endpoint. Its `Pong` moves the peer there;
    /// silence only drops the candidate.
    Verify,
}

/// What the caller hands to [`RetryQueue::enqueue`].
#[derive(Debug)]
pub struct Pending {
    pub id: MessageId,
    pub peer: PeerAddress,
    pub kind: EntryKind,
    /// Encoded frame, sent as-is on every attempt.
    pub frame: Vec<u8>,
    pub endpoint: SocketAddr,
    pub deadline: Instant,
}

#[derive(Debug)]
pub struct RetryEntry {
    pub id: MessageId,
    pub peer: PeerAddress,
    pub kind: EntryKind,
    pub frame: Vec<u8>,
    pub endpoint: SocketAddr,
    /// Physical transmissions so far.
    pub attempts: u32,
    pub next_attempt: Instant,
    pub deadline: Instant,
    responder: Option<Responder>,
}

impl RetryEntry {
    fn resolve(&mut self, result: Result<(), TransportError>) {
        if let Some(tx) = self.responder.take() {
            // The caller may have stopped waiting.
            let _ = tx.send(result);
        }
    }
}

/// One datagram the sender should put on the wire now.
#[derive(Debug, Clone)]
pub struct Transmission {
    pub id: MessageId,
    pub peer: PeerAddress,
    pub frame: Vec<u8>,
    pub endpoint: SocketAddr,
    /// 1-based attempt number of this transmission.
    pub attempt: u32,
}

/// An entry removed without confirmation. Call [`Expired::resolve`] to
/// report the failure to whoever is waiting.
#[derive(Debug)]
pub struct Expired {
    pub entry: RetryEntry,
    pub error: TransportError,
}

impl Expired {
    pub fn resolve(self) {
        let Expired { mut entry, error } = self;
        entry.resolve(Err(error));
    }
}

#[derive(Debug, Default)]
pub struct PollOutcome {
    pub transmissions: Vec<Transmission>,
    pub expired: Vec<Expired>,
    /// Earliest time anything left in the queue needs attention.
    pub next_wake: Option<Instant>,
}

pub struct RetryQueue {
    entries: Mutex<HashMap<MessageId, RetryEntry>>,
    max_attempts: u32,
    retry_interval: Duration,
}

impl RetryQueue {
    pub fn new(max_attempts: u32, retry_interval: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            max_attempts: max_attempts.max(1),
            retry_interval,
        }
    }

    /// Queues a frame for immediate first transmission. Re-enqueueing an id
    /// that is still queued replaces the old entry; its waiter observes a
    /// closed channel.
    pub fn enqueue(
        &self,
        pending: Pending,
        now: Instant,
    ) -> oneshot::Receiver<Result<(), TransportError>> {
        let (tx, rx) = oneshot::channel();
        let entry = RetryEntry {
            id: pending.id,
            peer: pending.peer,
            kind: pending.kind,
            frame: pending.frame,
            endpoint: pending.endpoint,
            attempts: 0,
            next_attempt: now,
            deadline: pending.deadline,
            responder: Some(tx),
        };
        self.entries.lock().insert(entry.id, entry);
        rx
    }

    /// Confirms delivery of `id`. Returns the entry if it was still queued;
    /// a late or duplicate confirmation returns `None`.
    pub fn complete(&self, id: &MessageId) -> Option<RetryEntry> {
        let mut entry = self.entries.lock().remove(id)?;
        entry.resolve(Ok(()));
        Some(entry)
    }

    /// Abandons every entry, answering each waiter with `Shutdown`.
    pub fn drain_all(&self) -> usize {
        let drained: Vec<RetryEntry> = self.entries.lock().drain().map(|(_, e)| e).collect();
        let n = drained.len();
        for mut entry in drained {
            entry.resolve(Err(TransportError::Shutdown));
        }
        n
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub fn contains(&self, id: &MessageId) -> bool {
        self.entries.lock().contains_key(id)
    }

    /// Decides, for every entry, whether to transmit, defer or expire.
    ///
    /// - past its deadline: expired with `DeadlineExceeded`
    /// - not yet due: left alone
    /// - due with the attempt budget spent: expired with `DeliveryFailed`
    /// - due and the throttle grants a token: transmitted, next attempt one
    ///   retry interval out
    /// - due and throttled: deferred until the bucket refills, without
    ///   spending an attempt
    ///
    /// Due entries are served oldest-first, fewest attempts first on ties,
    /// so a throttled burst drains in order.
    pub fn poll_due(&self, now: Instant, limiter: &TokenBucket) -> PollOutcome {
        let mut outcome = PollOutcome::default();
        let mut entries = self.entries.lock();

        let mut due: Vec<(Instant, u32, MessageId)> = entries
            .values()
            .filter(|e| e.next_attempt <= now || e.deadline <= now)
            .map(|e| (e.next_attempt, e.attempts, e.id))
            .collect();
        due.sort();

        for (_, _, id) in due {
            let Some(entry) = entries.get_mut(&id) else {
                continue;
            };

            if entry.deadline <= now {
                if let Some(entry) = entries.remove(&id) {
                    outcome.expired.push(Expired {
                        entry,
                        error: TransportError::DeadlineExceeded { id },
                    });
                }
                continue;
            }

            if entry.attempts >= self.max_attempts {
                let attempts = entry.attempts;
                if let Some(entry) = entries.remove(&id) {
                    outcome.expired.push(Expired {
                        entry,
                        error: TransportError::DeliveryFailed { id, attempts },
                    });
                }
                continue;
            }

            if limiter.consume(1.0) {
                entry.attempts += 1;
                entry.next_attempt = now + self.retry_interval;
                outcome.transmissions.push(Transmission {
                    id,
                    peer: entry.peer,
                    frame: entry.frame.clone(),
                    endpoint: entry.endpoint,
                    attempt: entry.attempts,
                });
            } else {
                let wait = limiter
                    .wait_time(1.0)
                    .filter(|w| !w.is_zero())
                    .unwrap_or(self.retry_interval);
                entry.next_attempt = now + wait;
            }
        }

        outcome.next_wake = entries
            .values()
            .map(|e| e.next_attempt.min(e.deadline))
            .min();
        outcome
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::clock::{Clock, ManualClock};

    fn pending(deadline: Instant) -> Pending {
        Pending {
            id: MessageId::new(),
            peer: PeerAddress([1; 20]),
            kind: EntryKind::Message,
            frame: vec![1, 2, 3],
            endpoint: SocketAddr::from(([127, 0, 0, 1], 40001)),
            deadline,
        }
    }

    fn open_limiter() -> TokenBucket {
        TokenBucket::new(1_000.0, 1_000.0)
    }

    #[test]
    fn exhausts_after_max_attempts() {
        let queue = RetryQueue::new(3, Duration::from_secs(1));
        let limiter = open_limiter();
        let t0 = Instant::now();
        let mut rx = queue.enqueue(pending(t0 + Duration::from_secs(60)), t0);

        for i in 0..3u64 {
            let out = queue.poll_due(t0 + Duration::from_secs(i), &limiter);
            assert_eq!(out.transmissions.len(), 1);
            assert_eq!(out.transmissions[0].attempt, i as u32 + 1);
            assert_eq!(out.next_wake, Some(t0 + Duration::from_secs(i + 1)));
        }

        // Not due yet.
        let out = queue.poll_due(t0 + Duration::from_millis(2500), &limiter);
        assert!(out.transmissions.is_empty() && out.expired.is_empty());

        let mut out = queue.poll_due(t0 + Duration::from_secs(3), &limiter);
        assert!(out.transmissions.is_empty());
        let expired = out.expired.pop().unwrap();
        assert!(matches!(
            expired.error,
            TransportError::DeliveryFailed { attempts: 3, .. }
        ));
        expired.resolve();
        assert!(queue.is_empty());
        assert!(matches!(
            rx.try_recv(),
            Ok(Err(TransportError::DeliveryFailed { .. }))
        ));
    }

    #[test]
    fn throttled_entries_are_deferred_not_dropped() {
        let clock = Arc::new(ManualClock::new());
        let limiter = TokenBucket::with_clock(1.0, 1.0, clock.clone());
        let queue = RetryQueue::new(5, Duration::from_secs(1));
        let t0 = clock.now();
        let _a = queue.enqueue(pending(t0 + Duration::from_secs(60)), t0);
        let _b = queue.enqueue(pending(t0 + Duration::from_secs(60)), t0);

        let out = queue.poll_due(t0, &limiter);
        assert_eq!(out.transmissions.len(), 1);
        assert_eq!(queue.len(), 2);
        // The refused entry waits for the refill, one second out.
        assert_eq!(out.next_wake, Some(t0 + Duration::from_secs(1)));

        clock.advance(Duration::from_secs(1));
        let out = queue.poll_due(t0 + Duration::from_secs(1), &limiter);
        // Only one token: the deferred entry goes, the other is throttled.
        assert_eq!(out.transmissions.len(), 1);
        assert_eq!(out.transmissions[0].attempt, 1);
    }

    #[test]
    fn deadline_beats_remaining_attempts() {
        let queue = RetryQueue::new(10, Duration::from_secs(1));
        let limiter = open_limiter();
        let t0 = Instant::now();
        let mut rx = queue.enqueue(pending(t0 + Duration::from_millis(1500)), t0);

        assert_eq!(queue.poll_due(t0, &limiter).transmissions.len(), 1);
        let out = queue.poll_due(t0 + Duration::from_secs(1), &limiter);
        assert_eq!(out.transmissions.len(), 1);
        assert_eq!(out.next_wake, Some(t0 + Duration::from_millis(1500)));

        let out = queue.poll_due(t0 + Duration::from_millis(1500), &limiter);
        assert_eq!(out.expired.len(), 1);
        for e in out.expired {
            e.resolve();
        }
        assert!(matches!(
            rx.try_recv(),
            Ok(Err(TransportError::DeadlineExceeded { .. }))
        ));
    }

    #[test]
    fn complete_and_drain_answer_waiters() {
        let queue = RetryQueue::new(3, Duration::from_secs(1));
        let t0 = Instant::now();
        let p = pending(t0 + Duration::from_secs(60));
        let id = p.id;
        let mut done = queue.enqueue(p, t0);
        let mut abandoned = queue.enqueue(pending(t0 + Duration::from_secs(60)), t0);

        assert!(queue.complete(&id).is_some());
        assert!(queue.complete(&id).is_none());
        assert!(matches!(done.try_recv(), Ok(Ok(()))));

        assert_eq!(queue.drain_all(), 1);
        assert!(matches!(
            abandoned.try_recv(),
            Ok(Err(TransportError::Shutdown))
        ));
    }
}
