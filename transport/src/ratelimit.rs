//! # Token Bucket Throttle
//!
//! Gates outbound datagram transmissions. Tokens refill continuously at
//! `fill_rate` per second up to `capacity`. A consume either succeeds and
//! deducts, or fails and leaves the bucket exactly as it was. Callers that
//! are refused defer and try again later; nothing here blocks.
//!
//! The refill math is a pure function of (state, now). [`TokenBucket`]
//! wraps it with a lock and a [`Clock`] so concurrent senders see one
//! consistent balance.

use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::trace;

use crate::clock::{system_clock, SharedClock};

/// Bucket state. Invariant: `0 <= tokens <= capacity`.
#[derive(Debug, Clone, PartialEq)]
pub struct TokenBucketState {
    pub capacity: f64,
    pub tokens: f64,
    pub last_refill: Instant,
    /// Tokens added per second.
    pub fill_rate: f64,
}

impl TokenBucketState {
    /// A full bucket.
    pub fn new(capacity: f64, fill_rate: f64, now: Instant) -> Self {
        let capacity = capacity.max(0.0);
        Self {
            capacity,
            tokens: capacity,
            last_refill: now,
            fill_rate: fill_rate.max(0.0),
        }
    }

    /// Balance after refilling up to `now`, without mutating.
    fn refilled(&self, now: Instant) -> f64 {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        (self.tokens + elapsed * self.fill_rate).min(self.capacity)
    }

    /// Refills, then deducts `n` if the balance covers it.
    ///
    /// A refused consume does not touch the state at all, so repeated
    /// probing by a deferred sender has no side effects.
    pub fn consume_at(&mut self, n: f64, now: Instant) -> bool {
        let balance = self.refilled(now);
        if balance < n {
            return false;
        }
        self.tokens = balance - n;
        if now > self.last_refill {
            self.last_refill = now;
        }
        true
    }

    /// How long until `n` tokens are available. Zero if they already are;
    /// `None` if they never will be (n above capacity, or no refill).
    pub fn wait_time_at(&self, n: f64, now: Instant) -> Option<Duration> {
        let balance = self.refilled(now);
        if balance >= n {
            return Some(Duration::ZERO);
        }
        if n > self.capacity || self.fill_rate <= 0.0 {
            return None;
        }
        Some(Duration::from_secs_f64((n - balance) / self.fill_rate))
    }
}

/// Thread-safe token bucket with an injected clock.
pub struct TokenBucket {
    state: Mutex<TokenBucketState>,
    clock: SharedClock,
}

impl std::fmt::Debug for TokenBucket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenBucket")
            .field("state", &*self.state.lock())
            .finish()
    }
}

impl TokenBucket {
    /// Full bucket on the production clock.
    pub fn new(capacity: f64, fill_rate: f64) -> Self {
        Self::with_clock(capacity, fill_rate, system_clock())
    }

    pub fn with_clock(capacity: f64, fill_rate: f64, clock: SharedClock) -> Self {
        let now = clock.now();
        Self {
            state: Mutex::new(TokenBucketState::new(capacity, fill_rate, now)),
            clock,
        }
    }

    /// Takes `n` tokens if available. Never blocks.
    pub fn consume(&self, n: f64) -> bool {
        let now = self.clock.now();
        let ok = self.state.lock().consume_at(n, now);
        if !ok {
            trace!(requested = n, "throttle refused");
        }
        ok
    }

    /// Time until `n` tokens could be consumed. See
    /// [`TokenBucketState::wait_time_at`].
    pub fn wait_time(&self, n: f64) -> Option<Duration> {
        let now = self.clock.now();
        self.state.lock().wait_time_at(n, now)
    }

    /// Current balance after refill. For diagnostics.
    pub fn available(&self) -> f64 {
        let now = self.clock.now();
        self.state.lock().refilled(now)
    }

    pub fn capacity(&self) -> f64 {
        self.state.lock().capacity
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::clock::ManualClock;

    fn bucket(capacity: f64, rate: f64) -> (TokenBucket, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new());
        (
            TokenBucket::with_clock(capacity, rate, clock.clone()),
            clock,
        )
    }

    #[test]
    fn burst_then_refill() {
        let (bucket, clock) = bucket(10.0, 1.0);
        for i in 0..10 {
            assert!(bucket.consume(1.0), "consume {i} should succeed");
        }
        assert!(!bucket.consume(1.0), "11th immediate consume must fail");

        clock.advance(Duration::from_secs(1));
        assert!(bucket.consume(1.0));
        assert!(!bucket.consume(1.0));
    }

    #[test]
    fn refused_consume_does_not_mutate() {
        let now = Instant::now();
        let mut state = TokenBucketState::new(5.0, 1.0, now);
        assert!(state.consume_at(5.0, now));
        let before = state.clone();
        assert!(!state.consume_at(1.0, now + Duration::from_millis(500)));
        assert_eq!(state, before);
    }

    #[test]
    fn refill_is_capped_at_capacity() {
        let (bucket, clock) = bucket(3.0, 100.0);
        assert!(bucket.consume(3.0));
        clock.advance(Duration::from_secs(60));
        assert_eq!(bucket.available(), 3.0);
        assert!(bucket.consume(3.0));
        assert!(!bucket.consume(0.5));
    }

    #[test]
    fn tokens_stay_within_bounds_over_mixed_sequence() {
        let now = Instant::now();
        let mut state = TokenBucketState::new(4.0, 2.0, now);
        let mut t = now;
        let requests = [1.0, 3.0, 0.5, 4.0, 2.0, 5.0, 0.25, 1.0, 3.5, 2.0];
        for (step, n) in requests.iter().enumerate() {
            t += Duration::from_millis(150 * step as u64);
            let before = state.refilled(t);
            let ok = state.consume_at(*n, t);
            assert_eq!(ok, before >= *n, "step {step}: success iff balance covers n");
            assert!(state.tokens >= 0.0);
            assert!(state.tokens <= state.capacity);
        }
    }

    #[test]
    fn wait_time_reports_deficit() {
        let (bucket, _clock) = bucket(2.0, 4.0);
        assert_eq!(bucket.wait_time(1.0), Some(Duration::ZERO));
        assert!(bucket.consume(2.0));
        assert_eq!(bucket.wait_time(1.0), Some(Duration::from_millis(250)));
        assert_eq!(bucket.wait_time(3.0), None);
    }

    #[test]
    fn clock_going_backwards_is_harmless() {
        let now = Instant::now();
        let mut state = TokenBucketState::new(2.0, 1.0, now + Duration::from_secs(5));
        assert!(state.consume_at(1.0, now));
        assert_eq!(state.tokens, 1.0);
    }
}
