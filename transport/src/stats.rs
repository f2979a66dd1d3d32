//! Lock-free delivery counters shared by every transport.
//!
//! The node binary mirrors a [`StatsSnapshot`] into its Prometheus
//! registry; the library itself has no metrics dependency.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

#[derive(Debug, Default)]
pub struct TransportStats {
    sent: AtomicU64,
    delivered: AtomicU64,
    failed: AtomicU64,
    fallbacks: AtomicU64,
    received: AtomicU64,
    duplicates: AtomicU64,
    malformed: AtomicU64,
    sync_rounds: AtomicU64,
    sync_failures: AtomicU64,
}

/// Point-in-time copy of [`TransportStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    /// Physical transmissions (datagrams sent, events published).
    pub sent: u64,
    /// Messages confirmed delivered.
    pub delivered: u64,
    /// Messages reported failed to the caller.
    pub failed: u64,
    /// Datagram failures retried over chat.
    pub fallbacks: u64,
    /// Messages handed to the upper layer.
    pub received: u64,
    /// Retransmissions suppressed by dedup.
    pub duplicates: u64,
    /// Inbound datagrams or events that could not be decoded.
    pub malformed: u64,
    pub sync_rounds: u64,
    pub sync_failures: u64,
}

macro_rules! counter {
    ($($name:ident => $field:ident),* $(,)?) => {
        impl TransportStats {
            $(
                pub fn $name(&self) {
                    self.$field.fetch_add(1, Ordering::Relaxed);
                }
            )*
        }
    };
}

counter! {
    record_sent => sent,
    record_delivered => delivered,
    record_failed => failed,
    record_fallback => fallbacks,
    record_received => received,
    record_duplicate => duplicates,
    record_malformed => malformed,
    record_sync_round => sync_rounds,
    record_sync_failure => sync_failures,
}

impl TransportStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            sent: self.sent.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            fallbacks: self.fallbacks.load(Ordering::Relaxed),
            received: self.received.load(Ordering::Relaxed),
            duplicates: self.duplicates.load(Ordering::Relaxed),
            malformed: self.malformed.load(Ordering::Relaxed),
            sync_rounds: self.sync_rounds.load(Ordering::Relaxed),
            sync_failures: self.sync_failures.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let stats = TransportStats::new();
        stats.record_sent();
        stats.record_sent();
        stats.record_duplicate();
        let snap = stats.snapshot();
        assert_eq!(snap.sent, 2);
        assert_eq!(snap.duplicates, 1);
        assert_eq!(snap.delivered, 0);
    }
}
