//! Fault dispatch counters.
//!
//! Updated from the fault handler, so everything here is a lock-free
//! atomic increment.

use core::sync::atomic::{AtomicUsize, Ordering};

/// Counters for faults seen by a tracker.
#[derive(Debug)]
pub struct FaultStats {
    /// Faults delivered to the dispatcher.
    faults: AtomicUsize,
    /// Faults outside every tracked region.
    unmatched: AtomicUsize,
    /// Faults a resolver fixed.
    resolved: AtomicUsize,
    /// Faults inside a region whose resolver declined.
    declined: AtomicUsize,
}

/// Immutable snapshot of [`FaultStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FaultStatsSnapshot {
    pub faults: usize,
    pub unmatched: usize,
    pub resolved: usize,
    pub declined: usize,
}

impl FaultStatsSnapshot {
    /// Faults that reached a resolver.
    pub fn matched(&self) -> usize {
        self.resolved + self.declined
    }
}

impl FaultStats {
    pub const fn new() -> Self {
        Self {
            faults: AtomicUsize::new(0),
            unmatched: AtomicUsize::new(0),
            resolved: AtomicUsize::new(0),
            declined: AtomicUsize::new(0),
        }
    }

    #[inline]
    pub(crate) fn record_fault(&self) {
        self.faults.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_unmatched(&self) {
        self.unmatched.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_resolved(&self) {
        self.resolved.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_declined(&self) {
        self.declined.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> FaultStatsSnapshot {
        FaultStatsSnapshot {
            faults: self.faults.load(Ordering::Relaxed),
            unmatched: self.unmatched.load(Ordering::Relaxed),
            resolved: self.resolved.load(Ordering::Relaxed),
            declined: self.declined.load(Ordering::Relaxed),
        }
    }

    pub fn reset(&self) {
        self.faults.store(0, Ordering::Relaxed);
        self.unmatched.store(0, Ordering::Relaxed);
        self.resolved.store(0, Ordering::Relaxed);
        self.declined.store(0, Ordering::Relaxed);
    }
}

impl Default for FaultStats {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stats_snapshot_and_reset() {
        let stats = FaultStats::new();
        stats.record_fault();
        stats.record_fault();
        stats.record_fault();
        stats.record_unmatched();
        stats.record_resolved();
        stats.record_declined();

        let snap = stats.snapshot();
        assert_eq!(snap.faults, 3);
        assert_eq!(snap.unmatched, 1);
        assert_eq!(snap.matched(), 2);

        stats.reset();
        assert_eq!(stats.snapshot(), FaultStatsSnapshot::default());
    }
}
