//! Apply-pipeline counters.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::Duration;

use crate::state::MvccStats;

/// Point-in-time view of the apply counters.
#[derive(Default, Debug, Clone, Copy)]
pub struct ApplyMetricsSnapshot {
    pub entries_applied: u64,
    pub empty_entries: u64,
    pub batches_committed: u64,
    pub write_mutations: u64,
    pub state_assertions: u64,
    pub sstable_applications: u64,
    pub sstable_copies: u64,
    pub commit_count: u64,
    pub commit_total_us: u64,
    pub commit_max_us: u64,
    pub live_bytes: i64,
    pub sys_bytes: i64,
}

/// Store-wide counters updated by the apply pipeline.
///
/// All counters are lock-free atomics; cumulative counters reset on
/// snapshot, gauges (the stats bytes) do not.
#[derive(Debug, Default)]
pub struct ApplyMetrics {
    entries_applied: AtomicU64,
    empty_entries: AtomicU64,
    batches_committed: AtomicU64,
    write_mutations: AtomicU64,
    state_assertions: AtomicU64,
    sstable_applications: AtomicU64,
    sstable_copies: AtomicU64,
    commit_count: AtomicU64,
    commit_total_us: AtomicU64,
    commit_max_us: AtomicU64,
    live_bytes: AtomicI64,
    sys_bytes: AtomicI64,
}

impl ApplyMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one committed batch: how many entries it carried, how many of
    /// those were empty, and the mutation count of the staged write batches
    /// (the per-store write-load signal).
    pub fn record_batch(&self, entries: u64, empty_entries: u64, mutations: u64) {
        self.entries_applied.fetch_add(entries, Ordering::Relaxed);
        self.empty_entries
            .fetch_add(empty_entries, Ordering::Relaxed);
        self.batches_committed.fetch_add(1, Ordering::Relaxed);
        self.write_mutations.fetch_add(mutations, Ordering::Relaxed);
    }

    pub fn record_state_assertion(&self) {
        self.state_assertions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_sstable_application(&self, copied: bool) {
        self.sstable_applications.fetch_add(1, Ordering::Relaxed);
        if copied {
            self.sstable_copies.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_commit_latency(&self, dur: Duration) {
        let us = dur.as_micros().min(u128::from(u64::MAX)) as u64;
        self.commit_count.fetch_add(1, Ordering::Relaxed);
        self.commit_total_us.fetch_add(us, Ordering::Relaxed);
        self.commit_max_us.fetch_max(us, Ordering::Relaxed);
    }

    /// Fold a committed stats delta into the store-wide gauges.
    pub fn add_mvcc_delta(&self, delta: &MvccStats) {
        self.live_bytes.fetch_add(delta.live_bytes, Ordering::Relaxed);
        self.sys_bytes.fetch_add(delta.sys_bytes, Ordering::Relaxed);
    }

    /// Read and reset the cumulative counters; gauges are read in place.
    pub fn snapshot_and_reset(&self) -> ApplyMetricsSnapshot {
        ApplyMetricsSnapshot {
            entries_applied: self.entries_applied.swap(0, Ordering::Relaxed),
            empty_entries: self.empty_entries.swap(0, Ordering::Relaxed),
            batches_committed: self.batches_committed.swap(0, Ordering::Relaxed),
            write_mutations: self.write_mutations.swap(0, Ordering::Relaxed),
            state_assertions: self.state_assertions.swap(0, Ordering::Relaxed),
            sstable_applications: self.sstable_applications.swap(0, Ordering::Relaxed),
            sstable_copies: self.sstable_copies.swap(0, Ordering::Relaxed),
            commit_count: self.commit_count.swap(0, Ordering::Relaxed),
            commit_total_us: self.commit_total_us.swap(0, Ordering::Relaxed),
            commit_max_us: self.commit_max_us.swap(0, Ordering::Relaxed),
            live_bytes: self.live_bytes.load(Ordering::Relaxed),
            sys_bytes: self.sys_bytes.load(Ordering::Relaxed),
        }
    }
}
