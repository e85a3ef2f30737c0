//! Process-wide logical clock.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::state::Timestamp;

/// Monotonic high-water mark over all timestamps observed by this node.
///
/// Many ranges update the clock concurrently; the only operation is a
/// forward-only ratchet, so a relaxed fetch_max is sufficient.
#[derive(Debug, Default)]
pub struct NodeClock {
    now: AtomicU64,
}

impl NodeClock {
    pub fn new() -> Self {
        Self {
            now: AtomicU64::new(0),
        }
    }

    /// Current high-water mark.
    pub fn now(&self) -> Timestamp {
        Timestamp(self.now.load(Ordering::Relaxed))
    }

    /// Ratchet the clock forward to `ts`. Never moves backwards.
    pub fn update(&self, ts: Timestamp) {
        self.now.fetch_max(ts.0, Ordering::Relaxed);
    }
}
