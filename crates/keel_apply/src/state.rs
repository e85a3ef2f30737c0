//! Replica state types shared by the apply pipeline.
//!
//! These types are kept in a small, dependency-light module because they are
//! used by the decision logic, the application batch, and the side-effect
//! handlers alike. `ReplicaState` is the summary that must stay identical on
//! every replica of a range; everything the pipeline persists or publishes is
//! expressed in terms of it.

use serde::{Deserialize, Serialize};

/// Logical identifier for a range.
pub type RangeId = u64;
/// Logical node identifier within the cluster.
pub type NodeId = u64;
/// Store identifier (one store per disk per node).
pub type StoreId = u64;
/// Replica identifier, unique within one range's history.
pub type ReplicaId = u64;

/// Logical timestamp used for MVCC ordering and lease bookkeeping.
///
/// Timestamps are totally ordered and compared with plain integer
/// comparison; `0` is the zero/absent value.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Timestamp(pub u64);

impl Timestamp {
    pub const ZERO: Timestamp = Timestamp(0);

    pub fn is_zero(self) -> bool {
        self.0 == 0
    }

    /// Ratchet `self` forward to `other` if `other` is larger.
    pub fn forward(&mut self, other: Timestamp) {
        if other > *self {
            *self = other;
        }
    }
}

impl std::fmt::Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "t{}", self.0)
    }
}

/// One replica of a range, as named in the range descriptor.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaDescriptor {
    pub node_id: NodeId,
    pub store_id: StoreId,
    pub replica_id: ReplicaId,
}

/// Range descriptor. Key bounds are lexicographic and end-exclusive; an empty
/// `end_key` means "unbounded".
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RangeDescriptor {
    pub range_id: RangeId,
    pub start_key: Vec<u8>,
    pub end_key: Vec<u8>,
    pub replicas: Vec<ReplicaDescriptor>,
    pub next_replica_id: ReplicaId,
}

impl RangeDescriptor {
    /// Look up the replica descriptor living on `store_id`, if any.
    pub fn replica_on_store(&self, store_id: StoreId) -> Option<&ReplicaDescriptor> {
        self.replicas.iter().find(|r| r.store_id == store_id)
    }
}

/// A grant making one replica the only writer (and fresh reader) for a range.
///
/// `sequence` increases whenever the lease changes hands; extensions of an
/// existing lease keep the sequence and bump `proposed_ts` instead.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Lease {
    pub sequence: u64,
    pub holder: ReplicaDescriptor,
    /// Node liveness epoch for epoch-based leases; `0` means expiration-based.
    pub epoch: u64,
    pub expiration: Timestamp,
    pub proposed_ts: Timestamp,
}

impl Lease {
    /// Whether `other` can replace `self` without a change of authority.
    ///
    /// Equivalence is intentionally asymmetric for expiration-based leases: a
    /// forward extension of the expiration by the same holder is equivalent,
    /// a rollback is not.
    pub fn equivalent(&self, other: &Lease) -> bool {
        if self.holder.store_id != other.holder.store_id {
            return false;
        }
        if self.epoch != 0 || other.epoch != 0 {
            return self.epoch == other.epoch;
        }
        other.expiration >= self.expiration
    }
}

impl std::fmt::Display for Lease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "lease #{} (store {}, epoch {}, exp {})",
            self.sequence, self.holder.store_id, self.epoch, self.expiration
        )
    }
}

/// First log position that is no longer stored by this replica.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TruncatedState {
    pub index: u64,
    pub term: u64,
}

/// MVCC statistics for one range.
///
/// Deltas are commutative: the order in which deltas of concurrent commands
/// are folded in does not matter, which is what lets the batch accumulate
/// them without serializing on a stats key.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MvccStats {
    pub live_bytes: i64,
    pub live_count: i64,
    pub key_bytes: i64,
    pub val_bytes: i64,
    pub sys_bytes: i64,
    pub sys_count: i64,
    /// True when the counters above may be inexact and need recomputation.
    pub contains_estimates: bool,
}

impl MvccStats {
    pub fn add(&mut self, delta: &MvccStatsDelta) {
        self.live_bytes += delta.live_bytes;
        self.live_count += delta.live_count;
        self.key_bytes += delta.key_bytes;
        self.val_bytes += delta.val_bytes;
        self.sys_bytes += delta.sys_bytes;
        self.sys_count += delta.sys_count;
    }

    pub fn subtract(&mut self, other: &MvccStats) {
        self.live_bytes -= other.live_bytes;
        self.live_count -= other.live_count;
        self.key_bytes -= other.key_bytes;
        self.val_bytes -= other.val_bytes;
        self.sys_bytes -= other.sys_bytes;
        self.sys_count -= other.sys_count;
    }

    /// Total user-visible byte footprint, used by the split/merge queue
    /// conditions.
    pub fn total_bytes(&self) -> i64 {
        self.key_bytes + self.val_bytes
    }

    pub fn to_delta(&self) -> MvccStatsDelta {
        MvccStatsDelta {
            live_bytes: self.live_bytes,
            live_count: self.live_count,
            key_bytes: self.key_bytes,
            val_bytes: self.val_bytes,
            sys_bytes: self.sys_bytes,
            sys_count: self.sys_count,
        }
    }
}

/// The current wire shape of a stats delta carried by a command.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MvccStatsDelta {
    pub live_bytes: i64,
    pub live_count: i64,
    pub key_bytes: i64,
    pub val_bytes: i64,
    pub sys_bytes: i64,
    pub sys_count: i64,
}

impl MvccStatsDelta {
    pub fn is_zero(&self) -> bool {
        *self == MvccStatsDelta::default()
    }
}

/// Authoritative per-replica state summary maintained by the apply pipeline.
///
/// `raft_applied_index` advances by exactly one per committed entry, accepted
/// or rejected. `lease_applied_index` orders commands proposed under the same
/// lease and never decreases.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ReplicaState {
    pub raft_applied_index: u64,
    pub lease_applied_index: u64,
    pub lease: Lease,
    pub desc: RangeDescriptor,
    pub gc_threshold: Timestamp,
    pub truncated_state: TruncatedState,
    pub stats: MvccStats,
    /// On-disk layout flag: true once the combined applied-state record has
    /// replaced the legacy applied-index and stats records.
    pub using_applied_state_key: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timestamp_forward_is_monotonic() {
        let mut ts = Timestamp(10);
        ts.forward(Timestamp(5));
        assert_eq!(ts, Timestamp(10));
        ts.forward(Timestamp(25));
        assert_eq!(ts, Timestamp(25));
    }

    #[test]
    fn lease_equivalence_allows_forward_extension() {
        let holder = ReplicaDescriptor {
            node_id: 1,
            store_id: 1,
            replica_id: 1,
        };
        let base = Lease {
            sequence: 5,
            holder,
            epoch: 0,
            expiration: Timestamp(100),
            proposed_ts: Timestamp(50),
        };
        let mut extended = base.clone();
        extended.expiration = Timestamp(200);
        extended.proposed_ts = Timestamp(80);
        assert!(base.equivalent(&extended));
        assert!(!extended.equivalent(&base));

        let mut other_store = base.clone();
        other_store.holder.store_id = 2;
        assert!(!base.equivalent(&other_store));
    }

    #[test]
    fn lease_equivalence_epoch_based() {
        let holder = ReplicaDescriptor {
            node_id: 1,
            store_id: 1,
            replica_id: 1,
        };
        let a = Lease {
            sequence: 3,
            holder,
            epoch: 7,
            expiration: Timestamp::ZERO,
            proposed_ts: Timestamp(10),
        };
        let mut b = a.clone();
        assert!(a.equivalent(&b));
        b.epoch = 8;
        assert!(!a.equivalent(&b));
    }

    #[test]
    fn stats_delta_round_trip() {
        let mut stats = MvccStats::default();
        stats.add(&MvccStatsDelta {
            live_bytes: 7,
            live_count: 1,
            key_bytes: 3,
            val_bytes: 4,
            sys_bytes: 0,
            sys_count: 0,
        });
        assert_eq!(stats.live_bytes, 7);
        assert_eq!(stats.total_bytes(), 7);
        let delta = stats.to_delta();
        let mut again = MvccStats::default();
        again.add(&delta);
        assert_eq!(again, stats);
    }
}
