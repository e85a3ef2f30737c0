//! Committed log entries and their decoded command form.
//!
//! An `Entry` is the opaque ordered unit handed down by the consensus layer.
//! Decoding yields a `ReplicatedCmd`: the evaluated command plus the
//! bookkeeping fields the pipeline fills in while staging (assigned lease
//! index, retry disposition, forced rejection, scoped split/merge lock).

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::decision::ProposalRetry;
use crate::error::Rejection;
use crate::replica::{Proposal, SplitMergeUnlock};
use crate::state::{
    Lease, MvccStats, MvccStatsDelta, RangeDescriptor, ReplicaDescriptor, Timestamp,
    TruncatedState,
};

/// Kind of a committed log entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryKind {
    Normal,
    ConfChange,
}

/// One committed, ordered entry from the consensus log.
#[derive(Clone, Debug)]
pub struct Entry {
    pub index: u64,
    pub term: u64,
    pub kind: EntryKind,
    /// Serialized `RaftCommand`; empty for log-internal no-ops.
    pub data: Vec<u8>,
}

impl Entry {
    /// Encode `cmd` into a normal entry at `(index, term)`.
    pub fn encode(index: u64, term: u64, kind: EntryKind, cmd: &RaftCommand) -> anyhow::Result<Entry> {
        let data = serde_json::to_vec(cmd)?;
        Ok(Entry {
            index,
            term,
            kind,
            data,
        })
    }
}

/// Opaque command identity, stable across reproposals. Zero means "none",
/// which is only legal for log-internal no-op entries.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct CommandId(pub u64);

impl CommandId {
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl std::fmt::Display for CommandId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Durable consensus state seeded for a freshly split right-hand range.
///
/// Written below the apply batch so the split is atomic with ordinary data
/// writes; it differs per replica because votes may already have been cast.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HardState {
    pub term: u64,
    pub vote: u64,
    pub commit: u64,
}

/// Effect descriptor: divide a range in two at a split key.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SplitTrigger {
    pub left_desc: RangeDescriptor,
    pub right_desc: RangeDescriptor,
    /// Stats computed for the right-hand side at evaluation time; seeds the
    /// new range's applied-state record.
    pub right_stats: MvccStats,
}

/// Effect descriptor: absorb the right-hand range into the left.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MergeTrigger {
    pub left_desc: RangeDescriptor,
    pub right_desc: RangeDescriptor,
}

/// Kind of replica-set change carried by a conf-change command.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplicaChangeKind {
    AddVoter,
    RemoveVoter,
}

/// Effect descriptor: add or remove a voter.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChangeReplicas {
    pub kind: ReplicaChangeKind,
    pub replica: ReplicaDescriptor,
    pub updated_replicas: Vec<ReplicaDescriptor>,
}

/// Change handed to the consensus group after a conf-change entry applies.
/// The default value is the zero change (used for rejected commands).
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ConfChange {
    pub change: Option<(ReplicaChangeKind, ReplicaDescriptor)>,
}

/// Effect descriptor: checksum the range's data for a consistency check.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComputeChecksum {
    pub checksum_id: u64,
}

/// Effect descriptor: advisory compaction hint for a key span.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SuggestedCompaction {
    pub start_key: Vec<u8>,
    pub end_key: Vec<u8>,
    pub bytes: i64,
}

/// Effect descriptor: ingest the sideloaded SSTable stored for this entry's
/// `(term, index)`. The payload checksum guards the sideloaded file.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SstableIngest {
    pub data_crc: u32,
}

/// One logical operation for the change-feed stream.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum LogicalOp {
    WriteValue { key: Vec<u8>, value: Vec<u8> },
    DeleteValue { key: Vec<u8> },
}

/// The structured, deterministic output of evaluating a command.
///
/// Modeled as a record of optional effects rather than a tagged variant
/// because several may co-occur (a split also carries a stats delta and a
/// descriptor change). The side-effect dispatcher consumes each field it
/// handles and asserts afterwards that nothing is left.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ReplicatedEvalResult {
    pub is_lease_request: bool,
    pub timestamp: Timestamp,
    pub stats_delta: MvccStatsDelta,
    /// Stats delta in the retired wire shape; converted during staging.
    /// It is fatal for both shapes to be populated.
    pub legacy_stats_delta: Option<Box<MvccStats>>,
    /// Proposed timestamp of the lease this request was evaluated under;
    /// guards lease extensions that do not bump the sequence.
    pub prev_lease_proposal: Option<Timestamp>,
    pub block_reads: bool,
    pub raft_log_delta: i64,
    pub truncated_state: Option<TruncatedState>,
    pub lease: Option<Box<Lease>>,
    pub desc: Option<Box<RangeDescriptor>>,
    pub gc_threshold: Option<Timestamp>,
    pub using_applied_state_key: bool,
    pub split: Option<Box<SplitTrigger>>,
    pub merge: Option<Box<MergeTrigger>>,
    pub change_replicas: Option<ChangeReplicas>,
    pub compute_checksum: Option<ComputeChecksum>,
    pub suggested_compactions: Vec<SuggestedCompaction>,
    pub sstable: Option<SstableIngest>,
}

impl ReplicatedEvalResult {
    /// True when every effect field is absent.
    pub fn is_empty(&self) -> bool {
        *self == ReplicatedEvalResult::default()
    }

    /// Zero the fields absorbed at staging time so the post-dispatch
    /// exhaustion assertion only sees effects that need explicit handling.
    pub fn clear_trivial_fields(&mut self) {
        self.is_lease_request = false;
        self.timestamp = Timestamp::ZERO;
        self.stats_delta = MvccStatsDelta::default();
        self.legacy_stats_delta = None;
        self.prev_lease_proposal = None;
    }

    /// A command is trivial iff nothing remains after clearing the staged
    /// fields. Must be computed identically on every replica: the batching
    /// policy depends on it.
    pub fn is_trivial(&self) -> bool {
        let mut residual = self.clone();
        residual.clear_trivial_fields();
        residual.is_empty()
    }
}

/// The evaluated command as carried by a log entry.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct RaftCommand {
    pub id: CommandId,
    /// Ordering bound for normal commands: the command must apply at a lease
    /// applied index strictly above the indices already consumed.
    pub max_lease_index: u64,
    pub proposer_lease_sequence: u64,
    pub proposer_replica: ReplicaDescriptor,
    /// Full lease carried by proposers predating lease sequences.
    pub legacy_proposer_lease: Option<Box<Lease>>,
    pub replicated: ReplicatedEvalResult,
    /// Opaque bytes for the storage engine; absent for read-only or
    /// effect-only commands.
    pub write_batch: Option<Vec<u8>>,
    /// Change-feed stream mirroring the write batch. Present ⇔ `write_batch`
    /// is present (enforced during staging).
    pub logical_ops: Option<Vec<LogicalOp>>,
}

/// A decoded command moving through the three apply phases.
pub struct ReplicatedCmd {
    pub entry_index: u64,
    pub entry_term: u64,
    pub entry_kind: EntryKind,
    /// True when the raw entry payload was empty (log-internal no-op).
    pub empty_payload: bool,
    pub cmd: RaftCommand,
    /// The waiting local proposal, when this replica proposed the command.
    pub proposal: Option<Arc<Proposal>>,

    // Populated during staging.
    pub lease_index: u64,
    pub retry: ProposalRetry,
    pub forced_err: Option<Rejection>,
    pub split_merge_unlock: Option<SplitMergeUnlock>,
}

impl ReplicatedCmd {
    /// Whether this replica is waiting on the command's completion.
    pub fn is_local(&self) -> bool {
        self.proposal.is_some()
    }

    /// Whether the command was rejected beneath consensus.
    pub fn rejected(&self) -> bool {
        self.forced_err.is_some()
    }

    pub fn is_trivial(&self) -> bool {
        self.cmd.replicated.is_trivial()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_result_is_empty_and_trivial() {
        let res = ReplicatedEvalResult::default();
        assert!(res.is_empty());
        assert!(res.is_trivial());
    }

    #[test]
    fn stats_and_timestamp_are_trivial() {
        let res = ReplicatedEvalResult {
            timestamp: Timestamp(60),
            stats_delta: MvccStatsDelta {
                live_bytes: 7,
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(!res.is_empty());
        assert!(res.is_trivial());
    }

    #[test]
    fn split_and_layout_adoption_are_non_trivial() {
        let res = ReplicatedEvalResult {
            split: Some(Box::new(SplitTrigger {
                left_desc: RangeDescriptor::default(),
                right_desc: RangeDescriptor::default(),
                right_stats: MvccStats::default(),
            })),
            ..Default::default()
        };
        assert!(!res.is_trivial());

        let res = ReplicatedEvalResult {
            using_applied_state_key: true,
            ..Default::default()
        };
        assert!(!res.is_trivial());
    }

    #[test]
    fn entry_round_trip() {
        let cmd = RaftCommand {
            id: CommandId(42),
            max_lease_index: 101,
            proposer_lease_sequence: 5,
            ..Default::default()
        };
        let entry = Entry::encode(11, 3, EntryKind::Normal, &cmd).expect("encode");
        let decoded: RaftCommand = serde_json::from_slice(&entry.data).expect("decode");
        assert_eq!(decoded.id, CommandId(42));
        assert_eq!(decoded.max_lease_index, 101);
    }
}
