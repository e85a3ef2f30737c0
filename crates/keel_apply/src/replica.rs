//! Replica and store runtime state for the apply pipeline.
//!
//! The `Store` owns the storage engine, the node clock, and the registry of
//! replicas hosted on this store. Each `Replica` holds the authoritative
//! in-memory `ReplicaState` for its range, the raft mutex serializing its
//! apply pipeline, the registry of waiting local proposals, and the
//! per-range collaborator hooks (change feed, consensus group, queues).

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{Receiver, Sender};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::lock_api::ArcMutexGuard;
use parking_lot::{Mutex, RawMutex, RwLock};
use tracing::{debug, warn};

use crate::clock::NodeClock;
use crate::cmd::{
    CommandId, ConfChange, Entry, LogicalOp, RaftCommand, ReplicatedCmd, SuggestedCompaction,
};
use crate::config::ApplyConfig;
use crate::decision::ProposalRetry;
use crate::engine::{
    encode_desc_value, encode_gc_threshold_value, encode_lease_value,
    encode_legacy_applied_index, encode_mvcc_stats, encode_range_applied_state,
    encode_truncated_state, legacy_applied_index_sys_bytes, range_applied_state_sys_bytes,
    RangeEngine, SideloadStorage, STATE_KEY_DESC, STATE_KEY_GC_THRESHOLD,
    STATE_KEY_LEASE, STATE_KEY_LEGACY_APPLIED_INDEX, STATE_KEY_LEGACY_STATS,
    STATE_KEY_RANGE_APPLIED_STATE, STATE_KEY_TRUNCATED_STATE,
};
use crate::error::{NonDeterministicFailure, RejectedProposal};
use crate::metrics::ApplyMetrics;
use crate::state::{RangeId, ReplicaState, StoreId};

/// Hook into the consensus group for a range. The dispatcher reports applied
/// configuration changes through this seam; everything else about consensus
/// stays outside the pipeline.
pub trait RaftGroup: Send + Sync {
    fn apply_conf_change(&self, cc: ConfChange) -> anyhow::Result<()>;
}

/// Reply delivered to a waiting local proposer.
pub type ProposalReply = Result<LocalResult, RejectedProposal>;

/// Normal completion payload for a local command.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LocalResult {
    pub id: CommandId,
    pub entry_index: u64,
    pub lease_index: u64,
}

/// A command this replica proposed and is waiting on.
pub struct Proposal {
    pub id: CommandId,
    pub max_lease_index: u64,
    /// Set once the proposal has applied successfully; a second successful
    /// application of the same proposal is a corruption signal.
    pub(crate) applied: Mutex<bool>,
    reply_tx: Sender<ProposalReply>,
}

impl Proposal {
    pub(crate) fn deliver(&self, reply: ProposalReply) {
        if self.reply_tx.send(reply).is_err() {
            debug!(command = %self.id, "proposal waiter went away before reply");
        }
    }
}

/// Scoped release token for the split/merge coordination lock.
///
/// Acquired while staging a split or merge command and released after its
/// side effects ran; dropping the token releases on every exit path.
pub struct SplitMergeUnlock {
    guard: Option<ArcMutexGuard<RawMutex, ()>>,
}

impl SplitMergeUnlock {
    pub(crate) fn new(guard: ArcMutexGuard<RawMutex, ()>) -> Self {
        Self { guard: Some(guard) }
    }

    pub fn release(&mut self) {
        self.guard.take();
    }
}

/// Minimum-interval gate for advisory queue hints.
pub(crate) struct Throttle {
    min_interval: Duration,
    last: Mutex<Option<Instant>>,
}

impl Throttle {
    pub(crate) fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last: Mutex::new(None),
        }
    }

    pub(crate) fn should_process(&self, now: Instant) -> bool {
        let mut last = self.last.lock();
        match *last {
            Some(prev) if now.saturating_duration_since(prev) < self.min_interval => false,
            _ => {
                *last = Some(now);
                true
            }
        }
    }
}

/// One store: the storage engine plus every replica hosted on it.
pub struct Store {
    store_id: StoreId,
    engine: Arc<RangeEngine>,
    clock: Arc<NodeClock>,
    metrics: Arc<ApplyMetrics>,
    config: ApplyConfig,
    aux_dir: PathBuf,
    replicas: RwLock<HashMap<RangeId, Arc<Replica>>>,
    /// Coordination locks for ranges without a resident replica (the
    /// right-hand side of an in-flight split).
    range_locks: Mutex<HashMap<RangeId, Arc<Mutex<()>>>>,
    split_queue: Mutex<Option<Sender<RangeId>>>,
    merge_queue: Mutex<Option<Sender<RangeId>>>,
    compactor: Mutex<Option<Sender<SuggestedCompaction>>>,
}

impl Store {
    /// Open a store rooted at `path` with the given configuration.
    pub fn open(store_id: StoreId, path: impl AsRef<Path>, config: ApplyConfig) -> anyhow::Result<Arc<Self>> {
        let path = path.as_ref();
        let engine = Arc::new(RangeEngine::open(path.join("engine"))?);
        Ok(Arc::new(Self {
            store_id,
            engine,
            clock: Arc::new(NodeClock::new()),
            metrics: Arc::new(ApplyMetrics::new()),
            config,
            aux_dir: path.join("aux"),
            replicas: RwLock::new(HashMap::new()),
            range_locks: Mutex::new(HashMap::new()),
            split_queue: Mutex::new(None),
            merge_queue: Mutex::new(None),
            compactor: Mutex::new(None),
        }))
    }

    pub fn store_id(&self) -> StoreId {
        self.store_id
    }

    pub fn engine(&self) -> &Arc<RangeEngine> {
        &self.engine
    }

    pub fn clock(&self) -> &Arc<NodeClock> {
        &self.clock
    }

    pub fn metrics(&self) -> &Arc<ApplyMetrics> {
        &self.metrics
    }

    pub fn config(&self) -> &ApplyConfig {
        &self.config
    }

    pub fn get_replica(&self, range_id: RangeId) -> Option<Arc<Replica>> {
        self.replicas.read().get(&range_id).cloned()
    }

    pub fn remove_replica(&self, range_id: RangeId) {
        self.replicas.write().remove(&range_id);
    }

    /// Persist an initial replica state and register the replica. Used at
    /// range bootstrap (and by split execution for the new right-hand side).
    ///
    /// The applied-state record written here enters the system-stats
    /// accounting now; the blind rewrites of later commits diff against it.
    pub fn bootstrap_replica(
        self: &Arc<Self>,
        mut state: ReplicaState,
    ) -> anyhow::Result<Arc<Replica>> {
        let range_id = state.desc.range_id;
        state.stats.sys_bytes += if state.using_applied_state_key {
            range_applied_state_sys_bytes(state.raft_applied_index, state.lease_applied_index)
        } else {
            legacy_applied_index_sys_bytes(state.raft_applied_index, state.lease_applied_index)
        };
        let state_partition = self.engine.state_partition(range_id)?;
        if state.using_applied_state_key {
            state_partition.insert(
                STATE_KEY_RANGE_APPLIED_STATE,
                encode_range_applied_state(
                    state.raft_applied_index,
                    state.lease_applied_index,
                    &state.stats,
                ),
            )?;
        } else {
            state_partition.insert(
                STATE_KEY_LEGACY_APPLIED_INDEX,
                encode_legacy_applied_index(state.raft_applied_index, state.lease_applied_index),
            )?;
            state_partition.insert(STATE_KEY_LEGACY_STATS, encode_mvcc_stats(&state.stats))?;
        }
        state_partition.insert(STATE_KEY_LEASE, encode_lease_value(&state.lease)?)?;
        state_partition.insert(STATE_KEY_DESC, encode_desc_value(&state.desc)?)?;
        state_partition.insert(
            STATE_KEY_GC_THRESHOLD,
            encode_gc_threshold_value(state.gc_threshold),
        )?;
        state_partition.insert(
            STATE_KEY_TRUNCATED_STATE,
            encode_truncated_state(&state.truncated_state),
        )?;
        self.materialize_replica(range_id)
    }

    /// Build a replica from its on-disk state and register it.
    pub fn materialize_replica(self: &Arc<Self>, range_id: RangeId) -> anyhow::Result<Arc<Replica>> {
        let state = self.engine.load_replica_state(range_id)?;
        let replica = Replica::new(self, range_id, state)?;
        self.replicas.write().insert(range_id, Arc::clone(&replica));
        Ok(replica)
    }

    /// Acquire the cross-range coordination lock for `range_id`: the resident
    /// replica's raft mutex when one exists, a store-level placeholder when
    /// the range has no replica here yet.
    pub(crate) fn lock_range(&self, range_id: RangeId) -> SplitMergeUnlock {
        if let Some(replica) = self.get_replica(range_id) {
            return SplitMergeUnlock::new(replica.raft_mu.lock_arc());
        }
        let lock = {
            let mut locks = self.range_locks.lock();
            Arc::clone(locks.entry(range_id).or_default())
        };
        SplitMergeUnlock::new(lock.lock_arc())
    }

    pub fn set_split_queue(&self, tx: Sender<RangeId>) {
        *self.split_queue.lock() = Some(tx);
    }

    pub fn set_merge_queue(&self, tx: Sender<RangeId>) {
        *self.merge_queue.lock() = Some(tx);
    }

    pub fn set_compactor(&self, tx: Sender<SuggestedCompaction>) {
        *self.compactor.lock() = Some(tx);
    }

    pub(crate) fn enqueue_split_hint(&self, range_id: RangeId) {
        let guard = self.split_queue.lock();
        if let Some(tx) = guard.as_ref() {
            let _ = tx.send(range_id);
        }
    }

    pub(crate) fn enqueue_merge_hint(&self, range_id: RangeId) {
        let guard = self.merge_queue.lock();
        if let Some(tx) = guard.as_ref() {
            let _ = tx.send(range_id);
        }
    }

    pub(crate) fn suggest_compaction(&self, suggestion: SuggestedCompaction) {
        let guard = self.compactor.lock();
        if let Some(tx) = guard.as_ref() {
            let _ = tx.send(suggestion);
        }
    }
}

pub(crate) struct ReplicaInner {
    pub state: ReplicaState,
    pub raft_log_size: i64,
    pub raft_log_size_trusted: bool,
    pub destroyed: bool,
    pub corrupt: Option<String>,
}

/// One replica of one range.
pub struct Replica {
    pub range_id: RangeId,
    store: Weak<Store>,
    /// Serializes the apply pipeline; held by the state-machine driver for
    /// its whole lifetime and by split/merge partners via `lock_range`.
    pub(crate) raft_mu: Arc<Mutex<()>>,
    pub(crate) mu: RwLock<ReplicaInner>,
    /// Excludes read-only commands while a `block_reads` command dispatches.
    pub(crate) read_only_cmd_mu: RwLock<()>,
    proposals: Mutex<HashMap<CommandId, Arc<Proposal>>>,
    rangefeed: Mutex<Option<Sender<Vec<LogicalOp>>>>,
    raft_group: Mutex<Option<Arc<dyn RaftGroup>>>,
    pub(crate) sideload: SideloadStorage,
    checksums: Mutex<HashMap<u64, u32>>,
    pub(crate) split_throttle: Throttle,
    pub(crate) merge_throttle: Throttle,
}

impl Replica {
    pub(crate) fn new(
        store: &Arc<Store>,
        range_id: RangeId,
        state: ReplicaState,
    ) -> anyhow::Result<Arc<Self>> {
        let sideload = SideloadStorage::open(&store.aux_dir, range_id)?;
        Ok(Arc::new(Self {
            range_id,
            store: Arc::downgrade(store),
            raft_mu: Arc::new(Mutex::new(())),
            mu: RwLock::new(ReplicaInner {
                state,
                raft_log_size: 0,
                raft_log_size_trusted: true,
                destroyed: false,
                corrupt: None,
            }),
            read_only_cmd_mu: RwLock::new(()),
            proposals: Mutex::new(HashMap::new()),
            rangefeed: Mutex::new(None),
            raft_group: Mutex::new(None),
            sideload,
            checksums: Mutex::new(HashMap::new()),
            split_throttle: Throttle::new(store.config.split_queue_interval()),
            merge_throttle: Throttle::new(store.config.merge_queue_interval()),
        }))
    }

    pub(crate) fn store(&self) -> anyhow::Result<Arc<Store>> {
        self.store
            .upgrade()
            .ok_or_else(|| anyhow::anyhow!("store shut down"))
    }

    /// Shallow snapshot of the current replica state, suitable for reading
    /// during staging. The batch mutates its own copy; the live state only
    /// changes when a batch commit publishes it.
    pub fn state(&self) -> ReplicaState {
        self.mu.read().state.clone()
    }

    pub fn raft_log_size(&self) -> (i64, bool) {
        let inner = self.mu.read();
        (inner.raft_log_size, inner.raft_log_size_trusted)
    }

    /// Reset the tracked log size; called by the log layer after an append
    /// or a recomputation.
    pub fn set_raft_log_size(&self, size: i64) {
        self.mu.write().raft_log_size = size.max(0);
    }

    /// Sideloaded-SSTable store for this range; the log layer parks
    /// oversized command payloads here.
    pub fn sideload(&self) -> &SideloadStorage {
        &self.sideload
    }

    pub fn is_destroyed(&self) -> bool {
        self.mu.read().destroyed
    }

    pub(crate) fn mark_destroyed(&self) {
        self.mu.write().destroyed = true;
    }

    /// Record a non-deterministic failure. The replica refuses further
    /// pipeline work once corrupt.
    pub fn mark_corrupt(&self, explanation: &str) {
        let mut inner = self.mu.write();
        if inner.corrupt.is_none() {
            warn!(range = self.range_id, explanation, "replica marked corrupt");
            inner.corrupt = Some(explanation.to_string());
        }
    }

    pub fn corrupt_reason(&self) -> Option<String> {
        self.mu.read().corrupt.clone()
    }

    /// Register a local proposal and return the waiter's reply channel.
    pub fn register_proposal(
        &self,
        id: CommandId,
        max_lease_index: u64,
    ) -> Receiver<ProposalReply> {
        let (tx, rx) = std::sync::mpsc::channel();
        let proposal = Arc::new(Proposal {
            id,
            max_lease_index,
            applied: Mutex::new(false),
            reply_tx: tx,
        });
        self.proposals.lock().insert(id, proposal);
        rx
    }

    pub(crate) fn lookup_proposal(&self, id: CommandId) -> Option<Arc<Proposal>> {
        self.proposals.lock().get(&id).cloned()
    }

    pub(crate) fn forget_proposal(&self, id: CommandId) {
        self.proposals.lock().remove(&id);
    }

    /// Subscribe a change feed to this replica's logical op stream.
    pub fn subscribe_rangefeed(&self) -> Receiver<Vec<LogicalOp>> {
        let (tx, rx) = std::sync::mpsc::channel();
        *self.rangefeed.lock() = Some(tx);
        rx
    }

    pub(crate) fn publish_logical_ops(&self, ops: Vec<LogicalOp>) {
        let mut guard = self.rangefeed.lock();
        if let Some(tx) = guard.as_ref() {
            if tx.send(ops).is_err() {
                // Subscriber went away; drop the registration.
                *guard = None;
            }
        }
    }

    pub fn set_raft_group(&self, group: Arc<dyn RaftGroup>) {
        *self.raft_group.lock() = Some(group);
    }

    pub(crate) fn raft_group(&self) -> Option<Arc<dyn RaftGroup>> {
        self.raft_group.lock().clone()
    }

    pub(crate) fn record_checksum(&self, checksum_id: u64, checksum: u32) {
        self.checksums.lock().insert(checksum_id, checksum);
    }

    /// Result of a previously applied compute-checksum command, if any.
    pub fn computed_checksum(&self, checksum_id: u64) -> Option<u32> {
        self.checksums.lock().get(&checksum_id).copied()
    }

    pub(crate) fn set_log_size_untrusted(&self) {
        self.mu.write().raft_log_size_trusted = false;
    }

    pub(crate) fn handle_raft_log_delta(&self, delta: i64) {
        let mut inner = self.mu.write();
        inner.raft_log_size = (inner.raft_log_size + delta).max(0);
    }

    /// Hook invoked when a command produced no log-size delta. Once nothing
    /// is outstanding the tracked size can be trusted again.
    pub(crate) fn handle_no_log_delta(&self) {
        let mut inner = self.mu.write();
        if !inner.raft_log_size_trusted && inner.raft_log_size == 0 {
            inner.raft_log_size_trusted = true;
        }
    }

    /// Decode one committed entry into its pipeline form, resolving whether a
    /// local proposal is waiting on it.
    pub fn decode_entry(&self, entry: &Entry) -> Result<ReplicatedCmd, NonDeterministicFailure> {
        let cmd: RaftCommand = if entry.data.is_empty() {
            RaftCommand::default()
        } else {
            serde_json::from_slice(&entry.data).map_err(|err| {
                NonDeterministicFailure::wrap(err.into(), "unable to decode committed entry")
            })?
        };
        let proposal = if cmd.id.is_empty() {
            None
        } else {
            self.lookup_proposal(cmd.id)
        };
        Ok(ReplicatedCmd {
            entry_index: entry.index,
            entry_term: entry.term,
            entry_kind: entry.kind,
            empty_payload: entry.data.is_empty(),
            cmd,
            proposal,
            lease_index: 0,
            retry: ProposalRetry::NoReevaluation,
            forced_err: None,
            split_merge_unlock: None,
        })
    }
}
