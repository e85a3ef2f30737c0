//! Application batches: where committed commands are staged and flushed.
//!
//! An `ApplicationBatch` accumulates the writes and trivial state updates of
//! consecutive committed commands and commits them to the storage engine in
//! one atomic step. The `EphemeralBatch` mirrors the staging surface without
//! touching storage; the decoder uses it to predict accept/reject decisions
//! for a slice of entries before the real application runs.

use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, trace};

use crate::cmd::{HardState, MergeTrigger, ReplicatedCmd, SplitTrigger};
use crate::decision::check_forced_err;
use crate::engine::{
    encode_desc_value, encode_gc_threshold_value, encode_hard_state, encode_lease_value,
    encode_legacy_applied_index, encode_mvcc_stats, encode_range_applied_state,
    encode_truncated_state, legacy_applied_index_sys_bytes, range_applied_state_sys_bytes,
    EngineBatch,
    STATE_KEY_DESC, STATE_KEY_GC_THRESHOLD, STATE_KEY_HARD_STATE, STATE_KEY_LEASE,
    STATE_KEY_LEGACY_APPLIED_INDEX, STATE_KEY_LEGACY_STATS, STATE_KEY_RANGE_APPLIED_STATE,
    STATE_KEY_TRUNCATED_STATE,
};
use crate::error::NonDeterministicFailure;
use crate::replica::{Replica, SplitMergeUnlock, Store};
use crate::state::{ReplicaState, Timestamp, TruncatedState};

/// Initial consensus term seeded into a fresh right-hand range's hard state
/// when no votes were cast there yet.
const RHS_INITIAL_TERM: u64 = 1;

/// Staging surface shared by the persistent and ephemeral batches.
pub trait Batch {
    /// Check and stage one decoded command. Staging invariant violations are
    /// non-deterministic failures.
    fn stage(&mut self, cmd: &mut ReplicatedCmd) -> Result<(), NonDeterministicFailure>;
    /// Commit the staged writes and publish the trivial state updates.
    fn apply_to_state_machine(&mut self) -> Result<(), NonDeterministicFailure>;
    /// Release held resources. Idempotent.
    fn close(&mut self);
}

/// Run the accept/reject decision for `cmd` against `state` and record the
/// outcome on the command. Returns whether the command applies.
pub(crate) fn should_apply_command(cmd: &mut ReplicatedCmd, state: &ReplicaState) -> bool {
    let (lease_index, retry, forced_err) =
        check_forced_err(cmd.cmd.id, &cmd.cmd, cmd.is_local(), state);
    cmd.lease_index = lease_index;
    cmd.retry = retry;
    cmd.forced_err = forced_err;
    cmd.forced_err.is_none()
}

fn maybe_acquire_split_merge_lock(
    store: &Store,
    cmd: &ReplicatedCmd,
) -> anyhow::Result<Option<SplitMergeUnlock>> {
    let res = &cmd.cmd.replicated;
    if let Some(split) = &res.split {
        Ok(Some(store.lock_range(split.right_desc.range_id)))
    } else if let Some(merge) = &res.merge {
        let rhs_id = merge.right_desc.range_id;
        anyhow::ensure!(
            store.get_replica(rhs_id).is_some(),
            "merge right-hand replica for range {rhs_id} not found"
        );
        Ok(Some(store.lock_range(rhs_id)))
    } else {
        Ok(None)
    }
}

/// Accumulates one flush worth of writes and trivial state updates.
pub struct ApplicationBatch {
    replica: Arc<Replica>,
    store: Arc<Store>,
    batch: Option<EngineBatch>,
    /// This batch's working view of the replica state; advanced by every
    /// staged command so the next command is checked against the state it
    /// will actually apply on top of.
    state: ReplicaState,
    /// Applied indices and layout flag as of the snapshot this batch opened
    /// with; the system-stats accounting for the applied-state records is
    /// diffed against these at commit time.
    prev_raft_applied_index: u64,
    prev_lease_applied_index: u64,
    prev_using_applied_state_key: bool,
    max_ts: Timestamp,
    migrate_to_applied_state_key: bool,
    entries: u64,
    empty_entries: u64,
    start: Instant,
}

impl ApplicationBatch {
    pub(crate) fn new(
        store: Arc<Store>,
        replica: Arc<Replica>,
    ) -> Result<Self, NonDeterministicFailure> {
        let batch = store
            .engine()
            .new_batch(replica.range_id)
            .map_err(|err| NonDeterministicFailure::wrap(err, "unable to open engine batch"))?;
        let state = replica.state();
        Ok(Self {
            replica,
            store,
            batch: Some(batch),
            prev_raft_applied_index: state.raft_applied_index,
            prev_lease_applied_index: state.lease_applied_index,
            prev_using_applied_state_key: state.using_applied_state_key,
            state,
            max_ts: Timestamp::ZERO,
            migrate_to_applied_state_key: false,
            entries: 0,
            empty_entries: 0,
            start: Instant::now(),
        })
    }

    fn stage_write_batch(&mut self, cmd: &ReplicatedCmd) -> Result<(), NonDeterministicFailure> {
        let Some(bytes) = &cmd.cmd.write_batch else {
            return Ok(());
        };
        let batch = self
            .batch
            .as_mut()
            .ok_or_else(|| NonDeterministicFailure::new("staging into a closed batch"))?;
        batch
            .apply_opaque_batch(bytes)
            .map_err(|err| NonDeterministicFailure::wrap(err, "unable to apply write batch"))?;
        Ok(())
    }

    /// Triggers that must run before the storage commit so that the commit
    /// makes their effects durable together with the normal writes.
    fn run_pre_apply_triggers(
        &mut self,
        cmd: &mut ReplicatedCmd,
    ) -> Result<(), NonDeterministicFailure> {
        // Sideloaded SSTable ingestion runs against the engine before the
        // batch commits, so an applied command implies a durable ingest. The
        // command is non-trivial by construction and alone in its batch, so
        // no earlier command in this batch can shadow the ingested keys.
        if let Some(ingest) = cmd.cmd.replicated.sstable {
            let copied = self
                .replica
                .sideload
                .ingest(
                    self.store.engine(),
                    self.replica.range_id,
                    cmd.entry_term,
                    cmd.entry_index,
                    ingest.data_crc,
                )
                .map_err(|err| {
                    NonDeterministicFailure::wrap(err, "unable to ingest sideloaded sstable")
                })?;
            self.store.metrics().record_sstable_application(copied);
            cmd.cmd.replicated.sstable = None;
        }

        if let Some(split) = cmd.cmd.replicated.split.clone() {
            self.stage_split(&split)
                .map_err(|err| NonDeterministicFailure::wrap(err, "unable to stage split"))?;
        }

        if let Some(merge) = cmd.cmd.replicated.merge.clone() {
            self.stage_merge(&merge).map_err(|err| {
                NonDeterministicFailure::wrap(err, "unable to destroy range before merge")
            })?;
        }

        if let Some(proposed) = cmd.cmd.replicated.truncated_state {
            let applies = self
                .stage_truncation(&proposed)
                .map_err(|err| NonDeterministicFailure::wrap(err, "unable to handle truncation"))?;
            if applies {
                trace!(
                    range = self.replica.range_id,
                    index = proposed.index,
                    "staged log truncation"
                );
            } else {
                // The truncation does not apply locally: some leaseholder has
                // a log with earlier entries than ours and its past log-size
                // deltas were likely off for us too. Drop the truncation and
                // stop trusting the tracked log size.
                cmd.cmd.replicated.truncated_state = None;
                cmd.cmd.replicated.raft_log_delta = 0;
                self.replica.set_log_size_untrusted();
            }
        }

        // Publish the command's logical ops to any change-feed subscriber.
        // An op log without a write batch is a corruption signal; a write
        // batch without an op log is a command outside any feed's interest.
        if cmd.cmd.write_batch.is_some() {
            if let Some(ops) = cmd.cmd.logical_ops.clone() {
                self.replica.publish_logical_ops(ops);
            }
        } else if cmd.cmd.logical_ops.is_some() {
            return Err(NonDeterministicFailure::new(
                "logical op log present without a write batch",
            ));
        }
        Ok(())
    }

    /// Seed the right-hand range's durable state inside this batch: hard
    /// state (merged with votes already cast here), replica state records,
    /// and the data in the right-hand span.
    fn stage_split(&mut self, split: &SplitTrigger) -> anyhow::Result<()> {
        let rhs_id = split.right_desc.range_id;
        let engine = Arc::clone(self.store.engine());
        let batch = self
            .batch
            .as_mut()
            .ok_or_else(|| anyhow::anyhow!("engine batch already closed"))?;

        // The hard state cannot be prepared at evaluation time: it differs
        // per replica because the uninitialized right-hand replica may have
        // voted already.
        let hard_state = match engine.load_hard_state(rhs_id)? {
            Some(existing) => HardState {
                term: existing.term.max(RHS_INITIAL_TERM),
                ..existing
            },
            None => HardState {
                term: RHS_INITIAL_TERM,
                vote: 0,
                commit: 0,
            },
        };
        batch.put_state_for(rhs_id, STATE_KEY_HARD_STATE, encode_hard_state(&hard_state))?;

        if self.state.using_applied_state_key {
            batch.put_state_for(
                rhs_id,
                STATE_KEY_RANGE_APPLIED_STATE,
                encode_range_applied_state(0, 0, &split.right_stats),
            )?;
        } else {
            batch.put_state_for(
                rhs_id,
                STATE_KEY_LEGACY_APPLIED_INDEX,
                encode_legacy_applied_index(0, 0),
            )?;
            batch.put_state_for(
                rhs_id,
                STATE_KEY_LEGACY_STATS,
                encode_mvcc_stats(&split.right_stats),
            )?;
        }
        batch.put_state_for(rhs_id, STATE_KEY_LEASE, encode_lease_value(&self.state.lease)?)?;
        batch.put_state_for(rhs_id, STATE_KEY_DESC, encode_desc_value(&split.right_desc)?)?;
        batch.put_state_for(
            rhs_id,
            STATE_KEY_GC_THRESHOLD,
            encode_gc_threshold_value(self.state.gc_threshold),
        )?;
        batch.put_state_for(
            rhs_id,
            STATE_KEY_TRUNCATED_STATE,
            encode_truncated_state(&Default::default()),
        )?;

        // Move the right-hand span's data into the new range's partition,
        // atomically with the rest of the batch.
        let data = engine.data_partition(self.replica.range_id)?;
        let start = split.right_desc.start_key.clone();
        let iter: Box<dyn Iterator<Item = fjall::Result<fjall::KvPair>>> =
            if split.right_desc.end_key.is_empty() {
                Box::new(data.range(start..))
            } else {
                Box::new(data.range(start..split.right_desc.end_key.clone()))
            };
        let mut moved = 0usize;
        for item in iter {
            let (key, value) = item?;
            batch.put_data_for(rhs_id, key.to_vec(), value.to_vec())?;
            batch.delete_data(key.to_vec());
            moved += 1;
        }
        debug!(
            range = self.replica.range_id,
            rhs = rhs_id,
            moved,
            "staged split of right-hand range"
        );
        Ok(())
    }

    /// Atomically pre-destroy the subsumed right-hand range and pull its data
    /// into this range's partition.
    fn stage_merge(&mut self, merge: &MergeTrigger) -> anyhow::Result<()> {
        let rhs_id = merge.right_desc.range_id;
        anyhow::ensure!(
            self.store.get_replica(rhs_id).is_some(),
            "merge right-hand replica for range {rhs_id} not found"
        );
        let engine = Arc::clone(self.store.engine());
        let batch = self
            .batch
            .as_mut()
            .ok_or_else(|| anyhow::anyhow!("engine batch already closed"))?;
        batch.pre_destroy_range_state(rhs_id, merge.right_desc.next_replica_id)?;

        let rhs_data = engine.data_partition(rhs_id)?;
        let mut moved = 0usize;
        for item in rhs_data.prefix(Vec::<u8>::new()) {
            let (key, value) = item?;
            batch.put_data(key.to_vec(), value.to_vec());
            batch.delete_data_for(rhs_id, key.to_vec())?;
            moved += 1;
        }
        debug!(
            range = self.replica.range_id,
            rhs = rhs_id,
            moved,
            "staged merge of right-hand range"
        );
        Ok(())
    }

    /// Decide whether a proposed truncation applies locally and, if so, stage
    /// its durable record. A truncation behind our current position is stale.
    fn stage_truncation(&mut self, proposed: &TruncatedState) -> anyhow::Result<bool> {
        if proposed.index <= self.state.truncated_state.index {
            return Ok(false);
        }
        let batch = self
            .batch
            .as_mut()
            .ok_or_else(|| anyhow::anyhow!("engine batch already closed"))?;
        batch.put_state(STATE_KEY_TRUNCATED_STATE, encode_truncated_state(proposed));
        Ok(true)
    }

    /// Fold the command's trivial state updates into the working view. The
    /// non-trivial updates stay on the command for the dispatcher; a
    /// non-trivial command is alone in its batch, so deferring them is safe.
    fn stage_trivial_updates(&mut self, cmd: &ReplicatedCmd) {
        if cmd.entry_index != 0 {
            self.state.raft_applied_index = cmd.entry_index;
        }
        if cmd.lease_index != 0 {
            self.state.lease_applied_index = cmd.lease_index;
        }
        let res = &cmd.cmd.replicated;
        // Stats deltas commute, so accumulation needs no ordering across the
        // commands in this batch.
        self.state.stats.add(&res.stats_delta);
        // A split forces a full stats recomputation; the estimates flag does
        // not survive it.
        if res.split.is_some() {
            self.state.stats.contains_estimates = false;
        }
        if res.using_applied_state_key && !self.state.using_applied_state_key {
            self.migrate_to_applied_state_key = true;
        }
    }

    /// Write the applied-state record for this batch, migrating the on-disk
    /// layout first when a staged command requested it.
    fn add_applied_state_key(&mut self) -> Result<(), NonDeterministicFailure> {
        let batch = self
            .batch
            .as_mut()
            .ok_or_else(|| NonDeterministicFailure::new("applied-state write on closed batch"))?;
        if self.migrate_to_applied_state_key {
            // One-way layout migration: drop the legacy records inside this
            // same batch so no commit ever carries both layouts. The legacy
            // applied-index record leaves the system-stats accounting here;
            // the combined record enters it below.
            batch.delete_state(STATE_KEY_LEGACY_APPLIED_INDEX);
            batch.delete_state(STATE_KEY_LEGACY_STATS);
            self.state.stats.sys_bytes -= legacy_applied_index_sys_bytes(
                self.prev_raft_applied_index,
                self.prev_lease_applied_index,
            );
            self.state.using_applied_state_key = true;
        }
        if self.state.using_applied_state_key {
            // Blind write of the combined record. Its footprint is diffed
            // against what the pre-batch state already accounted for, so
            // the record enters the system stats exactly once: when it
            // first holds a non-zero index, or when the migration above
            // just created it.
            let prev = if self.prev_using_applied_state_key {
                range_applied_state_sys_bytes(
                    self.prev_raft_applied_index,
                    self.prev_lease_applied_index,
                )
            } else {
                0
            };
            self.state.stats.sys_bytes += range_applied_state_sys_bytes(
                self.state.raft_applied_index,
                self.state.lease_applied_index,
            ) - prev;
            batch.put_state(
                STATE_KEY_RANGE_APPLIED_STATE,
                encode_range_applied_state(
                    self.state.raft_applied_index,
                    self.state.lease_applied_index,
                    &self.state.stats,
                ),
            );
        } else {
            // Blind write of the applied-index record, with the bookkeeping
            // fix that keeps the system-stats footprint correct without
            // reading the previous record back: the bytes written are
            // diffed against the footprint implied by the pre-batch
            // indices, not the already-advanced ones.
            self.state.stats.sys_bytes += legacy_applied_index_sys_bytes(
                self.state.raft_applied_index,
                self.state.lease_applied_index,
            ) - legacy_applied_index_sys_bytes(
                self.prev_raft_applied_index,
                self.prev_lease_applied_index,
            );
            batch.put_state(
                STATE_KEY_LEGACY_APPLIED_INDEX,
                encode_legacy_applied_index(
                    self.state.raft_applied_index,
                    self.state.lease_applied_index,
                ),
            );
            batch.put_state(STATE_KEY_LEGACY_STATS, encode_mvcc_stats(&self.state.stats));
        }
        Ok(())
    }
}

impl Batch for ApplicationBatch {
    fn stage(&mut self, cmd: &mut ReplicatedCmd) -> Result<(), NonDeterministicFailure> {
        if cmd.entry_index == 0 {
            return Err(NonDeterministicFailure::new(
                "applying a command requires a non-zero entry index",
            ));
        }
        let applied = self.state.raft_applied_index;
        if cmd.entry_index != applied + 1 {
            // An out-of-order index means corruption; nothing may run.
            return Err(NonDeterministicFailure::new(format!(
                "applied index jumped from {applied} to {}",
                cmd.entry_index
            )));
        }

        // Decide accept/reject. The decision is deterministic on every
        // replica: if one rejects, all do, and the command applies as an
        // empty entry so the applied index still advances.
        if !should_apply_command(cmd, &self.state) {
            if let Some(forced_err) = &cmd.forced_err {
                debug!(
                    range = self.replica.range_id,
                    index = cmd.entry_index,
                    %forced_err,
                    "applying command with forced error"
                );
            }
            cmd.cmd.replicated = Default::default();
            cmd.cmd.write_batch = None;
            cmd.cmd.logical_ops = None;
        }

        // Coordinate with the split/merge partner range. A rejected command
        // had its result wiped above, so this is a no-op for it.
        match maybe_acquire_split_merge_lock(&self.store, cmd) {
            Ok(Some(unlock)) => cmd.split_merge_unlock = Some(unlock),
            Ok(None) => {}
            Err(err) => {
                return Err(NonDeterministicFailure::wrap(
                    err,
                    "unable to acquire split/merge lock",
                ))
            }
        }

        self.max_ts.forward(cmd.cmd.replicated.timestamp);

        // Normalize a command still carrying the retired stats-delta shape.
        if let Some(legacy) = cmd.cmd.replicated.legacy_stats_delta.take() {
            if !cmd.cmd.replicated.stats_delta.is_zero() {
                return Err(NonDeterministicFailure::new(
                    "stats delta and legacy stats delta both populated",
                ));
            }
            cmd.cmd.replicated.stats_delta = legacy.to_delta();
        }

        self.stage_write_batch(cmd)?;
        self.run_pre_apply_triggers(cmd)?;
        self.stage_trivial_updates(cmd);

        self.entries += 1;
        if cmd.empty_payload {
            self.empty_entries += 1;
        }
        Ok(())
    }

    fn apply_to_state_machine(&mut self) -> Result<(), NonDeterministicFailure> {
        // Publish the batch's maximum timestamp so every later operation on
        // this node observes a clock past everything applied here.
        self.store.clock().update(self.max_ts);

        self.add_applied_state_key()?;

        let batch = self
            .batch
            .take()
            .ok_or_else(|| NonDeterministicFailure::new("commit of a closed batch"))?;
        let mutations = batch.mutations() as u64;
        // Commit without fsync: batch atomicity plus the applied-state record
        // guarantee that a torn commit is simply re-applied on recovery.
        batch
            .commit(false)
            .map_err(|err| NonDeterministicFailure::wrap(err, "unable to commit entry batch"))?;

        let (needs_split, needs_merge, delta) = {
            let mut inner = self.replica.mu.write();
            let mut delta = self.state.stats;
            delta.subtract(&inner.state.stats);
            inner.state.raft_applied_index = self.state.raft_applied_index;
            inner.state.lease_applied_index = self.state.lease_applied_index;
            inner.state.stats = self.state.stats;
            let total = inner.state.stats.total_bytes().max(0) as u64;
            (
                total >= self.store.config().split_size_bytes,
                total < self.store.config().merge_size_bytes,
                delta,
            )
        };

        let metrics = self.store.metrics();
        metrics.add_mvcc_delta(&delta);
        metrics.record_batch(self.entries, self.empty_entries, mutations);
        metrics.record_commit_latency(self.start.elapsed());

        // Advisory queue hints; nothing in the pipeline depends on them.
        let now = Instant::now();
        if needs_split && self.replica.split_throttle.should_process(now) {
            self.store.enqueue_split_hint(self.replica.range_id);
        }
        if needs_merge && self.replica.merge_throttle.should_process(now) {
            self.store.enqueue_merge_hint(self.replica.range_id);
        }
        Ok(())
    }

    fn close(&mut self) {
        self.batch = None;
        self.entries = 0;
        self.empty_entries = 0;
        self.max_ts = crate::state::Timestamp::ZERO;
        self.migrate_to_applied_state_key = false;
    }
}

/// Staging-only batch: advances a simulated lease applied index so the
/// decoder can predict decisions for later commands in the same slice.
pub struct EphemeralBatch {
    state: ReplicaState,
}

impl EphemeralBatch {
    pub(crate) fn new(replica: &Replica) -> Self {
        Self {
            state: replica.state(),
        }
    }
}

impl Batch for EphemeralBatch {
    fn stage(&mut self, cmd: &mut ReplicatedCmd) -> Result<(), NonDeterministicFailure> {
        should_apply_command(cmd, &self.state);
        self.state.lease_applied_index = cmd.lease_index;
        Ok(())
    }

    fn apply_to_state_machine(&mut self) -> Result<(), NonDeterministicFailure> {
        panic!("cannot apply an ephemeral batch to the state machine");
    }

    fn close(&mut self) {}
}
