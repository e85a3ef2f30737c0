//! Three-phase state-machine driver for committed entries.
//!
//! The consensus layer hands a slice of committed, ordered entries to
//! `apply_committed_entries`. The driver decodes them, groups consecutive
//! trivial commands into one application batch, commits each batch
//! atomically, and then dispatches every staged command's side effects in
//! log order. The replica's raft mutex is held for the driver's entire
//! lifetime, so one pipeline run is single-threaded per replica.

use std::sync::Arc;

use parking_lot::lock_api::ArcMutexGuard;
use parking_lot::RawMutex;

use crate::batch::{ApplicationBatch, Batch, EphemeralBatch};
use crate::cmd::Entry;
use crate::error::NonDeterministicFailure;
use crate::replica::{Replica, Store};

/// Counters for one stretch of entry application; reset by `move_stats`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ApplyLoopStats {
    pub batches_processed: u64,
    pub entries_processed: u64,
    pub state_assertions: u64,
    pub empty_entries: u64,
}

/// Drives the apply pipeline for one replica.
pub struct ReplicaStateMachine {
    pub(crate) store: Arc<Store>,
    pub(crate) replica: Arc<Replica>,
    /// Exclusive pipeline lock, held until the driver is dropped.
    _raft_mu: ArcMutexGuard<RawMutex, ()>,
    pub(crate) stats: ApplyLoopStats,
}

impl ReplicaStateMachine {
    /// Take the replica's raft mutex and return its state machine. Blocks
    /// while a split/merge partner holds the lock.
    pub fn new(store: &Arc<Store>, replica: &Arc<Replica>) -> Self {
        let guard = replica.raft_mu.lock_arc();
        Self {
            store: Arc::clone(store),
            replica: Arc::clone(replica),
            _raft_mu: guard,
            stats: ApplyLoopStats::default(),
        }
    }

    /// Open a fresh batch seeded from the current replica state.
    pub fn new_batch(&self, ephemeral: bool) -> Result<Box<dyn Batch>, NonDeterministicFailure> {
        if ephemeral {
            Ok(Box::new(EphemeralBatch::new(&self.replica)))
        } else {
            Ok(Box::new(ApplicationBatch::new(
                Arc::clone(&self.store),
                Arc::clone(&self.replica),
            )?))
        }
    }

    fn check_usable(&self) -> Result<(), NonDeterministicFailure> {
        if let Some(reason) = self.replica.corrupt_reason() {
            return Err(NonDeterministicFailure::new(format!(
                "replica previously marked corrupt: {reason}"
            )));
        }
        if self.replica.is_destroyed() {
            return Err(NonDeterministicFailure::new("replica is destroyed"));
        }
        Ok(())
    }

    /// Apply a slice of committed entries through all three phases. Any
    /// non-deterministic failure marks the replica corrupt and is returned;
    /// the driver never retries it.
    pub fn apply_committed_entries(
        &mut self,
        entries: &[Entry],
    ) -> Result<(), NonDeterministicFailure> {
        self.check_usable()?;
        let result = self.apply_entries_inner(entries);
        if let Err(err) = &result {
            self.replica.mark_corrupt(err.safe_explanation());
        }
        result
    }

    fn apply_entries_inner(&mut self, entries: &[Entry]) -> Result<(), NonDeterministicFailure> {
        let mut cmds = Vec::with_capacity(entries.len());
        for entry in entries {
            cmds.push(self.replica.decode_entry(entry)?);
        }

        let mut i = 0;
        while i < cmds.len() {
            let mut batch =
                ApplicationBatch::new(Arc::clone(&self.store), Arc::clone(&self.replica))?;
            let start = i;
            if cmds[i].is_trivial() {
                // Group consecutive trivial commands into one flush.
                while i < cmds.len() && cmds[i].is_trivial() {
                    batch.stage(&mut cmds[i])?;
                    i += 1;
                }
            } else {
                // A non-trivial command goes alone in its own batch so its
                // pre-apply triggers never share an atomic unit with other
                // commands' writes.
                batch.stage(&mut cmds[i])?;
                i += 1;
            }
            batch.apply_to_state_machine()?;
            batch.close();
            self.stats.batches_processed += 1;

            for cmd in &mut cmds[start..i] {
                self.stats.entries_processed += 1;
                if cmd.empty_payload {
                    self.stats.empty_entries += 1;
                }
                self.apply_side_effects(cmd)?;
            }
        }
        Ok(())
    }

    /// Predict accept/reject outcomes for `entries` without touching
    /// storage. The ephemeral batch advances only its simulated lease
    /// applied index between commands.
    pub fn would_apply(&self, entries: &[Entry]) -> Result<Vec<bool>, NonDeterministicFailure> {
        let mut batch = EphemeralBatch::new(&self.replica);
        let mut out = Vec::with_capacity(entries.len());
        for entry in entries {
            let mut cmd = self.replica.decode_entry(entry)?;
            batch.stage(&mut cmd)?;
            out.push(!cmd.rejected());
        }
        batch.close();
        Ok(out)
    }

    /// Return and reset the driver's counters.
    pub fn move_stats(&mut self) -> ApplyLoopStats {
        std::mem::take(&mut self.stats)
    }
}
