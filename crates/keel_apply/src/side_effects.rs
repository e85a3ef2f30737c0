//! Post-commit side-effect dispatch.
//!
//! Runs per command, after the application batch committed. Trivial commands
//! only finalize their local waiter; non-trivial commands run their effect
//! handlers and then the on-disk vs in-memory state assertion. Every handler
//! consumes the field it handles; a residual effect afterwards means the
//! dispatcher does not know about a new effect kind, which is fatal.

use tracing::{debug, info};

use crate::cmd::{
    ChangeReplicas, ComputeChecksum, ConfChange, EntryKind, MergeTrigger, ReplicatedCmd,
    SplitTrigger,
};
use crate::error::{NonDeterministicFailure, RejectedProposal};
use crate::driver::ReplicaStateMachine;
use crate::replica::{LocalResult, ProposalReply};
use crate::state::TruncatedState;

impl ReplicaStateMachine {
    /// Third phase: realize one staged command's non-trivial effects and
    /// notify its local waiter.
    pub fn apply_side_effects(
        &mut self,
        cmd: &mut ReplicatedCmd,
    ) -> Result<(), NonDeterministicFailure> {
        // The scoped split/merge lock releases when this guard drops, on
        // every exit path below.
        let _unlock = cmd.split_merge_unlock.take();

        let replica = std::sync::Arc::clone(&self.replica);
        let _read_block = if cmd.cmd.replicated.block_reads {
            cmd.cmd.replicated.block_reads = false;
            Some(replica.read_only_cmd_mu.write())
        } else {
            None
        };

        // Capture the replica-set change before handlers consume it; the
        // consensus group is informed after dispatch.
        let change_replicas = cmd.cmd.replicated.change_replicas.clone();

        // Prepare the reply before running non-trivial effects so observers
        // of the handlers see the finalized local outcome.
        let local_reply = self.prepare_local_result(cmd);

        cmd.cmd.replicated.clear_trivial_fields();

        let mut produced_log_delta = false;
        if !cmd.cmd.replicated.is_empty() {
            if cmd.rejected() {
                // Stage wiped rejected commands; live effects here mean a
                // non-trivial effect leaked past it.
                return Err(NonDeterministicFailure::new(
                    "rejected command reached side-effect dispatch with live effects",
                ));
            }
            let (should_assert, had_delta) = self.handle_non_trivial_result(cmd)?;
            produced_log_delta = had_delta;
            if should_assert {
                // Run the assertion before acknowledging the waiter.
                self.assert_state()?;
                self.store.metrics().record_state_assertion();
                self.stats.state_assertions += 1;
            }
        }

        if !produced_log_delta {
            self.replica.handle_no_log_delta();
        }

        self.maybe_apply_conf_change(cmd, change_replicas)?;

        self.finish_local(cmd, local_reply)?;
        Ok(())
    }

    fn prepare_local_result(&self, cmd: &ReplicatedCmd) -> Option<ProposalReply> {
        if !cmd.is_local() {
            return None;
        }
        Some(match &cmd.forced_err {
            Some(rejection) => Err(RejectedProposal {
                rejection: rejection.clone(),
                retry: cmd.retry,
            }),
            None => Ok(LocalResult {
                id: cmd.cmd.id,
                entry_index: cmd.entry_index,
                lease_index: cmd.lease_index,
            }),
        })
    }

    /// Run the handlers for every remaining effect, in a fixed order. Each
    /// handler clears its own field. Returns whether the state assertion
    /// must run and whether a log-size delta was produced.
    fn handle_non_trivial_result(
        &mut self,
        cmd: &mut ReplicatedCmd,
    ) -> Result<(bool, bool), NonDeterministicFailure> {
        let res = &mut cmd.cmd.replicated;

        if let Some(truncated) = res.truncated_state.take() {
            res.raft_log_delta += self
                .handle_truncated_state_result(&truncated)
                .map_err(|err| {
                    NonDeterministicFailure::wrap(err, "unable to apply log truncation")
                })?;
        }

        let mut produced_log_delta = false;
        if res.raft_log_delta != 0 {
            self.replica.handle_raft_log_delta(res.raft_log_delta);
            res.raft_log_delta = 0;
            produced_log_delta = true;
        }

        if !res.suggested_compactions.is_empty() {
            let suggestions = std::mem::take(&mut res.suggested_compactions);
            for suggestion in suggestions {
                self.store.suggest_compaction(suggestion);
            }
        }

        // The remaining effects reshape the replica's in-memory and on-disk
        // state; if any is present the two must be asserted equal afterwards.
        let should_assert = !res.is_empty();
        if !should_assert {
            return Ok((false, produced_log_delta));
        }

        if let Some(split) = res.split.take() {
            self.handle_split_result(&split)?;
        }
        if let Some(merge) = res.merge.take() {
            self.handle_merge_result(&merge);
        }
        if let Some(desc) = res.desc.take() {
            debug!(range = self.replica.range_id, "descriptor updated");
            self.replica.mu.write().state.desc = *desc;
        }
        if let Some(lease) = res.lease.take() {
            debug!(range = self.replica.range_id, lease = %lease, "lease updated");
            self.replica.mu.write().state.lease = *lease;
        }
        if let Some(threshold) = res.gc_threshold.take() {
            self.replica.mu.write().state.gc_threshold = threshold;
        }
        if res.using_applied_state_key {
            self.replica.mu.write().state.using_applied_state_key = true;
            res.using_applied_state_key = false;
        }
        if let Some(change) = res.change_replicas.take() {
            self.handle_change_replicas_result(&change);
        }
        if let Some(checksum) = res.compute_checksum.take() {
            self.handle_compute_checksum_result(&checksum)?;
        }

        if !res.is_empty() {
            return Err(NonDeterministicFailure::new(format!(
                "unhandled field in replicated result: {res:?}"
            )));
        }
        Ok((true, produced_log_delta))
    }

    fn handle_truncated_state_result(&self, truncated: &TruncatedState) -> anyhow::Result<i64> {
        self.replica.mu.write().state.truncated_state = *truncated;
        let freed = self.replica.sideload.truncate_to(truncated.index)?;
        Ok(-freed)
    }

    fn handle_split_result(&self, split: &SplitTrigger) -> Result<(), NonDeterministicFailure> {
        let rhs_id = split.right_desc.range_id;
        self.store.materialize_replica(rhs_id).map_err(|err| {
            NonDeterministicFailure::wrap(err, "unable to initialize split right-hand range")
        })?;
        info!(
            range = self.replica.range_id,
            rhs = rhs_id,
            "range split applied"
        );
        Ok(())
    }

    fn handle_merge_result(&self, merge: &MergeTrigger) {
        let rhs_id = merge.right_desc.range_id;
        if let Some(rhs) = self.store.get_replica(rhs_id) {
            rhs.mark_destroyed();
        }
        self.store.remove_replica(rhs_id);
        info!(
            range = self.replica.range_id,
            rhs = rhs_id,
            "range merge applied"
        );
    }

    fn handle_change_replicas_result(&self, change: &ChangeReplicas) {
        let store_id = self.store.store_id();
        if change
            .updated_replicas
            .iter()
            .all(|r| r.store_id != store_id)
        {
            info!(
                range = self.replica.range_id,
                "replica removed from range by configuration change"
            );
            self.replica.mark_destroyed();
        }
    }

    fn handle_compute_checksum_result(
        &self,
        compute: &ComputeChecksum,
    ) -> Result<(), NonDeterministicFailure> {
        let checksum = self
            .store
            .engine()
            .checksum_range_data(self.replica.range_id)
            .map_err(|err| NonDeterministicFailure::wrap(err, "unable to checksum range data"))?;
        self.replica.record_checksum(compute.checksum_id, checksum);
        Ok(())
    }

    /// Compare the on-disk replica state against the in-memory one. Any
    /// divergence after non-trivial effects is corruption.
    fn assert_state(&self) -> Result<(), NonDeterministicFailure> {
        let on_disk = self
            .store
            .engine()
            .load_replica_state(self.replica.range_id)
            .map_err(|err| {
                NonDeterministicFailure::wrap(err, "unable to load on-disk replica state")
            })?;
        let in_memory = self.replica.state();
        if on_disk != in_memory {
            return Err(NonDeterministicFailure::new(format!(
                "on-disk and in-memory state diverged:\n disk: {on_disk:?}\n mem:  {in_memory:?}"
            )));
        }
        Ok(())
    }

    fn maybe_apply_conf_change(
        &self,
        cmd: &ReplicatedCmd,
        change: Option<ChangeReplicas>,
    ) -> Result<(), NonDeterministicFailure> {
        match cmd.entry_kind {
            EntryKind::Normal => {
                if change.is_some() && !cmd.rejected() {
                    return Err(NonDeterministicFailure::new(
                        "replication change carried by a normal entry",
                    ));
                }
                Ok(())
            }
            EntryKind::ConfChange => {
                // A rejected conf-change entry still reports a zero change so
                // the consensus group observes every conf-change entry.
                let cc = match (cmd.rejected(), change) {
                    (false, Some(change)) => ConfChange {
                        change: Some((change.kind, change.replica)),
                    },
                    _ => ConfChange::default(),
                };
                let Some(group) = self.replica.raft_group() else {
                    return Err(NonDeterministicFailure::new(
                        "conf-change entry with no consensus group registered",
                    ));
                };
                group.apply_conf_change(cc).map_err(|err| {
                    NonDeterministicFailure::wrap(err, "unable to apply conf change")
                })
            }
        }
    }

    /// Enforce the local-command invariants and deliver the reply.
    fn finish_local(
        &self,
        cmd: &ReplicatedCmd,
        local_reply: Option<ProposalReply>,
    ) -> Result<(), NonDeterministicFailure> {
        let Some(proposal) = &cmd.proposal else {
            return Ok(());
        };
        if !cmd.rejected() {
            if cmd.cmd.max_lease_index != proposal.max_lease_index {
                return Err(NonDeterministicFailure::new(
                    "finishing proposal with outstanding reproposal at a higher max lease index",
                ));
            }
            let mut applied = proposal.applied.lock();
            if *applied {
                // A proposal applies successfully at most once; reproposals
                // must be caught by the lease sequence or lease index checks.
                return Err(NonDeterministicFailure::new(
                    "command already applied; unexpected second successful result",
                ));
            }
            *applied = true;
        } else {
            *proposal.applied.lock() = true;
        }
        self.replica.forget_proposal(proposal.id);
        if let Some(reply) = local_reply {
            proposal.deliver(reply);
        }
        Ok(())
    }
}
