//! Below-consensus accept/reject decision for committed commands.
//!
//! The decision must be deterministic on all replicas: a command rejected
//! beneath consensus on one replica is rejected on all of them. Three checks
//! combine, in order: the command was proposed under the current lease, it
//! has not been re-ordered past its maximum lease index, and its timestamp
//! clears the range's garbage-collection threshold.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::cmd::{CommandId, RaftCommand};
use crate::error::Rejection;
use crate::state::{Lease, ReplicaState};

/// Disposition for a locally proposed command that was rejected.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProposalRetry {
    /// Deliver the rejection to the waiter as-is.
    #[default]
    NoReevaluation,
    /// The command missed its lease-index window; the proposer should retry
    /// at a new lease index.
    IllegalLeaseIndex,
}

/// Decide whether a committed command applies to the state machine.
///
/// Returns the lease applied index the state machine will hold after this
/// command, the retry disposition, and the rejection (if any). Identical
/// inputs produce identical outputs on every replica; no state is consulted
/// beyond `state`.
pub fn check_forced_err(
    id: CommandId,
    cmd: &RaftCommand,
    is_local: bool,
    state: &ReplicaState,
) -> (u64, ProposalRetry, Option<Rejection>) {
    let mut lease_index = state.lease_applied_index;
    let is_lease_request = cmd.replicated.is_lease_request;
    let requested_lease: Lease = cmd
        .replicated
        .lease
        .as_deref()
        .cloned()
        .unwrap_or_default();

    if id.is_empty() {
        // Log-internal entry (appended after elections or during concurrent
        // configuration changes). It must not affect state; the corresponding
        // write batch is bogus and key bounds are undefined.
        return (
            lease_index,
            ProposalRetry::NoReevaluation,
            Some(Rejection::EmptyEntry),
        );
    }

    // Verify the lease matches the proposer's expectation. The proposer
    // decided whether the existing lease was held and usable; here we only
    // check that the lease has not changed between proposal and application.
    let mut lease_mismatch = if let Some(legacy) = &cmd.legacy_proposer_lease {
        !legacy.equivalent(&state.lease)
    } else {
        cmd.proposer_lease_sequence != state.lease.sequence
    };
    if !lease_mismatch && cmd.legacy_proposer_lease.is_none() && is_lease_request {
        // Sequence numbers reflect lease equivalence between subsequent
        // leases, but equivalence is not fully symmetric: two leases may each
        // be equivalent to a third without being equivalent to each other.
        // When the requested sequence equals the current one, require the
        // requested lease itself to be equivalent, or concurrent
        // expiration-based extensions could invert expiration timestamps.
        if state.lease.sequence == requested_lease.sequence {
            lease_mismatch = !state.lease.equivalent(&requested_lease);
        }
        // Extensions do not increment the sequence, so also pin the proposal
        // timestamp of the lease this request was proposed against. Without
        // it, a request proposed against the original lease could apply over
        // a later extension.
        if let Some(prev_proposal) = cmd.replicated.prev_lease_proposal {
            if prev_proposal != state.lease.proposed_ts {
                lease_mismatch = true;
            }
        }
    }
    if lease_mismatch {
        debug!(
            command = %id,
            proposer_sequence = cmd.proposer_lease_sequence,
            lease = %state.lease,
            "command proposed under incompatible lease"
        );
        let rejection = if is_lease_request {
            Rejection::LeaseRejected {
                existing: state.lease.clone(),
                requested: requested_lease,
                message: "proposed under invalid lease",
            }
        } else {
            Rejection::NotLeaseholder {
                lease: state.lease.clone(),
                proposer_store: cmd.proposer_replica.store_id,
                proposer_lease_sequence: cmd.proposer_lease_sequence,
            }
        };
        return (lease_index, ProposalRetry::NoReevaluation, Some(rejection));
    }

    if is_lease_request {
        // Lease requests bypass the lease-index counter: they are proposed by
        // anyone, so a coherent max index cannot be expected, and they are
        // often replayed. They do get vetted against the descriptor so a
        // lease is never granted to a replica that was since removed.
        if state
            .desc
            .replica_on_store(requested_lease.holder.store_id)
            .is_none()
        {
            return (
                lease_index,
                ProposalRetry::NoReevaluation,
                Some(Rejection::LeaseRejected {
                    existing: state.lease.clone(),
                    requested: requested_lease,
                    message: "replica not part of range",
                }),
            );
        }
    } else if state.lease_applied_index < cmd.max_lease_index {
        // The command applies at or ahead of the minimal permissible index.
        // Skipped slots are fine; commands proposed at the skipped indices
        // will be rejected by this same rule when they arrive.
        lease_index = cmd.max_lease_index;
    } else {
        // The command is trying to apply at a past log position. The
        // proposer's client will retry; the lease index does not advance.
        let mut retry = ProposalRetry::NoReevaluation;
        if is_local {
            debug!(
                command = %id,
                lease_applied_index = lease_index,
                max_lease_index = cmd.max_lease_index,
                "retrying local proposal at a new lease index"
            );
            retry = ProposalRetry::IllegalLeaseIndex;
        }
        return (
            lease_index,
            retry,
            Some(Rejection::IllegalLeaseIndex {
                lease_applied_index: lease_index,
                max_lease_index: cmd.max_lease_index,
            }),
        );
    }

    // Not every command declares read access on the GC threshold even though
    // all implicitly depend on it, so the check cannot be left to latching
    // above consensus; it must run here as well.
    let ts = cmd.replicated.timestamp;
    if state.gc_threshold >= ts {
        return (
            lease_index,
            ProposalRetry::NoReevaluation,
            Some(Rejection::TimestampBelowGc {
                timestamp: ts,
                threshold: state.gc_threshold,
            }),
        );
    }

    (lease_index, ProposalRetry::NoReevaluation, None)
}
