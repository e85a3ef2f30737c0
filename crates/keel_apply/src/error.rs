//! Error kinds produced by the apply pipeline.
//!
//! Two disjoint families exist. `Rejection` is the deterministic
//! below-consensus outcome: every replica reaches the same verdict for the
//! same command, the command's effects are wiped and application continues.
//! `NonDeterministicFailure` is everything else: storage errors, invariant
//! violations, unknown effects. Those may differ across replicas, so the only
//! safe reaction is to declare this replica corrupt and stop applying.

use crate::decision::ProposalRetry;
use crate::state::{Lease, StoreId, Timestamp};

/// Deterministic reason a committed command was rejected beneath consensus.
///
/// A rejected command still applies as an empty entry so the applied index
/// advances uniformly; the rejection is only surfaced to a local waiter.
#[derive(Clone, Debug, PartialEq)]
pub enum Rejection {
    /// Log-internal no-op entry (e.g. appended after elections).
    EmptyEntry,
    /// A lease request proposed under a lease that is no longer current.
    LeaseRejected {
        existing: Lease,
        requested: Lease,
        message: &'static str,
    },
    /// A regular command proposed under a stale lease.
    NotLeaseholder {
        lease: Lease,
        proposer_store: StoreId,
        proposer_lease_sequence: u64,
    },
    /// The command was re-ordered past its maximum lease index.
    IllegalLeaseIndex {
        lease_applied_index: u64,
        max_lease_index: u64,
    },
    /// The command's timestamp fell below the garbage-collection threshold.
    TimestampBelowGc {
        timestamp: Timestamp,
        threshold: Timestamp,
    },
}

impl std::fmt::Display for Rejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Rejection::EmptyEntry => write!(f, "no-op on empty log entry"),
            Rejection::LeaseRejected {
                existing, message, ..
            } => {
                write!(f, "lease rejected: {message} (existing {existing})")
            }
            Rejection::NotLeaseholder {
                lease,
                proposer_store,
                proposer_lease_sequence,
            } => write!(
                f,
                "stale proposal from store {proposer_store}: proposed under lease \
                 #{proposer_lease_sequence} but applied under {lease}"
            ),
            Rejection::IllegalLeaseIndex {
                lease_applied_index,
                max_lease_index,
            } => write!(
                f,
                "command observed at lease index {lease_applied_index}, but required \
                 < {max_lease_index}"
            ),
            Rejection::TimestampBelowGc {
                timestamp,
                threshold,
            } => write!(
                f,
                "batch timestamp {timestamp} must be after GC threshold {threshold}"
            ),
        }
    }
}

/// Rejection paired with the retry disposition for a local waiter.
#[derive(Clone, Debug, PartialEq)]
pub struct RejectedProposal {
    pub rejection: Rejection,
    pub retry: ProposalRetry,
}

/// A state-machine transition failed in a way that could differ between
/// replicas. Never recovered from: the replica is marked corrupt.
///
/// The explanation string is safe for reporting (free of user data); the
/// wrapped cause may not be.
#[derive(Debug)]
pub struct NonDeterministicFailure {
    safe_expl: String,
    cause: Option<anyhow::Error>,
}

impl NonDeterministicFailure {
    /// Build a failure from a reporting-safe explanation alone.
    pub fn new(safe_expl: impl Into<String>) -> Self {
        Self {
            safe_expl: safe_expl.into(),
            cause: None,
        }
    }

    /// Wrap an underlying error with a reporting-safe explanation.
    pub fn wrap(cause: anyhow::Error, safe_expl: impl Into<String>) -> Self {
        Self {
            safe_expl: safe_expl.into(),
            cause: Some(cause),
        }
    }

    /// The reporting-safe explanation, without the wrapped cause.
    pub fn safe_explanation(&self) -> &str {
        &self.safe_expl
    }
}

impl std::fmt::Display for NonDeterministicFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.cause {
            Some(cause) => write!(f, "non-deterministic failure: {}: {cause}", self.safe_expl),
            None => write!(f, "non-deterministic failure: {}", self.safe_expl),
        }
    }
}

impl std::error::Error for NonDeterministicFailure {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.cause.as_ref().map(|err| {
            let err: &(dyn std::error::Error + 'static) = err.as_ref();
            err
        })
    }
}
