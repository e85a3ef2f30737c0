//! Committed-entry application pipeline for KeelStore replicated ranges.
//!
//! After consensus has ordered and committed a batch of log entries for a
//! range, this crate applies them deterministically to the replica's durable
//! storage and in-memory state. Application runs in three phases: decode the
//! entries, stage each command into an atomic application batch (accepting or
//! rejecting it beneath consensus), then commit the batch and dispatch each
//! command's non-trivial side effects in log order.
//!
//! Determinism is the contract: identical inputs must produce identical
//! state on every replica, and any failure that could differ between
//! replicas marks the replica corrupt instead of being retried.

pub mod batch;
pub mod clock;
pub mod cmd;
pub mod config;
pub mod decision;
pub mod driver;
pub mod engine;
pub mod error;
pub mod metrics;
pub mod replica;
mod side_effects;
pub mod state;

pub use batch::{ApplicationBatch, Batch, EphemeralBatch};
pub use clock::NodeClock;
pub use cmd::{Entry, EntryKind, RaftCommand, ReplicatedCmd, ReplicatedEvalResult};
pub use config::ApplyConfig;
pub use decision::{check_forced_err, ProposalRetry};
pub use driver::{ApplyLoopStats, ReplicaStateMachine};
pub use error::{NonDeterministicFailure, RejectedProposal, Rejection};
pub use metrics::{ApplyMetrics, ApplyMetricsSnapshot};
pub use replica::{LocalResult, ProposalReply, RaftGroup, Replica, Store};
pub use state::{Lease, MvccStats, MvccStatsDelta, RangeDescriptor, ReplicaState, Timestamp};
