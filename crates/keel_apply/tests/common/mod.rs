//! Shared helpers for the apply-pipeline integration tests.

#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::Arc;

use keel_apply::cmd::{
    CommandId, Entry, EntryKind, MergeTrigger, RaftCommand, SplitTrigger,
};
use keel_apply::engine::{
    encode_desc_value, encode_gc_threshold_value, encode_lease_value, WriteBatchBuilder,
    STATE_KEY_DESC, STATE_KEY_GC_THRESHOLD, STATE_KEY_LEASE,
};
use keel_apply::replica::{Replica, Store};
use keel_apply::state::{
    Lease, MvccStats, MvccStatsDelta, RangeDescriptor, ReplicaDescriptor, ReplicaState,
    Timestamp,
};
use keel_apply::{ApplyConfig, ApplyLoopStats, NonDeterministicFailure, ReplicaStateMachine};

pub const RANGE_ID: u64 = 1;

/// Route pipeline tracing through the test harness; `RUST_LOG` filters it.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

pub fn test_dir(name: &str) -> PathBuf {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    std::env::temp_dir().join(format!("keel_apply_{name}_{}_{}", std::process::id(), nanos))
}

pub fn cleanup_dir(dir: &PathBuf) {
    let _ = std::fs::remove_dir_all(dir);
}

pub fn replica_desc(store_id: u64) -> ReplicaDescriptor {
    ReplicaDescriptor {
        node_id: store_id,
        store_id,
        replica_id: store_id,
    }
}

pub fn base_desc() -> RangeDescriptor {
    RangeDescriptor {
        range_id: RANGE_ID,
        start_key: Vec::new(),
        end_key: Vec::new(),
        replicas: vec![replica_desc(1), replica_desc(2), replica_desc(3)],
        next_replica_id: 4,
    }
}

pub fn base_lease() -> Lease {
    Lease {
        sequence: 5,
        holder: replica_desc(1),
        epoch: 0,
        expiration: Timestamp(1_000),
        proposed_ts: Timestamp(40),
    }
}

/// The canonical pre-state used across these tests: applied index 10, lease
/// applied index 100, lease sequence 5, GC threshold t50, legacy layout.
pub fn base_state() -> ReplicaState {
    ReplicaState {
        raft_applied_index: 10,
        lease_applied_index: 100,
        lease: base_lease(),
        desc: base_desc(),
        gc_threshold: Timestamp(50),
        ..Default::default()
    }
}

pub fn open_store(dir: &PathBuf) -> Arc<Store> {
    Store::open(1, dir, ApplyConfig::default()).expect("open store")
}

pub fn bootstrap(store: &Arc<Store>) -> Arc<Replica> {
    store.bootstrap_replica(base_state()).expect("bootstrap replica")
}

pub fn bootstrap_with(
    store: &Arc<Store>,
    tweak: impl FnOnce(&mut ReplicaState),
) -> Arc<Replica> {
    let mut state = base_state();
    tweak(&mut state);
    store.bootstrap_replica(state).expect("bootstrap replica")
}

pub fn entry(index: u64, term: u64, cmd: &RaftCommand) -> Entry {
    Entry::encode(index, term, EntryKind::Normal, cmd).expect("encode entry")
}

pub fn conf_change_entry(index: u64, term: u64, cmd: &RaftCommand) -> Entry {
    Entry::encode(index, term, EntryKind::ConfChange, cmd).expect("encode entry")
}

pub fn apply(
    store: &Arc<Store>,
    replica: &Arc<Replica>,
    entries: &[Entry],
) -> Result<ApplyLoopStats, NonDeterministicFailure> {
    let mut sm = ReplicaStateMachine::new(store, replica);
    sm.apply_committed_entries(entries)?;
    Ok(sm.move_stats())
}

fn cmd_skeleton(id: u64, max_lease_index: u64, ts: u64) -> RaftCommand {
    let mut cmd = RaftCommand {
        id: CommandId(id),
        max_lease_index,
        proposer_lease_sequence: 5,
        proposer_replica: replica_desc(1),
        ..Default::default()
    };
    cmd.replicated.timestamp = Timestamp(ts);
    cmd
}

/// An ordinary single-key write with an explicit stats delta.
pub fn put_cmd(
    id: u64,
    max_lease_index: u64,
    ts: u64,
    key: &[u8],
    value: &[u8],
    delta: MvccStatsDelta,
) -> RaftCommand {
    let mut cmd = cmd_skeleton(id, max_lease_index, ts);
    cmd.replicated.stats_delta = delta;
    let mut wb = WriteBatchBuilder::new();
    wb.put_data(key, value);
    cmd.write_batch = Some(wb.finish());
    cmd
}

pub fn live_bytes(n: i64) -> MvccStatsDelta {
    MvccStatsDelta {
        live_bytes: n,
        ..Default::default()
    }
}

/// A command raising the GC threshold (non-trivial: triggers the state
/// assertion).
pub fn gc_threshold_cmd(id: u64, max_lease_index: u64, ts: u64, threshold: u64) -> RaftCommand {
    let mut cmd = cmd_skeleton(id, max_lease_index, ts);
    cmd.replicated.gc_threshold = Some(Timestamp(threshold));
    let mut wb = WriteBatchBuilder::new();
    wb.put_state(
        STATE_KEY_GC_THRESHOLD,
        &encode_gc_threshold_value(Timestamp(threshold)),
    );
    cmd.write_batch = Some(wb.finish());
    cmd
}

/// A lease request replacing the current lease with `new_lease`.
pub fn lease_request_cmd(id: u64, ts: u64, new_lease: &Lease) -> RaftCommand {
    let mut cmd = cmd_skeleton(id, 0, ts);
    cmd.replicated.is_lease_request = true;
    cmd.replicated.lease = Some(Box::new(new_lease.clone()));
    let mut wb = WriteBatchBuilder::new();
    wb.put_state(
        STATE_KEY_LEASE,
        &encode_lease_value(new_lease).expect("encode lease"),
    );
    cmd.write_batch = Some(wb.finish());
    cmd
}

/// A split of the range at `split_key`, with the right-hand side becoming
/// range `rhs_id`.
pub fn split_cmd(
    id: u64,
    max_lease_index: u64,
    ts: u64,
    split_key: &[u8],
    rhs_id: u64,
) -> RaftCommand {
    let mut left_desc = base_desc();
    left_desc.end_key = split_key.to_vec();
    let right_desc = RangeDescriptor {
        range_id: rhs_id,
        start_key: split_key.to_vec(),
        end_key: Vec::new(),
        replicas: base_desc().replicas,
        next_replica_id: 4,
    };

    let mut cmd = cmd_skeleton(id, max_lease_index, ts);
    cmd.replicated.split = Some(Box::new(SplitTrigger {
        left_desc: left_desc.clone(),
        right_desc,
        right_stats: MvccStats::default(),
    }));
    cmd.replicated.desc = Some(Box::new(left_desc.clone()));
    let mut wb = WriteBatchBuilder::new();
    wb.put_state(
        STATE_KEY_DESC,
        &encode_desc_value(&left_desc).expect("encode desc"),
    );
    cmd.write_batch = Some(wb.finish());
    cmd
}

/// A merge absorbing `rhs_desc` back into this range, restoring `new_desc`.
pub fn merge_cmd(
    id: u64,
    max_lease_index: u64,
    ts: u64,
    new_desc: &RangeDescriptor,
    rhs_desc: &RangeDescriptor,
) -> RaftCommand {
    let mut cmd = cmd_skeleton(id, max_lease_index, ts);
    cmd.replicated.merge = Some(Box::new(MergeTrigger {
        left_desc: new_desc.clone(),
        right_desc: rhs_desc.clone(),
    }));
    cmd.replicated.desc = Some(Box::new(new_desc.clone()));
    let mut wb = WriteBatchBuilder::new();
    wb.put_state(
        STATE_KEY_DESC,
        &encode_desc_value(new_desc).expect("encode desc"),
    );
    cmd.write_batch = Some(wb.finish());
    cmd
}
