//! Batching policy, split/merge execution, conf changes, truncation, and
//! sideloaded-SSTable ingestion.

mod common;

use std::sync::{Arc, Mutex};

use common::{
    apply, base_desc, bootstrap, cleanup_dir, conf_change_entry, entry, live_bytes, merge_cmd,
    open_store, put_cmd, replica_desc, split_cmd, test_dir, RANGE_ID,
};
use keel_apply::cmd::{
    ChangeReplicas, ConfChange, ReplicaChangeKind, SstableIngest,
};
use keel_apply::engine::{encode_desc_value, WriteBatchBuilder, STATE_KEY_DESC};
use keel_apply::state::{RangeDescriptor, TruncatedState};
use keel_apply::RaftGroup;

const RHS_ID: u64 = 2;

#[test]
fn non_trivial_command_gets_its_own_batch() {
    common::init_tracing();
    let dir = test_dir("batching_split");
    let store = open_store(&dir);
    let replica = bootstrap(&store);

    // Seed data on both sides of the future split point.
    apply(
        &store,
        &replica,
        &[
            entry(11, 3, &put_cmd(0x11, 101, 60, b"a", b"1", live_bytes(1))),
            entry(12, 3, &put_cmd(0x12, 102, 60, b"z", b"2", live_bytes(1))),
        ],
    )
    .expect("seed");

    // Three commands, the middle one a split: the driver must use three
    // batches (trivial, split alone, trivial) and assert state once.
    let stats = apply(
        &store,
        &replica,
        &[
            entry(13, 3, &put_cmd(0x13, 103, 61, b"b", b"3", live_bytes(1))),
            entry(14, 3, &split_cmd(0x14, 104, 62, b"m", RHS_ID)),
            entry(15, 3, &put_cmd(0x15, 105, 63, b"c", b"4", live_bytes(1))),
        ],
    )
    .expect("apply");
    assert_eq!(stats.batches_processed, 3);
    assert_eq!(stats.entries_processed, 3);
    assert_eq!(stats.state_assertions, 1);

    // The left-hand range now ends at the split key and kept the left keys.
    let state = replica.state();
    assert_eq!(state.raft_applied_index, 15);
    assert_eq!(state.desc.end_key, b"m".to_vec());
    let lhs_data = store.engine().data_partition(RANGE_ID).expect("partition");
    assert!(lhs_data.get(b"a").expect("get").is_some());
    assert!(lhs_data.get(b"b").expect("get").is_some());
    assert!(lhs_data.get(b"c").expect("get").is_some());
    assert!(lhs_data.get(b"z").expect("get").is_none());

    // The right-hand range was materialized with the moved data and a fresh
    // applied index.
    let rhs = store.get_replica(RHS_ID).expect("rhs replica");
    let rhs_state = rhs.state();
    assert_eq!(rhs_state.raft_applied_index, 0);
    assert_eq!(rhs_state.desc.start_key, b"m".to_vec());
    assert_eq!(rhs_state.lease.sequence, 5);
    let rhs_data = store.engine().data_partition(RHS_ID).expect("partition");
    assert!(rhs_data.get(b"z").expect("get").is_some());
    assert!(
        store
            .engine()
            .load_hard_state(RHS_ID)
            .expect("hard state")
            .is_some(),
        "split must seed the right-hand hard state"
    );

    cleanup_dir(&dir);
}

#[test]
fn merge_absorbs_right_hand_range_atomically() {
    let dir = test_dir("merge");
    let store = open_store(&dir);
    let replica = bootstrap(&store);

    apply(
        &store,
        &replica,
        &[
            entry(11, 3, &put_cmd(0x21, 101, 60, b"a", b"1", live_bytes(1))),
            entry(12, 3, &put_cmd(0x22, 102, 60, b"z", b"2", live_bytes(1))),
            entry(13, 3, &split_cmd(0x23, 103, 61, b"m", RHS_ID)),
        ],
    )
    .expect("split");
    let rhs_desc = store.get_replica(RHS_ID).expect("rhs").state().desc;

    let stats = apply(
        &store,
        &replica,
        &[entry(14, 3, &merge_cmd(0x24, 104, 62, &base_desc(), &rhs_desc))],
    )
    .expect("merge");
    assert_eq!(stats.state_assertions, 1);

    // The right-hand replica is gone, its data and span are ours again.
    assert!(store.get_replica(RHS_ID).is_none());
    let state = replica.state();
    assert_eq!(state.desc, base_desc());
    let lhs_data = store.engine().data_partition(RANGE_ID).expect("partition");
    assert!(lhs_data.get(b"z").expect("get").is_some());
    let rhs_data = store.engine().data_partition(RHS_ID).expect("partition");
    assert!(rhs_data.get(b"z").expect("get").is_none());
    // The subsumed range left a tombstone barring stale replica recreation.
    assert_eq!(
        store.engine().load_tombstone(RHS_ID).expect("tombstone"),
        Some(4)
    );

    cleanup_dir(&dir);
}

#[test]
fn applied_index_gap_is_fatal_without_commit() {
    let dir = test_dir("index_gap");
    let store = open_store(&dir);
    let replica = bootstrap(&store);

    let cmd = put_cmd(0x31, 101, 60, b"k", b"v", live_bytes(1));
    let err = apply(&store, &replica, &[entry(12, 3, &cmd)]).expect_err("gap is fatal");
    assert!(err.safe_explanation().contains("applied index jumped"));

    assert_eq!(replica.state().raft_applied_index, 10);
    assert!(replica.corrupt_reason().is_some());
    apply(&store, &replica, &[entry(11, 3, &cmd)]).expect_err("corrupt replica refuses work");

    cleanup_dir(&dir);
}

#[test]
fn zero_entry_index_is_fatal() {
    let dir = test_dir("zero_index");
    let store = open_store(&dir);
    let replica = bootstrap(&store);

    let cmd = put_cmd(0x32, 101, 60, b"k", b"v", live_bytes(1));
    let err = apply(&store, &replica, &[entry(0, 3, &cmd)]).expect_err("zero index is fatal");
    assert!(err.safe_explanation().contains("non-zero entry index"));

    cleanup_dir(&dir);
}

struct RecordingRaftGroup {
    changes: Mutex<Vec<ConfChange>>,
}

impl RaftGroup for RecordingRaftGroup {
    fn apply_conf_change(&self, cc: ConfChange) -> anyhow::Result<()> {
        self.changes.lock().expect("lock poisoned").push(cc);
        Ok(())
    }
}

fn change_replicas_cmd(id: u64, max_lease_index: u64, ts: u64) -> keel_apply::RaftCommand {
    let new_desc = RangeDescriptor {
        replicas: vec![replica_desc(1), replica_desc(2)],
        ..base_desc()
    };
    let mut cmd = common::put_cmd(id, max_lease_index, ts, b"unused", b"", live_bytes(0));
    let mut wb = WriteBatchBuilder::new();
    wb.put_state(
        STATE_KEY_DESC,
        &encode_desc_value(&new_desc).expect("encode desc"),
    );
    cmd.write_batch = Some(wb.finish());
    cmd.replicated.desc = Some(Box::new(new_desc.clone()));
    cmd.replicated.change_replicas = Some(ChangeReplicas {
        kind: ReplicaChangeKind::RemoveVoter,
        replica: replica_desc(3),
        updated_replicas: new_desc.replicas,
    });
    cmd
}

#[test]
fn conf_change_reaches_consensus_group() {
    let dir = test_dir("conf_change");
    let store = open_store(&dir);
    let replica = bootstrap(&store);
    let group = Arc::new(RecordingRaftGroup {
        changes: Mutex::new(Vec::new()),
    });
    replica.set_raft_group(Arc::clone(&group) as Arc<dyn RaftGroup>);

    let cmd = change_replicas_cmd(0x41, 101, 60);
    let stats = apply(&store, &replica, &[conf_change_entry(11, 3, &cmd)]).expect("apply");
    assert_eq!(stats.state_assertions, 1);

    let changes = group.changes.lock().expect("lock poisoned").clone();
    assert_eq!(changes.len(), 1);
    assert_eq!(
        changes[0].change,
        Some((ReplicaChangeKind::RemoveVoter, replica_desc(3)))
    );
    assert_eq!(replica.state().desc.replicas.len(), 2);

    cleanup_dir(&dir);
}

#[test]
fn rejected_conf_change_applies_zero_change() {
    let dir = test_dir("conf_change_rejected");
    let store = open_store(&dir);
    let replica = bootstrap(&store);
    let group = Arc::new(RecordingRaftGroup {
        changes: Mutex::new(Vec::new()),
    });
    replica.set_raft_group(Arc::clone(&group) as Arc<dyn RaftGroup>);

    let mut cmd = change_replicas_cmd(0x42, 101, 60);
    cmd.proposer_lease_sequence = 4;
    apply(&store, &replica, &[conf_change_entry(11, 3, &cmd)]).expect("apply");

    let changes = group.changes.lock().expect("lock poisoned").clone();
    assert_eq!(changes.len(), 1);
    assert_eq!(changes[0], ConfChange::default());
    assert_eq!(replica.state().desc.replicas.len(), 3);

    cleanup_dir(&dir);
}

#[test]
fn replication_change_in_normal_entry_is_fatal() {
    let dir = test_dir("conf_change_normal");
    let store = open_store(&dir);
    let replica = bootstrap(&store);

    let cmd = change_replicas_cmd(0x43, 101, 60);
    let err = apply(&store, &replica, &[entry(11, 3, &cmd)]).expect_err("fatal");
    assert!(err.safe_explanation().contains("normal entry"));

    cleanup_dir(&dir);
}

#[test]
fn truncation_applies_locally_and_stale_truncation_distrusts_log_size() {
    let dir = test_dir("truncation");
    let store = open_store(&dir);
    let replica = bootstrap(&store);
    replica.set_raft_log_size(500);

    let mut cmd = common::put_cmd(0x51, 101, 60, b"unused", b"", live_bytes(0));
    cmd.write_batch = None;
    cmd.replicated.truncated_state = Some(TruncatedState { index: 5, term: 3 });
    cmd.replicated.raft_log_delta = -100;
    let stats = apply(&store, &replica, &[entry(11, 3, &cmd)]).expect("apply");
    // Truncations and log-size deltas are consumed before the assertion
    // decision; on their own they do not force a state comparison.
    assert_eq!(stats.state_assertions, 0);
    assert_eq!(
        replica.state().truncated_state,
        TruncatedState { index: 5, term: 3 }
    );
    assert_eq!(replica.raft_log_size(), (400, true));

    // A truncation behind our current position is stale: dropped locally,
    // and the tracked log size can no longer be trusted.
    let mut stale = common::put_cmd(0x52, 102, 61, b"unused", b"", live_bytes(0));
    stale.write_batch = None;
    stale.replicated.truncated_state = Some(TruncatedState { index: 3, term: 3 });
    stale.replicated.raft_log_delta = -50;
    let stats = apply(&store, &replica, &[entry(12, 3, &stale)]).expect("apply");
    assert_eq!(stats.state_assertions, 0);
    assert_eq!(
        replica.state().truncated_state,
        TruncatedState { index: 5, term: 3 }
    );
    assert_eq!(replica.raft_log_size(), (400, false));

    cleanup_dir(&dir);
}

#[test]
fn sideloaded_sstable_ingests_before_commit() {
    let dir = test_dir("sstable");
    let store = open_store(&dir);
    let replica = bootstrap(&store);

    let payload = vec![
        (b"sst_x".to_vec(), b"1".to_vec()),
        (b"sst_y".to_vec(), b"2".to_vec()),
    ];
    let crc = replica.sideload().put(3, 11, &payload).expect("sideload");

    let mut cmd = common::put_cmd(0x61, 101, 60, b"unused", b"", live_bytes(0));
    cmd.write_batch = None;
    cmd.replicated.sstable = Some(SstableIngest { data_crc: crc });
    let stats = apply(&store, &replica, &[entry(11, 3, &cmd)]).expect("apply");
    // Ingestion is non-trivial but all of its effect runs pre-commit; the
    // residual after staging is empty, so no assertion fires.
    assert_eq!(stats.batches_processed, 1);

    let data = store.engine().data_partition(RANGE_ID).expect("partition");
    assert!(data.get(b"sst_x").expect("get").is_some());
    assert!(data.get(b"sst_y").expect("get").is_some());

    let snapshot = store.metrics().snapshot_and_reset();
    assert_eq!(snapshot.sstable_applications, 1);
    assert_eq!(snapshot.sstable_copies, 0);

    cleanup_dir(&dir);
}
