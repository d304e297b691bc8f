//! Seeding a new cluster from an existing store.

mod common;

use causal_cluster::state::machine::{IdAllocationState, LockTokenState, RaftMembershipState};
use causal_cluster::{ClusterError, MemberSet, MemoryDatabase, StateType};
use causal_core::{IdType, MemberId, StoreId};
use common::TestReplica;

/// A store with 100 nodes seeds a three-member cluster at index 0.
#[test]
fn test_bootstrap_three_members() {
    let members = MemberSet::new([MemberId::new(), MemberId::new(), MemberId::new()]);
    let db = MemoryDatabase::new(StoreId::generate())
        .with_high_id(IdType::Node, 100)
        .with_high_id(IdType::Property, 101);
    let node = TestReplica::with_config(db, |b| b.id_allocation_batch_size(20));

    let snapshot = node.replica.bootstrap(&members).expect("bootstrap");
    assert_eq!(snapshot.prev_index(), 0);
    assert_eq!(snapshot.prev_term(), 0);

    let ids: IdAllocationState = snapshot
        .get_state(StateType::IdAllocation)
        .expect("id allocation state");
    let first_node = ids.first_unallocated(IdType::Node);
    assert!((100..=120).contains(&first_node), "first node id {first_node}");
    assert_eq!(ids.first_unallocated(IdType::Property), 120);
    assert_eq!(ids.first_unallocated(IdType::Schema), 0);

    let membership: RaftMembershipState = snapshot
        .get_state(StateType::RaftMembership)
        .expect("membership state");
    assert_eq!(membership.committed.members.len(), 3);
    assert_eq!(membership.committed, members);

    let token: LockTokenState = snapshot
        .get_state(StateType::LockToken)
        .expect("lock token state");
    assert_eq!(token.owner, None);
    assert_eq!(token.token_id, 0);

    // The replica now holds exactly the seeded state.
    assert_eq!(node.replica.last_applied_index(), 0);
    let rebuilt = node.replica.build_snapshot().expect("snapshot");
    let rebuilt_ids: IdAllocationState = rebuilt
        .get_state(StateType::IdAllocation)
        .expect("id allocation state");
    assert_eq!(rebuilt_ids.first_unallocated, ids.first_unallocated);
}

/// Ids handed out after bootstrap continue from the seeded high-water mark.
#[test]
fn test_allocation_continues_after_bootstrap() {
    let owner = MemberId::new();
    let db = MemoryDatabase::new(StoreId::generate()).with_high_id(IdType::Node, 100);
    let node = TestReplica::with_config(db, |b| b.id_allocation_batch_size(20));
    node.replica
        .bootstrap(&MemberSet::new([owner]))
        .expect("bootstrap");

    let stale = causal_cluster::command::IdAllocationRequest {
        owner,
        id_type: IdType::Node,
        range_start: 0,
        range_length: 20,
    };
    let fresh = causal_cluster::command::IdAllocationRequest {
        range_start: 100,
        ..stale.clone()
    };
    common::append_and_commit(
        &node.replica,
        1,
        vec![
            causal_cluster::ReplicatedContent::IdAllocation(stale),
            causal_cluster::ReplicatedContent::IdAllocation(fresh),
        ],
    );

    let ids: IdAllocationState = node
        .replica
        .build_snapshot()
        .expect("snapshot")
        .get_state(StateType::IdAllocation)
        .expect("id allocation state");
    assert_eq!(ids.first_unallocated(IdType::Node), 120);
}

/// A store that was not shut down cleanly cannot seed a cluster.
#[test]
fn test_bootstrap_refuses_unrecovered_store() {
    let db = MemoryDatabase::new(StoreId::generate()).needing_recovery();
    let node = TestReplica::new(db);

    let err = node
        .replica
        .bootstrap(&MemberSet::new([MemberId::new()]))
        .expect_err("bootstrap should fail");
    match err {
        ClusterError::Bootstrap(message) => {
            assert!(message.starts_with("Cannot bootstrap. Recovery is required."));
        }
        other => panic!("expected bootstrap error, got {other:?}"),
    }
    assert!(node.db.transactions().is_empty());
}
