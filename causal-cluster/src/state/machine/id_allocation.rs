//! Id range allocation.
//!
//! Members request contiguous ranges of an id space. A request is granted
//! only if it starts exactly at the first unallocated id, so two members
//! racing for the same range cannot both win.

use causal_core::{IdType, MemberId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

use super::{AppliedState, ApplyResult, PersistentState, StateMachine, StateType};
use crate::command::{IdAllocationRequest, ReplicatedContent};
use crate::error::ClusterResult;
use crate::state::storage::{DurableStateStorage, StateStorage};

/// First unallocated id per id space.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdAllocationState {
    /// Missing entries mean nothing has been allocated yet.
    pub first_unallocated: BTreeMap<IdType, u64>,
    /// Highest applied log index.
    pub last_applied: u64,
}

impl IdAllocationState {
    /// First id not yet handed out for `id_type`.
    pub fn first_unallocated(&self, id_type: IdType) -> u64 {
        self.first_unallocated.get(&id_type).copied().unwrap_or(0)
    }

    /// Set the first unallocated id for `id_type`.
    pub fn set_first_unallocated(&mut self, id_type: IdType, id: u64) {
        self.first_unallocated.insert(id_type, id);
    }
}

impl AppliedState for IdAllocationState {
    fn last_applied(&self) -> u64 {
        self.last_applied
    }

    fn set_last_applied(&mut self, index: u64) {
        self.last_applied = index;
    }
}

/// State machine for id range allocation.
pub struct IdAllocationStateMachine {
    inner: PersistentState<IdAllocationState>,
}

impl IdAllocationStateMachine {
    /// Create over the given storage.
    pub fn new(storage: Box<dyn StateStorage<IdAllocationState>>) -> Self {
        Self {
            inner: PersistentState::new(StateType::IdAllocation, storage),
        }
    }

    /// Create over `dir/id-allocation.state`.
    pub fn open(dir: &Path) -> ClusterResult<Self> {
        let storage = DurableStateStorage::open(dir, "id-allocation", IdAllocationState::default())?;
        Ok(Self::new(Box::new(storage)))
    }

    /// Current state.
    pub fn state(&self) -> &IdAllocationState {
        self.inner.get()
    }

    /// Build a request for the next `length` ids as currently known locally.
    pub fn range_request(&self, owner: MemberId, id_type: IdType, length: u64) -> IdAllocationRequest {
        IdAllocationRequest {
            owner,
            id_type,
            range_start: self.state().first_unallocated(id_type),
            range_length: length,
        }
    }
}

impl StateMachine for IdAllocationStateMachine {
    fn state_type(&self) -> StateType {
        StateType::IdAllocation
    }

    fn apply(&mut self, index: u64, command: &ReplicatedContent) -> ClusterResult<ApplyResult> {
        let ReplicatedContent::IdAllocation(request) = command else {
            return Ok(ApplyResult::Ignored);
        };
        if self.inner.already_applied(index) {
            return Ok(ApplyResult::AlreadyApplied);
        }

        let result = self.inner.update(index, |state| {
            let first = state.first_unallocated(request.id_type);
            if request.range_start == first {
                state.set_first_unallocated(request.id_type, first + request.range_length);
                ApplyResult::Accepted
            } else {
                ApplyResult::Rejected
            }
        });

        tracing::debug!(
            index,
            id_type = %request.id_type,
            range_start = request.range_start,
            range_length = request.range_length,
            ?result,
            "Applied id allocation"
        );
        Ok(result)
    }

    fn last_applied_index(&self) -> u64 {
        self.inner.get().last_applied
    }

    fn flush(&mut self, applied_through: u64) -> ClusterResult<()> {
        self.inner.flush(applied_through)
    }

    fn snapshot(&self, applied_through: u64) -> ClusterResult<Option<Vec<u8>>> {
        self.inner.snapshot(applied_through).map(Some)
    }

    fn check_snapshot(&self, data: Option<&[u8]>) -> ClusterResult<()> {
        self.inner.decode(data).map(drop)
    }

    fn install_snapshot(&mut self, index: u64, data: Option<&[u8]>) -> ClusterResult<()> {
        self.inner.install(index, data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::storage::InMemoryStateStorage;

    fn machine() -> IdAllocationStateMachine {
        IdAllocationStateMachine::new(Box::new(InMemoryStateStorage::new(
            IdAllocationState::default(),
        )))
    }

    fn request(id_type: IdType, start: u64, len: u64) -> ReplicatedContent {
        ReplicatedContent::IdAllocation(IdAllocationRequest {
            owner: MemberId::new(),
            id_type,
            range_start: start,
            range_length: len,
        })
    }

    #[test]
    fn contiguous_requests_are_granted() {
        let mut sm = machine();
        assert_eq!(sm.apply(1, &request(IdType::Node, 0, 10)).unwrap(), ApplyResult::Accepted);
        assert_eq!(sm.apply(2, &request(IdType::Node, 10, 5)).unwrap(), ApplyResult::Accepted);
        assert_eq!(sm.state().first_unallocated(IdType::Node), 15);
        assert_eq!(sm.state().first_unallocated(IdType::Property), 0);
    }

    #[test]
    fn stale_request_is_rejected_but_advances_index() {
        let mut sm = machine();
        sm.apply(1, &request(IdType::Node, 0, 10)).unwrap();
        assert_eq!(sm.apply(2, &request(IdType::Node, 0, 10)).unwrap(), ApplyResult::Rejected);
        assert_eq!(sm.state().first_unallocated(IdType::Node), 10);
        assert_eq!(sm.last_applied_index(), 2);
    }

    #[test]
    fn replayed_index_is_skipped() {
        let mut sm = machine();
        sm.apply(5, &request(IdType::Schema, 0, 3)).unwrap();
        assert_eq!(
            sm.apply(5, &request(IdType::Schema, 3, 3)).unwrap(),
            ApplyResult::AlreadyApplied
        );
        assert_eq!(sm.state().first_unallocated(IdType::Schema), 3);
    }

    #[test]
    fn range_request_starts_at_first_unallocated() {
        let mut sm = machine();
        sm.apply(1, &request(IdType::Relationship, 0, 64)).unwrap();
        let owner = MemberId::new();
        let next = sm.range_request(owner, IdType::Relationship, 64);
        assert_eq!(next.range_start, 64);
        assert_eq!(
            sm.apply(2, &ReplicatedContent::IdAllocation(next)).unwrap(),
            ApplyResult::Accepted
        );
    }

    #[test]
    fn snapshot_install_round_trip() {
        let mut source = machine();
        source.apply(3, &request(IdType::Node, 0, 100)).unwrap();
        let data = source.snapshot(7).unwrap().unwrap();

        let mut target = machine();
        target.install_snapshot(7, Some(&data)).unwrap();
        assert_eq!(target.last_applied_index(), 7);
        assert_eq!(target.state().first_unallocated(IdType::Node), 100);
        assert_eq!(source.last_applied_index(), 3);
    }
}
