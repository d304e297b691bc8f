//! Committed raft membership.

use serde::{Deserialize, Serialize};
use std::path::Path;

use super::{AppliedState, ApplyResult, PersistentState, StateMachine, StateType};
use crate::command::{MemberSet, ReplicatedContent};
use crate::error::ClusterResult;
use crate::state::storage::{DurableStateStorage, StateStorage};

/// Last committed member set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RaftMembershipState {
    /// Members of the cluster.
    pub committed: MemberSet,
    /// Index the member set was committed at.
    pub committed_index: u64,
    /// Highest applied log index.
    pub last_applied: u64,
}

impl AppliedState for RaftMembershipState {
    fn last_applied(&self) -> u64 {
        self.last_applied
    }

    fn set_last_applied(&mut self, index: u64) {
        self.last_applied = index;
    }
}

/// State machine tracking raft membership.
pub struct RaftMembershipStateMachine {
    inner: PersistentState<RaftMembershipState>,
}

impl RaftMembershipStateMachine {
    /// Create over the given storage.
    pub fn new(storage: Box<dyn StateStorage<RaftMembershipState>>) -> Self {
        Self {
            inner: PersistentState::new(StateType::RaftMembership, storage),
        }
    }

    /// Create over `dir/raft-membership.state`.
    pub fn open(dir: &Path) -> ClusterResult<Self> {
        let storage =
            DurableStateStorage::open(dir, "raft-membership", RaftMembershipState::default())?;
        Ok(Self::new(Box::new(storage)))
    }

    /// Current membership.
    pub fn state(&self) -> &RaftMembershipState {
        self.inner.get()
    }
}

impl StateMachine for RaftMembershipStateMachine {
    fn state_type(&self) -> StateType {
        StateType::RaftMembership
    }

    fn apply(&mut self, index: u64, command: &ReplicatedContent) -> ClusterResult<ApplyResult> {
        let ReplicatedContent::MemberSet(members) = command else {
            return Ok(ApplyResult::Ignored);
        };
        if self.inner.already_applied(index) {
            return Ok(ApplyResult::AlreadyApplied);
        }

        self.inner.update(index, |state| {
            state.committed = members.clone();
            state.committed_index = index;
        });
        tracing::info!(index, members = members.members.len(), "Committed new member set");
        Ok(ApplyResult::Accepted)
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
