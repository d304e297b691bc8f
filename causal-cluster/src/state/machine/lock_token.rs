//! Cluster-wide lock token.
//!
//! Exactly one member holds the token at a time. A member takes it by
//! proposing the id following the current token's id; competing proposals
//! for the same id resolve in log order and the loser is rejected.

use causal_core::MemberId;
use serde::{Deserialize, Serialize};
use std::path::Path;

use super::{AppliedState, ApplyResult, PersistentState, StateMachine, StateType};
use crate::command::{LockTokenRequest, ReplicatedContent};
use crate::error::ClusterResult;
use crate::state::storage::{DurableStateStorage, StateStorage};

/// The current lock token.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockTokenState {
    /// Holder, `None` while the token has never been taken.
    pub owner: Option<MemberId>,
    /// Token id; 0 before the first acquisition.
    pub token_id: u64,
    /// Highest applied log index.
    pub last_applied: u64,
}

impl LockTokenState {
    /// The id the next successful request must carry.
    pub fn next_candidate_id(&self) -> u64 {
        self.token_id + 1
    }
}

impl AppliedState for LockTokenState {
    fn last_applied(&self) -> u64 {
        self.last_applied
    }

    fn set_last_applied(&mut self, index: u64) {
        self.last_applied = index;
    }
}

/// State machine for the lock token.
pub struct LockTokenStateMachine {
    inner: PersistentState<LockTokenState>,
}

impl LockTokenStateMachine {
    /// Create over the given storage.
    pub fn new(storage: Box<dyn StateStorage<LockTokenState>>) -> Self {
        Self {
            inner: PersistentState::new(StateType::LockToken, storage),
        }
    }

    /// Create over `dir/lock-token.state`.
    pub fn open(dir: &Path) -> ClusterResult<Self> {
        let storage = DurableStateStorage::open(dir, "lock-token", LockTokenState::default())?;
        Ok(Self::new(Box::new(storage)))
    }

    /// Current token.
    pub fn state(&self) -> &LockTokenState {
        self.inner.get()
    }

    /// Build a request to take the token from its current holder.
    pub fn acquire_request(&self, owner: MemberId) -> LockTokenRequest {
        LockTokenRequest {
            owner,
            candidate_id: self.state().next_candidate_id(),
        }
    }
}

impl StateMachine for LockTokenStateMachine {
    fn state_type(&self) -> StateType {
        StateType::LockToken
    }

    fn apply(&mut self, index: u64, command: &ReplicatedContent) -> ClusterResult<ApplyResult> {
        let ReplicatedContent::LockToken(request) = command else {
            return Ok(ApplyResult::Ignored);
        };
        if self.inner.already_applied(index) {
            return Ok(ApplyResult::AlreadyApplied);
        }

        let result = self.inner.update(index, |state| {
            if request.candidate_id == state.next_candidate_id() {
                state.owner = Some(request.owner);
                state.token_id = request.candidate_id;
                ApplyResult::Accepted
            } else {
                ApplyResult::Rejected
            }
        });

        tracing::debug!(index, owner = %request.owner, candidate_id = request.candidate_id, ?result, "Applied lock token request");
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
