//! Replicated state machines.
//!
//! Each machine owns one independent slice of replicated state and its own
//! durable storage. Machines only change through [`StateMachine::apply`],
//! which the dispatcher calls once per committed entry in log order.
//!
//! ## Module Structure
//!
//! - `id_allocation`: id range hand-out per [`IdType`](causal_core::IdType)
//! - `lock_token`: the cluster-wide lock token holder
//! - `membership`: last committed raft member set
//! - `transaction`: hands committed transactions to the local store

mod id_allocation;
mod lock_token;
mod membership;
mod transaction;

pub use id_allocation::{IdAllocationState, IdAllocationStateMachine};
pub use lock_token::{LockTokenState, LockTokenStateMachine};
pub use membership::{RaftMembershipState, RaftMembershipStateMachine};
pub use transaction::ReplicatedTransactionStateMachine;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::command::ReplicatedContent;
use crate::error::{ClusterError, ClusterResult};
use crate::state::storage::StateStorage;

/// The fixed set of replicated state kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum StateType {
    /// Id range allocation.
    IdAllocation = 1,
    /// Lock token ownership.
    LockToken = 2,
    /// Raft membership.
    RaftMembership = 3,
    /// Client session de-duplication.
    SessionTracker = 4,
    /// Store transactions.
    ReplicatedTransaction = 5,
}

impl StateType {
    /// Decode a state type tag.
    pub fn from_u8(tag: u8) -> Option<Self> {
        match tag {
            1 => Some(Self::IdAllocation),
            2 => Some(Self::LockToken),
            3 => Some(Self::RaftMembership),
            4 => Some(Self::SessionTracker),
            5 => Some(Self::ReplicatedTransaction),
            _ => None,
        }
    }
}

/// What applying one command did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ApplyResult {
    /// The command targets no state machine.
    Ignored,
    /// The command changed state.
    Accepted,
    /// The command was valid but lost a race, e.g. a stale id range.
    Rejected,
    /// A transaction was committed to the store.
    Committed {
        /// Store transaction id.
        tx_id: u64,
    },
    /// A retried session operation; state was left untouched.
    Duplicate,
    /// The entry was applied before a restart and was skipped.
    AlreadyApplied,
}

/// A deterministic, durable state machine.
pub trait StateMachine: Send {
    /// Which slice of state this machine owns.
    fn state_type(&self) -> StateType;

    /// Apply the command committed at `index`.
    ///
    /// Indices at or below [`StateMachine::last_applied_index`] are skipped
    /// with [`ApplyResult::AlreadyApplied`]. An error is fatal for the replica.
    fn apply(&mut self, index: u64, command: &ReplicatedContent) -> ClusterResult<ApplyResult>;

    /// Highest index reflected in this machine's state.
    fn last_applied_index(&self) -> u64;

    /// Durably checkpoint state as of `applied_through`, which every entry up
    /// to has been dispatched.
    fn flush(&mut self, applied_through: u64) -> ClusterResult<()>;

    /// Serialized state as of `applied_through`, or `None` if this machine's
    /// data travels outside the snapshot.
    fn snapshot(&self, applied_through: u64) -> ClusterResult<Option<Vec<u8>>>;

    /// Verify that `data` could be installed, without changing anything.
    fn check_snapshot(&self, _data: Option<&[u8]>) -> ClusterResult<()> {
        Ok(())
    }

    /// Replace state with a snapshot taken at `index`.
    fn install_snapshot(&mut self, index: u64, data: Option<&[u8]>) -> ClusterResult<()>;
}

/// Serializable state carrying its own applied index.
pub trait AppliedState: Serialize + DeserializeOwned + Clone + Send {
    /// Highest index reflected in the state.
    fn last_applied(&self) -> u64;

    /// Record a new applied index.
    fn set_last_applied(&mut self, index: u64);
}

/// State plus the storage it is checkpointed to.
///
/// Shared plumbing for machines whose whole state is one serde document.
pub struct PersistentState<T: AppliedState> {
    state_type: StateType,
    state: T,
    storage: Box<dyn StateStorage<T>>,
}

impl<T: AppliedState> PersistentState<T> {
    /// Load from `storage`.
    pub fn new(state_type: StateType, storage: Box<dyn StateStorage<T>>) -> Self {
        Self {
            state_type,
            state: storage.initial_state(),
            storage,
        }
    }

    /// Current state.
    pub fn get(&self) -> &T {
        &self.state
    }

    /// Whether `index` has already been applied.
    pub fn already_applied(&self, index: u64) -> bool {
        index <= self.state.last_applied()
    }

    /// Mutate state for the entry at `index`, advancing the applied index.
    pub fn update<R>(&mut self, index: u64, f: impl FnOnce(&mut T) -> R) -> R {
        let result = f(&mut self.state);
        self.state.set_last_applied(index);
        result
    }

    /// Advance to `applied_through` and persist.
    pub fn flush(&mut self, applied_through: u64) -> ClusterResult<()> {
        if applied_through > self.state.last_applied() {
            self.state.set_last_applied(applied_through);
        }
        self.storage.persist(&self.state)
    }

    /// Serialize as of `applied_through` without changing live state.
    pub fn snapshot(&self, applied_through: u64) -> ClusterResult<Vec<u8>> {
        let mut copy = self.state.clone();
        if applied_through > copy.last_applied() {
            copy.set_last_applied(applied_through);
        }
        Ok(serde_json::to_vec(&copy)?)
    }

    /// Decode snapshot data without touching live state.
    pub fn decode(&self, data: Option<&[u8]>) -> ClusterResult<T> {
        let data = data.ok_or(ClusterError::MissingSnapshotState(self.state_type))?;
        Ok(serde_json::from_slice(data)?)
    }

    /// Replace with snapshot data taken at `index` and persist.
    pub fn install(&mut self, index: u64, data: Option<&[u8]>) -> ClusterResult<()> {
        let mut state = self.decode(data)?;
        state.set_last_applied(index);
        self.storage.persist(&state)?;
        self.state = state;
        Ok(())
    }
}
