//! Routes committed commands to the state machine owning them.

use std::collections::BTreeMap;

use super::machine::{ApplyResult, StateMachine, StateType};
use crate::command::{ContentType, ReplicatedContent};
use crate::error::{ClusterError, ClusterResult};

/// Mapping from state type to the machine implementing it.
#[derive(Default)]
pub struct CommandDispatcher {
    machines: BTreeMap<StateType, Box<dyn StateMachine>>,
}

impl CommandDispatcher {
    /// An empty dispatcher.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a machine, replacing any previous one of the same type.
    pub fn register(&mut self, machine: Box<dyn StateMachine>) {
        self.machines.insert(machine.state_type(), machine);
    }

    /// Registered state types.
    pub fn state_types(&self) -> impl Iterator<Item = StateType> + '_ {
        self.machines.keys().copied()
    }

    /// Machine for `state_type`.
    pub fn get(&self, state_type: StateType) -> Option<&dyn StateMachine> {
        self.machines.get(&state_type).map(|m| m.as_ref())
    }

    /// Which machine a content type belongs to; `None` for content that
    /// changes no state. Session wrappers are unwrapped by the caller.
    pub fn route(content_type: ContentType) -> Option<StateType> {
        match content_type {
            ContentType::NewLeaderBarrier | ContentType::DistributedOperation => None,
            ContentType::MemberSet => Some(StateType::RaftMembership),
            ContentType::IdAllocation => Some(StateType::IdAllocation),
            ContentType::LockToken => Some(StateType::LockToken),
            ContentType::Transaction => Some(StateType::ReplicatedTransaction),
        }
    }

    /// Apply `content` committed at `index` to its machine.
    pub fn dispatch(&mut self, index: u64, content: &ReplicatedContent) -> ClusterResult<ApplyResult> {
        let content = match content {
            ReplicatedContent::DistributedOperation(op) => op.content.as_ref(),
            other => other,
        };
        let Some(state_type) = Self::route(content.content_type()) else {
            return Ok(ApplyResult::Ignored);
        };
        let machine = self
            .machines
            .get_mut(&state_type)
            .ok_or(ClusterError::Unroutable(state_type))?;

        machine
            .apply(index, content)
            .map_err(|e| ClusterError::StateMachineFailure {
                state_type,
                index,
                cause: e.to_string(),
            })
    }

    /// Flush every machine as of `applied_through`.
    pub fn flush_all(&mut self, applied_through: u64) -> ClusterResult<()> {
        for machine in self.machines.values_mut() {
            machine.flush(applied_through)?;
        }
        Ok(())
    }

    /// Collect every machine's snapshot as of `applied_through`.
    pub fn snapshot_all(&self, applied_through: u64) -> ClusterResult<BTreeMap<StateType, Vec<u8>>> {
        let mut states = BTreeMap::new();
        for (state_type, machine) in &self.machines {
            if let Some(data) = machine.snapshot(applied_through)? {
                states.insert(*state_type, data);
            }
        }
        Ok(states)
    }

    /// Verify `states` holds installable data for every machine.
    pub fn check_all(&self, states: &BTreeMap<StateType, Vec<u8>>) -> ClusterResult<()> {
        for (state_type, machine) in &self.machines {
            machine.check_snapshot(states.get(state_type).map(Vec::as_slice))?;
        }
        Ok(())
    }

    /// Install snapshot state into every machine.
    ///
    /// Callers run [`CommandDispatcher::check_all`] first; a failure here
    /// leaves machines at different indices.
    pub fn install_all(
        &mut self,
        index: u64,
        states: &BTreeMap<StateType, Vec<u8>>,
    ) -> ClusterResult<()> {
        for (state_type, machine) in &mut self.machines {
            machine.install_snapshot(index, states.get(state_type).map(Vec::as_slice))?;
        }
        Ok(())
    }

    /// Lowest applied index across machines, or `None` if none are registered.
    pub fn min_last_applied(&self) -> Option<u64> {
        self.machines.values().map(|m| m.last_applied_index()).min()
    }
}

impl std::fmt::Debug for CommandDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandDispatcher")
            .field("machines", &self.machines.keys().collect::<Vec<_>>())
            .finish()
    }
}
