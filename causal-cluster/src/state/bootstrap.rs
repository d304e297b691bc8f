//! Seeding a new cluster from an existing single-instance store.

use causal_core::IdType;
use std::sync::Arc;

use super::machine::{IdAllocationState, LockTokenState, RaftMembershipState, StateType};
use super::session::SessionTrackerState;
use super::snapshot::CoreSnapshot;
use crate::command::MemberSet;
use crate::config::StateConfig;
use crate::error::{ClusterError, ClusterResult};
use crate::store::LocalDatabase;

const RECOVERY_REQUIRED: &str = "Cannot bootstrap. Recovery is required. Please ensure that the \
     store being seeded comes from a cleanly shutdown instance or a backup";

/// Builds the first snapshot of a brand-new cluster.
pub struct CoreBootstrapper {
    db: Arc<dyn LocalDatabase>,
    batch_size: u64,
}

impl CoreBootstrapper {
    /// Create over the store being seeded.
    pub fn new(db: Arc<dyn LocalDatabase>, config: &StateConfig) -> Self {
        Self {
            db,
            batch_size: config.id_allocation_batch_size.max(1),
        }
    }

    /// Produce the snapshot at index 0, term 0 for `members`.
    ///
    /// Fails without touching the store if it needs recovery.
    pub fn bootstrap(&self, members: &MemberSet) -> ClusterResult<CoreSnapshot> {
        let store_id = self.db.store_id();
        if !self.db.is_recovered() {
            tracing::error!(%store_id, "{RECOVERY_REQUIRED}");
            return Err(ClusterError::Bootstrap(RECOVERY_REQUIRED.to_string()));
        }

        let ids = self.id_allocation_state();
        let membership = RaftMembershipState {
            committed: members.clone(),
            committed_index: 0,
            last_applied: 0,
        };

        let mut snapshot = CoreSnapshot::new(0, 0);
        snapshot.add(StateType::IdAllocation, serde_json::to_vec(&ids)?);
        snapshot.add(
            StateType::LockToken,
            serde_json::to_vec(&LockTokenState::default())?,
        );
        snapshot.add(StateType::RaftMembership, serde_json::to_vec(&membership)?);
        snapshot.add(
            StateType::SessionTracker,
            serde_json::to_vec(&SessionTrackerState::default())?,
        );

        tracing::info!(
            %store_id,
            members = members.members.len(),
            batch_size = self.batch_size,
            "Bootstrapped core snapshot"
        );
        Ok(snapshot)
    }

    /// First allocation window for every id type, rounded up to a whole
    /// batch past the store's high-water mark.
    fn id_allocation_state(&self) -> IdAllocationState {
        let highest = self.db.current_highest_ids();
        let mut state = IdAllocationState::default();
        for id_type in IdType::ALL {
            let high = highest.get(&id_type).copied().unwrap_or(0);
            state.set_first_unallocated(id_type, high.div_ceil(self.batch_size) * self.batch_size);
        }
        state
    }
}
