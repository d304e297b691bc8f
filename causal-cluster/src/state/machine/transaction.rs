//! Store transactions.
//!
//! Transaction data is durable in the store itself, so this machine keeps no
//! state of its own beyond the applied index, and it contributes nothing to
//! snapshots; catch-up pulls store contents separately.

use std::sync::Arc;

use super::{ApplyResult, StateMachine, StateType};
use crate::command::ReplicatedContent;
use crate::error::ClusterResult;
use crate::store::LocalDatabase;

/// Hands committed transactions to the local store.
pub struct ReplicatedTransactionStateMachine {
    db: Arc<dyn LocalDatabase>,
    last_applied: u64,
}

impl ReplicatedTransactionStateMachine {
    /// Create over `db`, resuming after the store's last applied index.
    pub fn new(db: Arc<dyn LocalDatabase>) -> Self {
        let last_applied = db.last_applied_log_index();
        Self { db, last_applied }
    }
}

impl StateMachine for ReplicatedTransactionStateMachine {
    fn state_type(&self) -> StateType {
        StateType::ReplicatedTransaction
    }

    fn apply(&mut self, index: u64, command: &ReplicatedContent) -> ClusterResult<ApplyResult> {
        let ReplicatedContent::Transaction(tx) = command else {
            return Ok(ApplyResult::Ignored);
        };
        if index <= self.last_applied || index <= self.db.last_applied_log_index() {
            return Ok(ApplyResult::AlreadyApplied);
        }

        let tx_id = self.db.commit_transaction(index, &tx.tx)?;
        self.last_applied = index;
        tracing::debug!(index, tx_id, "Committed replicated transaction");
        Ok(ApplyResult::Committed { tx_id })
    }

    fn last_applied_index(&self) -> u64 {
        self.last_applied
    }

    fn flush(&mut self, applied_through: u64) -> ClusterResult<()> {
        self.last_applied = self.last_applied.max(applied_through);
        Ok(())
    }

    fn snapshot(&self, _applied_through: u64) -> ClusterResult<Option<Vec<u8>>> {
        Ok(None)
    }

    fn install_snapshot(&mut self, index: u64, _data: Option<&[u8]>) -> ClusterResult<()> {
        self.last_applied = index;
        Ok(())
    }
}
