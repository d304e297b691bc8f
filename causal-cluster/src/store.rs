//! Interface to the local database store.
//!
//! The transactional storage engine lives outside this crate. The cluster
//! core needs only the narrow surface below: store identity and health, id
//! high-water marks for bootstrap, and an ordered stream of committed
//! transactions to apply and to serve to catching-up members.

use causal_core::{IdType, StoreId};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::{ClusterError, ClusterResult};

/// A transaction committed to the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommittedTransaction {
    /// Store transaction id; contiguous from 1.
    pub tx_id: u64,
    /// Raft log index the transaction was committed at.
    pub log_index: u64,
    /// Opaque transaction bytes.
    pub payload: Vec<u8>,
}

/// The local store as seen by the cluster core.
pub trait LocalDatabase: Send + Sync {
    /// Lineage of this store.
    fn store_id(&self) -> StoreId;

    /// Whether the store was shut down cleanly and needs no recovery.
    fn is_recovered(&self) -> bool;

    /// Next free id per id space.
    fn current_highest_ids(&self) -> BTreeMap<IdType, u64>;

    /// Id of the last committed transaction, 0 if none.
    fn last_committed_tx_id(&self) -> u64;

    /// Raft log index of the last committed transaction, 0 if none.
    fn last_applied_log_index(&self) -> u64;

    /// Commit a replicated transaction applied at `log_index`.
    fn commit_transaction(&self, log_index: u64, payload: &[u8]) -> ClusterResult<u64>;

    /// Up to `max` transactions with id greater than `tx_id`, in id order.
    fn read_committed_transactions_since(
        &self,
        tx_id: u64,
        max: usize,
    ) -> ClusterResult<Vec<CommittedTransaction>>;

    /// Apply a transaction pulled from a peer during catch-up.
    ///
    /// Transactions already present are skipped; gaps are rejected.
    fn apply_pulled_transaction(&self, tx: &CommittedTransaction) -> ClusterResult<()>;
}

#[derive(Debug, Default)]
struct MemoryInner {
    transactions: Vec<CommittedTransaction>,
    high_ids: BTreeMap<IdType, u64>,
}

/// In-memory store for tests and embedding.
#[derive(Debug)]
pub struct MemoryDatabase {
    store_id: StoreId,
    recovered: bool,
    inner: RwLock<MemoryInner>,
}

impl MemoryDatabase {
    /// An empty, cleanly shut down store.
    pub fn new(store_id: StoreId) -> Self {
        Self {
            store_id,
            recovered: true,
            inner: RwLock::new(MemoryInner::default()),
        }
    }

    /// Set the next free id for `id_type`.
    pub fn with_high_id(self, id_type: IdType, high_id: u64) -> Self {
        self.inner.write().high_ids.insert(id_type, high_id);
        self
    }

    /// Mark the store as needing recovery.
    pub fn needing_recovery(mut self) -> Self {
        self.recovered = false;
        self
    }

    /// All committed transactions.
    pub fn transactions(&self) -> Vec<CommittedTransaction> {
        self.inner.read().transactions.clone()
    }
}

impl LocalDatabase for MemoryDatabase {
    fn store_id(&self) -> StoreId {
        self.store_id
    }

    fn is_recovered(&self) -> bool {
        self.recovered
    }

    fn current_highest_ids(&self) -> BTreeMap<IdType, u64> {
        self.inner.read().high_ids.clone()
    }

    fn last_committed_tx_id(&self) -> u64 {
        self.inner.read().transactions.last().map(|t| t.tx_id).unwrap_or(0)
    }

    fn last_applied_log_index(&self) -> u64 {
        self.inner
            .read()
            .transactions
            .last()
            .map(|t| t.log_index)
            .unwrap_or(0)
    }

    fn commit_transaction(&self, log_index: u64, payload: &[u8]) -> ClusterResult<u64> {
        let mut inner = self.inner.write();
        let tx_id = inner.transactions.last().map(|t| t.tx_id).unwrap_or(0) + 1;
        inner.transactions.push(CommittedTransaction {
            tx_id,
            log_index,
            payload: payload.to_vec(),
        });
        Ok(tx_id)
    }

    fn read_committed_transactions_since(
        &self,
        tx_id: u64,
        max: usize,
    ) -> ClusterResult<Vec<CommittedTransaction>> {
        let inner = self.inner.read();
        // Ids are contiguous from 1, so the id doubles as a position.
        let start = (tx_id as usize).min(inner.transactions.len());
        Ok(inner.transactions[start..]
            .iter()
            .take(max)
            .cloned()
            .collect())
    }

    fn apply_pulled_transaction(&self, tx: &CommittedTransaction) -> ClusterResult<()> {
        let mut inner = self.inner.write();
        let last = inner.transactions.last().map(|t| t.tx_id).unwrap_or(0);
        if tx.tx_id <= last {
            return Ok(());
        }
        if tx.tx_id != last + 1 {
            return Err(ClusterError::OutOfOrder {
                expected: last + 1,
                actual: tx.tx_id,
            });
        }
        inner.transactions.push(tx.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn committed_transactions_stream_in_order() {
        let db = MemoryDatabase::new(StoreId::generate());
        for i in 1..=5u64 {
            assert_eq!(db.commit_transaction(i * 2, &[i as u8]).unwrap(), i);
        }
        let since = db.read_committed_transactions_since(2, 2).unwrap();
        assert_eq!(since.iter().map(|t| t.tx_id).collect::<Vec<_>>(), vec![3, 4]);
        assert_eq!(db.last_applied_log_index(), 10);
        assert!(db.read_committed_transactions_since(9, 10).unwrap().is_empty());
    }

    #[test]
    fn pulled_transactions_must_be_contiguous() {
        let source = MemoryDatabase::new(StoreId::generate());
        source.commit_transaction(1, b"a").unwrap();
        source.commit_transaction(2, b"b").unwrap();
        let txs = source.read_committed_transactions_since(0, 10).unwrap();

        let target = MemoryDatabase::new(source.store_id());
        target.apply_pulled_transaction(&txs[0]).unwrap();
        target.apply_pulled_transaction(&txs[0]).unwrap();
        target.apply_pulled_transaction(&txs[1]).unwrap();
        assert_eq!(target.transactions(), txs);

        let gap = CommittedTransaction {
            tx_id: 9,
            log_index: 9,
            payload: vec![],
        };
        assert!(matches!(
            target.apply_pulled_transaction(&gap),
            Err(ClusterError::OutOfOrder { expected: 3, actual: 9 })
        ));
    }
}
