//! Client-side catch-up flow.
//!
//! Brings a lagging member current from one healthy peer: verify the store
//! lineage, install the peer's core snapshot if it is ahead of the local
//! state, pull the store transactions the snapshot does not carry, then
//! stream log entries until the peer reports it is caught up.

use causal_core::StoreId;
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::Arc;

use super::client::CatchupClient;
use crate::error::{ClusterError, ClusterResult};
use crate::state::CoreSnapshot;
use crate::store::CommittedTransaction;
use crate::types::LogEntry;

/// Where a catch-up run is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CatchupState {
    /// Not started.
    Idle,
    /// Checking store lineage.
    AwaitingStoreId,
    /// Fetching the core snapshot.
    AwaitingSnapshot,
    /// Pulling store transactions behind the snapshot.
    PullingTransactions,
    /// Receiving log entries.
    StreamingEntries,
    /// Caught up with the peer.
    Completed,
    /// Stopped on an error.
    Failed,
}

/// The local member being brought current.
///
/// Methods may block on disk and are called from the blocking pool.
pub trait CatchupSink: Send + Sync + 'static {
    /// Lineage of the local store.
    fn store_id(&self) -> StoreId;

    /// Highest applied log index.
    fn applied_index(&self) -> u64;

    /// Replace local state with `snapshot`.
    fn install_snapshot(&self, snapshot: &CoreSnapshot) -> ClusterResult<()>;

    /// Id of the last committed store transaction.
    fn last_committed_tx_id(&self) -> u64;

    /// Apply transactions pulled from the peer, in order.
    fn apply_transactions(&self, transactions: &[CommittedTransaction]) -> ClusterResult<()>;

    /// Append committed entries received from the peer and apply them.
    /// Returns the applied index afterwards.
    fn append_entries(&self, entries: &[LogEntry]) -> ClusterResult<u64>;
}

/// Summary of a completed run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatchupOutcome {
    /// Peer that served the run.
    pub peer: SocketAddr,
    /// Index of the installed snapshot, if one was needed.
    pub snapshot_index: Option<u64>,
    /// Store transactions applied.
    pub transactions_pulled: u64,
    /// Log entries received.
    pub entries_received: u64,
    /// Peer's applied index when streaming ended.
    pub peer_last_index: u64,
    /// Local applied index at the end.
    pub applied_index: u64,
}

/// Drives catch-up runs for one local member.
pub struct CatchupProcess {
    client: CatchupClient,
    sink: Arc<dyn CatchupSink>,
    state: Mutex<CatchupState>,
}

impl CatchupProcess {
    /// Create over `client` for `sink`.
    pub fn new(client: CatchupClient, sink: Arc<dyn CatchupSink>) -> Self {
        Self {
            client,
            sink,
            state: Mutex::new(CatchupState::Idle),
        }
    }

    /// Current state of the last or ongoing run.
    pub fn state(&self) -> CatchupState {
        *self.state.lock()
    }

    /// Catch up from the member at `peer`.
    ///
    /// Any error leaves the process in [`CatchupState::Failed`]; the caller
    /// decides whether to retry, possibly against another peer.
    pub async fn run(&self, peer: SocketAddr) -> ClusterResult<CatchupOutcome> {
        let result = self.run_inner(peer).await;
        match &result {
            Ok(outcome) => {
                self.transition(CatchupState::Completed);
                tracing::info!(
                    %peer,
                    snapshot_index = ?outcome.snapshot_index,
                    transactions = outcome.transactions_pulled,
                    entries = outcome.entries_received,
                    applied_index = outcome.applied_index,
                    "Catch-up completed"
                );
            }
            Err(e) => {
                self.transition(CatchupState::Failed);
                tracing::warn!(%peer, error = %e, retriable = e.is_retriable(), "Catch-up failed");
            }
        }
        result
    }

    async fn run_inner(&self, peer: SocketAddr) -> ClusterResult<CatchupOutcome> {
        let mut conn = self.client.connect(peer).await?;

        self.transition(CatchupState::AwaitingStoreId);
        let local = self.sink.store_id();
        let remote = conn.get_store_id().await?;
        if local != remote {
            return Err(ClusterError::StoreIdMismatch { local, remote });
        }

        self.transition(CatchupState::AwaitingSnapshot);
        let snapshot = conn.get_core_snapshot(remote).await?;
        let mut snapshot_index = None;
        let mut transactions_pulled = 0;
        if snapshot.prev_index() > self.sink.applied_index() {
            let index = snapshot.prev_index();
            self.blocking(move |sink| sink.install_snapshot(&snapshot))
                .await?;
            snapshot_index = Some(index);

            self.transition(CatchupState::PullingTransactions);
            let since = self.sink.last_committed_tx_id();
            let mut stream = conn.pull_transactions(remote, since).await?;
            while let Some(batch) = stream.next_batch().await? {
                transactions_pulled += batch.len() as u64;
                self.blocking(move |sink| sink.apply_transactions(&batch))
                    .await?;
            }
        }

        self.transition(CatchupState::StreamingEntries);
        let from_index = self.sink.applied_index() + 1;
        let mut entries_received = 0;
        let mut applied_index = from_index - 1;
        let mut stream = conn.get_log_entries(remote, from_index).await?;
        while let Some(batch) = stream.next_batch().await? {
            entries_received += batch.len() as u64;
            applied_index = self
                .blocking(move |sink| sink.append_entries(&batch))
                .await?;
        }
        let peer_last_index = stream.last_index().unwrap_or(applied_index);

        Ok(CatchupOutcome {
            peer,
            snapshot_index,
            transactions_pulled,
            entries_received,
            peer_last_index,
            applied_index,
        })
    }

    async fn blocking<T, F>(&self, f: F) -> ClusterResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&dyn CatchupSink) -> ClusterResult<T> + Send + 'static,
    {
        let sink = Arc::clone(&self.sink);
        tokio::task::spawn_blocking(move || f(sink.as_ref())).await?
    }

    fn transition(&self, next: CatchupState) {
        let mut state = self.state.lock();
        tracing::debug!(from = ?*state, to = ?next, "Catch-up state");
        *state = next;
    }
}

impl std::fmt::Debug for CatchupProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CatchupProcess")
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catchup::server::{CatchupServer, CatchupSource};
    use crate::command::ReplicatedContent;
    use crate::config::CatchupConfig;
    use causal_core::TimerService;

    /// Serves entries 1..=last with a snapshot at `snapshot_index`.
    struct Peer {
        store_id: StoreId,
        snapshot_index: u64,
        last: u64,
    }

    impl CatchupSource for Peer {
        fn store_id(&self) -> StoreId {
            self.store_id
        }

        fn core_snapshot(&self) -> ClusterResult<CoreSnapshot> {
            Ok(CoreSnapshot::new(self.snapshot_index, 1))
        }

        fn applied_index(&self) -> u64 {
            self.last
        }

        fn read_applied_entries(&self, from_index: u64, max: usize) -> ClusterResult<Vec<LogEntry>> {
            Ok((from_index..=self.last)
                .take(max)
                .map(|i| LogEntry::new(i, 1, ReplicatedContent::NewLeaderBarrier))
                .collect())
        }

        fn last_committed_tx_id(&self) -> u64 {
            2
        }

        fn read_transactions(&self, since: u64, _max: usize) -> ClusterResult<Vec<CommittedTransaction>> {
            Ok((since + 1..=2)
                .map(|tx_id| CommittedTransaction {
                    tx_id,
                    log_index: tx_id,
                    payload: vec![tx_id as u8],
                })
                .collect())
        }
    }

    #[derive(Default)]
    struct Recorder {
        store_id: Option<StoreId>,
        installed: Mutex<Option<u64>>,
        transactions: Mutex<Vec<u64>>,
        applied: Mutex<u64>,
    }

    impl CatchupSink for Recorder {
        fn store_id(&self) -> StoreId {
            self.store_id.unwrap_or_else(|| StoreId::new(1, 1))
        }

        fn applied_index(&self) -> u64 {
            *self.applied.lock()
        }

        fn install_snapshot(&self, snapshot: &CoreSnapshot) -> ClusterResult<()> {
            *self.installed.lock() = Some(snapshot.prev_index());
            *self.applied.lock() = snapshot.prev_index();
            Ok(())
        }

        fn last_committed_tx_id(&self) -> u64 {
            self.transactions.lock().last().copied().unwrap_or(0)
        }

        fn apply_transactions(&self, transactions: &[CommittedTransaction]) -> ClusterResult<()> {
            self.transactions
                .lock()
                .extend(transactions.iter().map(|t| t.tx_id));
            Ok(())
        }

        fn append_entries(&self, entries: &[LogEntry]) -> ClusterResult<u64> {
            let mut applied = self.applied.lock();
            for entry in entries {
                assert_eq!(entry.index, *applied + 1);
                *applied = entry.index;
            }
            Ok(*applied)
        }
    }

    async fn serve(peer: Peer) -> CatchupServer {
        let config = CatchupConfig {
            listen_addr: "127.0.0.1:0".into(),
            max_entries_per_batch: 3,
            ..CatchupConfig::default()
        };
        CatchupServer::bind(&config, Arc::new(peer)).await.unwrap()
    }

    fn process(sink: Arc<Recorder>) -> CatchupProcess {
        let client = CatchupClient::new(
            &CatchupConfig::default(),
            Arc::new(TimerService::current().unwrap()),
        );
        CatchupProcess::new(client, sink)
    }

    #[tokio::test]
    async fn installs_snapshot_then_streams_rest() {
        let server = serve(Peer {
            store_id: StoreId::new(1, 1),
            snapshot_index: 4,
            last: 10,
        })
        .await;
        let sink = Arc::new(Recorder::default());
        let process = process(sink.clone());

        let outcome = process.run(server.local_addr()).await.unwrap();
        assert_eq!(process.state(), CatchupState::Completed);
        assert_eq!(outcome.snapshot_index, Some(4));
        assert_eq!(outcome.transactions_pulled, 2);
        assert_eq!(outcome.entries_received, 6);
        assert_eq!(outcome.peer_last_index, 10);
        assert_eq!(outcome.applied_index, 10);
        assert_eq!(*sink.transactions.lock(), vec![1, 2]);
        server.shutdown().await;
    }

    #[tokio::test]
    async fn member_ahead_of_snapshot_only_streams() {
        let server = serve(Peer {
            store_id: StoreId::new(1, 1),
            snapshot_index: 4,
            last: 10,
        })
        .await;
        let sink = Arc::new(Recorder {
            applied: Mutex::new(7),
            ..Recorder::default()
        });
        let outcome = process(sink.clone())
            .run(server.local_addr())
            .await
            .unwrap();
        assert_eq!(outcome.snapshot_index, None);
        assert_eq!(outcome.entries_received, 3);
        assert_eq!(*sink.installed.lock(), None);
        server.shutdown().await;
    }

    #[tokio::test]
    async fn foreign_store_fails_before_snapshot() {
        let server = serve(Peer {
            store_id: StoreId::new(9, 9),
            snapshot_index: 4,
            last: 10,
        })
        .await;
        let sink = Arc::new(Recorder::default());
        let process = process(sink.clone());

        let err = process.run(server.local_addr()).await.unwrap_err();
        assert!(matches!(err, ClusterError::StoreIdMismatch { .. }));
        assert_eq!(process.state(), CatchupState::Failed);
        assert_eq!(*sink.installed.lock(), None);
        server.shutdown().await;
    }
}
