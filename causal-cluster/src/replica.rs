//! One member's replicated core: the raft log, the core state and the apply
//! path, plus both ends of catch-up.

use causal_core::{IndexTracker, MemberId, StoreId, Timer, TimerService};
use std::sync::Arc;

use crate::catchup::{CatchupClient, CatchupProcess, CatchupServer, CatchupSink, CatchupSource};
use crate::command::{MemberSet, ReplicatedContent};
use crate::config::ClusterConfig;
use crate::error::{ClusterError, ClusterResult};
use crate::raft::SegmentedRaftLog;
use crate::state::{ApplicationProcess, ApplyResult, CoreBootstrapper, CoreSnapshot, CoreState};
use crate::store::{CommittedTransaction, LocalDatabase};
use crate::types::{LogEntry, RaftLogEntry};

/// The replicated core of one cluster member.
///
/// The Raft core appends through [`CoreReplica::append`] and reports commit
/// progress through [`CoreReplica::notify_commit`]; everything downstream
/// of the log happens here.
pub struct CoreReplica {
    config: ClusterConfig,
    log: SegmentedRaftLog,
    state: Arc<CoreState>,
    application: ApplicationProcess,
    db: Arc<dyn LocalDatabase>,
}

impl CoreReplica {
    /// Open the log and state under `config.data_dir` over `db`.
    pub fn open(config: ClusterConfig, db: Arc<dyn LocalDatabase>) -> ClusterResult<Self> {
        config.validate().map_err(ClusterError::Config)?;

        let log = SegmentedRaftLog::open(config.log_dir(), config.log.clone())?;
        let state = Arc::new(CoreState::open(
            &config.state_dir(),
            &config.state,
            Arc::clone(&db),
        )?);
        let application = ApplicationProcess::new(log.clone(), Arc::clone(&state), &config.state);

        tracing::info!(
            member_id = %config.member_id,
            store_id = %db.store_id(),
            append_index = log.append_index(),
            last_applied = state.last_applied_index(),
            "Opened core replica"
        );
        Ok(Self {
            config,
            log,
            state,
            application,
            db,
        })
    }

    /// This member.
    pub fn member_id(&self) -> MemberId {
        self.config.member_id
    }

    /// Configuration the replica was opened with.
    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    /// The raft log.
    pub fn log(&self) -> &SegmentedRaftLog {
        &self.log
    }

    /// The replicated state.
    pub fn core_state(&self) -> &Arc<CoreState> {
        &self.state
    }

    /// Append entries to the log, returning the last index.
    pub fn append(&self, entries: &[RaftLogEntry]) -> ClusterResult<u64> {
        self.log.append(entries)
    }

    /// Append one command in `term`.
    pub fn append_entry(&self, term: u64, content: ReplicatedContent) -> ClusterResult<u64> {
        self.log.append_entry(term, content)
    }

    /// Apply everything committed through `commit_index`.
    pub fn notify_commit(&self, commit_index: u64) -> ClusterResult<u64> {
        self.application.notify_commit(commit_index)
    }

    /// Apply one committed entry directly, bypassing the log.
    pub fn apply_committed(&self, entry: &LogEntry) -> ClusterResult<ApplyResult> {
        self.application
            .exclusive(|| self.state.apply_committed(entry))
    }

    /// Snapshot of the replicated state at the applied index.
    pub fn build_snapshot(&self) -> ClusterResult<CoreSnapshot> {
        self.state.build_snapshot()
    }

    /// Replace the replicated state with `snapshot` and move the log past it.
    ///
    /// Log entries after the snapshot are kept only if the log agrees with
    /// the snapshot's position.
    pub fn install_snapshot(&self, snapshot: &CoreSnapshot) -> ClusterResult<()> {
        self.application
            .exclusive(|| self.install_snapshot_locked(snapshot))
    }

    fn install_snapshot_locked(&self, snapshot: &CoreSnapshot) -> ClusterResult<()> {
        let index = snapshot.prev_index();
        let term = snapshot.prev_term();
        let agrees = self.log.term_at(index) == Some(term);
        if !agrees && index <= self.log.append_index() && index > self.log.prev_index() {
            self.log.truncate(self.log.prev_index() + 1)?;
        }
        self.state.install_snapshot(snapshot)?;
        if !agrees {
            self.log.skip(index, term)?;
        }
        Ok(())
    }

    /// Seed a brand-new cluster of `members` from the local store.
    ///
    /// Refused once the replica holds log entries or applied state.
    pub fn bootstrap(&self, members: &MemberSet) -> ClusterResult<CoreSnapshot> {
        self.application.exclusive(|| {
            let applied = self.state.last_applied_index();
            let appended = self.log.append_index();
            if applied > 0 || appended > 0 {
                tracing::warn!(applied, appended, "Refusing to bootstrap a used replica");
                return Err(ClusterError::Bootstrap(format!(
                    "replica already holds state (applied {applied}, appended {appended})"
                )));
            }
            let snapshot = CoreBootstrapper::new(Arc::clone(&self.db), &self.config.state)
                .bootstrap(members)?;
            self.install_snapshot_locked(&snapshot)?;
            Ok(snapshot)
        })
    }

    /// Highest applied index.
    pub fn last_applied_index(&self) -> u64 {
        self.state.last_applied_index()
    }

    /// Checkpoint at the applied index.
    pub fn flush(&self) -> ClusterResult<()> {
        self.application.flush()
    }

    /// Serve catch-up on `config.catchup.listen_addr`.
    pub async fn serve_catchup(self: &Arc<Self>) -> ClusterResult<CatchupServer> {
        CatchupServer::bind(&self.config.catchup, Arc::clone(self) as Arc<dyn CatchupSource>).await
    }

    /// A timer named `name` on `timers`, armed with the configured election
    /// timeout. Each arm draws a fresh jittered duration.
    pub fn election_timer<F>(&self, timers: &TimerService, name: impl Into<String>, handler: F) -> Timer
    where
        F: Fn(&Timer) + Send + Sync + 'static,
    {
        let timer = timers.create(name, handler);
        timer.set(self.config.election_timeout());
        timer
    }

    /// A timer named `name` on `timers`, armed with the heartbeat interval.
    pub fn heartbeat_timer<F>(&self, timers: &TimerService, name: impl Into<String>, handler: F) -> Timer
    where
        F: Fn(&Timer) + Send + Sync + 'static,
    {
        let timer = timers.create(name, handler);
        timer.set(self.config.heartbeat_timeout());
        timer
    }

    /// A catch-up process bringing this replica current from peers.
    pub fn catchup_process(self: &Arc<Self>, timers: Arc<TimerService>) -> CatchupProcess {
        let client = CatchupClient::new(&self.config.catchup, timers);
        CatchupProcess::new(client, Arc::clone(self) as Arc<dyn CatchupSink>)
    }

    /// Append `entries`, skipping those already held with the same term and
    /// truncating at the first conflict. Returns the last index appended or
    /// confirmed.
    fn append_committed(&self, entries: &[LogEntry]) -> ClusterResult<u64> {
        let applied = self.state.last_applied_index();
        let mut start = entries.len();
        for (i, entry) in entries.iter().enumerate() {
            if entry.index <= self.log.prev_index() {
                continue;
            }
            match self.log.term_at(entry.index) {
                Some(term) if term == entry.term => continue,
                Some(term) => {
                    if entry.index <= applied {
                        return Err(ClusterError::Protocol(format!(
                            "peer entry {} has term {}, applied local entry has term {term}",
                            entry.index, entry.term
                        )));
                    }
                    tracing::warn!(
                        index = entry.index,
                        local_term = term,
                        peer_term = entry.term,
                        "Truncating conflicting log suffix"
                    );
                    self.log.truncate(entry.index)?;
                    start = i;
                    break;
                }
                None => {
                    start = i;
                    break;
                }
            }
        }

        let new = &entries[start..];
        let Some(first) = new.first() else {
            return Ok(entries.last().map_or(self.log.append_index(), |e| e.index));
        };
        let expected = self.log.append_index() + 1;
        if first.index != expected {
            return Err(ClusterError::OutOfOrder {
                expected,
                actual: first.index,
            });
        }
        let raft_entries: Vec<RaftLogEntry> = new.iter().cloned().map(LogEntry::into_raft_entry).collect();
        self.log.append(&raft_entries)
    }
}

impl IndexTracker for CoreReplica {
    fn current_index(&self) -> u64 {
        self.state.last_applied_index()
    }
}

impl CatchupSource for CoreReplica {
    fn store_id(&self) -> StoreId {
        self.db.store_id()
    }

    fn core_snapshot(&self) -> ClusterResult<CoreSnapshot> {
        self.state.build_snapshot()
    }

    fn applied_index(&self) -> u64 {
        self.state.last_applied_index()
    }

    fn read_applied_entries(&self, from_index: u64, max: usize) -> ClusterResult<Vec<LogEntry>> {
        let applied = self.state.last_applied_index();
        if from_index > applied {
            return Ok(Vec::new());
        }
        let max = max.min((applied - from_index + 1) as usize);
        self.log.read_range(from_index, max)
    }

    fn last_committed_tx_id(&self) -> u64 {
        self.db.last_committed_tx_id()
    }

    fn read_transactions(&self, since_tx_id: u64, max: usize) -> ClusterResult<Vec<CommittedTransaction>> {
        self.db.read_committed_transactions_since(since_tx_id, max)
    }
}

impl CatchupSink for CoreReplica {
    fn store_id(&self) -> StoreId {
        self.db.store_id()
    }

    fn applied_index(&self) -> u64 {
        self.state.last_applied_index()
    }

    fn install_snapshot(&self, snapshot: &CoreSnapshot) -> ClusterResult<()> {
        CoreReplica::install_snapshot(self, snapshot)
    }

    fn last_committed_tx_id(&self) -> u64 {
        self.db.last_committed_tx_id()
    }

    fn apply_transactions(&self, transactions: &[CommittedTransaction]) -> ClusterResult<()> {
        for tx in transactions {
            self.db.apply_pulled_transaction(tx)?;
        }
        Ok(())
    }

    fn append_entries(&self, entries: &[LogEntry]) -> ClusterResult<u64> {
        // Truncation must not interleave with a batch being applied.
        let last = self
            .application
            .exclusive(|| self.append_committed(entries))?;
        self.application.notify_commit(last)
    }
}

impl std::fmt::Debug for CoreReplica {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoreReplica")
            .field("member_id", &self.config.member_id)
            .field("append_index", &self.log.append_index())
            .field("state", &self.state)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{LockTokenRequest, ReplicatedTransaction};
    use crate::raft::PruningStrategy;
    use crate::state::machine::LockTokenState;
    use crate::state::StateType;
    use crate::store::MemoryDatabase;
    use tempfile::TempDir;

    fn open(dir: &TempDir, store_id: StoreId) -> CoreReplica {
        let config = ClusterConfig::builder()
            .data_dir(dir.path())
            .sync_on_append(false)
            .pruning(PruningStrategy::KeepAll)
            .build()
            .unwrap();
        CoreReplica::open(config, Arc::new(MemoryDatabase::new(store_id))).unwrap()
    }

    fn tx(n: u8) -> ReplicatedContent {
        ReplicatedContent::Transaction(ReplicatedTransaction { tx: vec![n] })
    }

    #[test]
    fn bootstrap_moves_log_past_snapshot() {
        let dir = TempDir::new().unwrap();
        let replica = open(&dir, StoreId::generate());
        let members = MemberSet::new([replica.member_id()]);

        let snapshot = replica.bootstrap(&members).unwrap();
        assert_eq!(snapshot.prev_index(), 0);
        assert_eq!(replica.last_applied_index(), 0);

        assert_eq!(replica.append_entry(1, tx(1)).unwrap(), 1);
        assert_eq!(replica.notify_commit(1).unwrap(), 1);
        assert_eq!(replica.db.last_committed_tx_id(), 1);
    }

    #[test]
    fn catchup_append_skips_held_and_truncates_conflicts() {
        let dir = TempDir::new().unwrap();
        let replica = open(&dir, StoreId::generate());
        for n in 1..=4 {
            replica.append_entry(1, tx(n)).unwrap();
        }
        replica.notify_commit(2).unwrap();

        // 1..=2 already held and applied; 3 conflicts on term.
        let peer: Vec<LogEntry> = (1..=5)
            .map(|i| LogEntry::new(i, if i <= 2 { 1 } else { 2 }, tx(i as u8)))
            .collect();
        assert_eq!(CatchupSink::append_entries(&replica, &peer).unwrap(), 5);
        assert_eq!(replica.log.term_at(3), Some(2));
        assert_eq!(replica.log.append_index(), 5);
    }

    #[test]
    fn bootstrap_refused_once_replica_holds_state() {
        let dir = TempDir::new().unwrap();
        let replica = open(&dir, StoreId::generate());
        let members = MemberSet::new([replica.member_id()]);
        replica.bootstrap(&members).unwrap();

        replica.append_entry(1, tx(1)).unwrap();
        let err = replica.bootstrap(&members).unwrap_err();
        assert!(matches!(err, ClusterError::Bootstrap(_)));

        replica.notify_commit(1).unwrap();
        let err = replica.bootstrap(&members).unwrap_err();
        assert!(matches!(err, ClusterError::Bootstrap(_)));
        assert_eq!(replica.last_applied_index(), 1);
        assert_eq!(replica.log.append_index(), 1);
    }

    #[test]
    fn catchup_append_waits_for_apply_path() {
        let dir = TempDir::new().unwrap();
        let replica = open(&dir, StoreId::generate());
        for n in 1..=3 {
            replica.append_entry(1, tx(n)).unwrap();
        }
        let order = parking_lot::Mutex::new(Vec::new());
        let (held_tx, held_rx) = std::sync::mpsc::channel();

        std::thread::scope(|s| {
            let (replica, order) = (&replica, &order);
            s.spawn(move || {
                replica.application.exclusive(|| {
                    held_tx.send(()).unwrap();
                    std::thread::sleep(std::time::Duration::from_millis(100));
                    order.lock().push("apply");
                })
            });
            held_rx.recv().unwrap();

            let peer: Vec<LogEntry> = (2..=3).map(|i| LogEntry::new(i, 2, tx(i as u8))).collect();
            assert_eq!(CatchupSink::append_entries(replica, &peer).unwrap(), 3);
            order.lock().push("append");
        });

        assert_eq!(*order.lock(), vec!["apply", "append"]);
        assert_eq!(replica.log.term_at(2), Some(2));
        assert_eq!(replica.last_applied_index(), 3);
    }

    #[tokio::test]
    async fn raft_timers_follow_config() {
        let dir = TempDir::new().unwrap();
        let config = ClusterConfig::builder()
            .data_dir(dir.path())
            .sync_on_append(false)
            .election_timeout_ms(500, 600)
            .heartbeat_interval_ms(20)
            .build()
            .unwrap();
        let replica = CoreReplica::open(config, Arc::new(MemoryDatabase::new(StoreId::generate()))).unwrap();
        let timers = TimerService::current().unwrap();

        let heartbeat = replica.heartbeat_timer(&timers, "heartbeat", |_| {});
        let election = replica.election_timer(&timers, "election", |_| {});
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;

        assert_eq!(heartbeat.invocations(), 1);
        assert_eq!(election.invocations(), 0);
        assert!(election.is_armed());
        timers.cancel_all();
    }

    #[test]
    fn conflict_below_applied_index_is_refused() {
        let dir = TempDir::new().unwrap();
        let replica = open(&dir, StoreId::generate());
        replica.append_entry(1, tx(1)).unwrap();
        replica.notify_commit(1).unwrap();

        let err = replica
            .append_committed(&[LogEntry::new(1, 7, tx(1))])
            .unwrap_err();
        assert!(matches!(err, ClusterError::Protocol(_)));
    }

    #[test]
    fn source_serves_only_applied_entries() {
        let dir = TempDir::new().unwrap();
        let replica = open(&dir, StoreId::generate());
        let owner = replica.member_id();
        for _ in 0..5 {
            replica
                .append_entry(
                    3,
                    ReplicatedContent::LockToken(LockTokenRequest {
                        owner,
                        candidate_id: 1,
                    }),
                )
                .unwrap();
        }
        replica.notify_commit(3).unwrap();

        let entries = replica.read_applied_entries(1, 100).unwrap();
        assert_eq!(entries.len(), 3);
        assert!(replica.read_applied_entries(4, 100).unwrap().is_empty());

        let token: LockTokenState = CatchupSource::core_snapshot(&replica)
            .unwrap()
            .get_state(StateType::LockToken)
            .unwrap();
        assert_eq!(token.owner, Some(owner));
        assert_eq!(token.token_id, 1);
    }
}
