//! Core state: the dispatcher, session tracker and flush checkpoint behind
//! one apply lock.
//!
//! Applying an entry, building a snapshot, installing one and flushing are
//! mutually exclusive, so every snapshot is a consistent cut at a single log
//! index.

use causal_core::{IndexTracker, LogPosition};
use parking_lot::Mutex;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use super::dispatcher::CommandDispatcher;
use super::machine::{
    ApplyResult, IdAllocationStateMachine, LockTokenStateMachine, RaftMembershipStateMachine,
    ReplicatedTransactionStateMachine, StateType,
};
use super::session::{SessionCheck, SessionTracker};
use super::snapshot::CoreSnapshot;
use super::storage::{DurableStateStorage, StateStorage};
use crate::command::ReplicatedContent;
use crate::config::StateConfig;
use crate::error::{ClusterError, ClusterResult};
use crate::store::LocalDatabase;
use crate::types::LogEntry;

struct ApplyState {
    dispatcher: CommandDispatcher,
    sessions: SessionTracker,
    last_applied: u64,
    last_applied_term: u64,
    checkpoint: Box<dyn StateStorage<LogPosition>>,
}

/// Replicated state of one member.
pub struct CoreState {
    apply: Mutex<ApplyState>,
    applied: AtomicU64,
    flushed: AtomicU64,
    failed: AtomicBool,
}

impl CoreState {
    /// Assemble from parts. Application resumes after the checkpoint.
    pub fn new(
        dispatcher: CommandDispatcher,
        sessions: SessionTracker,
        checkpoint: Box<dyn StateStorage<LogPosition>>,
    ) -> Self {
        let flushed = checkpoint.initial_state();
        Self {
            apply: Mutex::new(ApplyState {
                dispatcher,
                sessions,
                last_applied: flushed.index,
                last_applied_term: flushed.term,
                checkpoint,
            }),
            applied: AtomicU64::new(flushed.index),
            flushed: AtomicU64::new(flushed.index),
            failed: AtomicBool::new(false),
        }
    }

    /// Open the standard set of state machines under `dir`.
    pub fn open(dir: &Path, config: &StateConfig, db: Arc<dyn LocalDatabase>) -> ClusterResult<Self> {
        let mut dispatcher = CommandDispatcher::new();
        dispatcher.register(Box::new(IdAllocationStateMachine::open(dir)?));
        dispatcher.register(Box::new(LockTokenStateMachine::open(dir)?));
        dispatcher.register(Box::new(RaftMembershipStateMachine::open(dir)?));
        dispatcher.register(Box::new(ReplicatedTransactionStateMachine::new(db)));

        let sessions = SessionTracker::open(dir, config.max_tracked_sessions)?;
        let checkpoint = DurableStateStorage::open(dir, "last-flushed", LogPosition::ZERO)?;

        let state = Self::new(dispatcher, sessions, Box::new(checkpoint));
        tracing::info!(
            dir = %dir.display(),
            last_flushed = state.last_flushed_index(),
            "Opened core state"
        );
        Ok(state)
    }

    /// Apply one committed entry.
    ///
    /// Entries must arrive in index order. An entry at or below the applied
    /// index is skipped. A state machine error marks the replica failed and
    /// every later call is refused until a snapshot is installed.
    pub fn apply_committed(&self, entry: &LogEntry) -> ClusterResult<ApplyResult> {
        let mut state = self.apply.lock();
        if self.failed.load(Ordering::Acquire) {
            return Err(ClusterError::ReplicaFailed {
                index: state.last_applied,
            });
        }
        if entry.index <= state.last_applied {
            return Ok(ApplyResult::AlreadyApplied);
        }
        if entry.index != state.last_applied + 1 {
            return Err(ClusterError::OutOfOrder {
                expected: state.last_applied + 1,
                actual: entry.index,
            });
        }

        let ApplyState {
            dispatcher,
            sessions,
            ..
        } = &mut *state;
        let result = match &entry.content {
            ReplicatedContent::DistributedOperation(op) => {
                match sessions.validate_and_record(entry.index, &op.session, &op.operation_id) {
                    SessionCheck::Accept => dispatcher.dispatch(entry.index, &entry.content),
                    SessionCheck::Duplicate => Ok(ApplyResult::Duplicate),
                }
            }
            content => dispatcher.dispatch(entry.index, content),
        };

        match result {
            Ok(result) => {
                state.last_applied = entry.index;
                state.last_applied_term = entry.term;
                self.applied.store(entry.index, Ordering::Release);
                Ok(result)
            }
            Err(e) => {
                self.failed.store(true, Ordering::Release);
                tracing::error!(
                    index = entry.index,
                    term = entry.term,
                    error = %e,
                    "Failed to apply committed entry, replica stopped"
                );
                Err(e)
            }
        }
    }

    /// Build a snapshot of every state machine at the applied index.
    pub fn build_snapshot(&self) -> ClusterResult<CoreSnapshot> {
        let state = self.apply.lock();
        let mut snapshot = CoreSnapshot::new(state.last_applied, state.last_applied_term);
        for (state_type, data) in state.dispatcher.snapshot_all(state.last_applied)? {
            snapshot.add(state_type, data);
        }
        snapshot.add(
            StateType::SessionTracker,
            state.sessions.snapshot(state.last_applied)?,
        );
        tracing::info!(
            prev_index = snapshot.prev_index(),
            prev_term = snapshot.prev_term(),
            states = snapshot.states().len(),
            "Built core snapshot"
        );
        Ok(snapshot)
    }

    /// Replace all state with `snapshot` and checkpoint it.
    ///
    /// Every machine's data is decoded before anything is replaced, so a
    /// malformed or incomplete snapshot is refused with state untouched. A
    /// failure while persisting the installed parts marks the replica failed.
    /// A successful install clears a previous failure: this is how a failed
    /// replica resynchronizes.
    pub fn install_snapshot(&self, snapshot: &CoreSnapshot) -> ClusterResult<()> {
        let mut state = self.apply.lock();
        let index = snapshot.prev_index();

        let checked = state.dispatcher.check_all(snapshot.states()).and_then(|_| {
            state
                .sessions
                .check_snapshot(snapshot.get(StateType::SessionTracker))
        });
        if let Err(e) = checked {
            tracing::warn!(prev_index = index, error = %e, "Refused core snapshot");
            return Err(e);
        }

        if let Err(e) = Self::replace_state(&mut state, snapshot) {
            self.failed.store(true, Ordering::Release);
            tracing::error!(
                prev_index = index,
                error = %e,
                "Snapshot install failed part way, replica stopped"
            );
            return Err(e);
        }

        self.applied.store(index, Ordering::Release);
        self.flushed.store(index, Ordering::Release);
        self.failed.store(false, Ordering::Release);
        tracing::info!(
            prev_index = index,
            prev_term = snapshot.prev_term(),
            "Installed core snapshot"
        );
        Ok(())
    }

    fn replace_state(state: &mut ApplyState, snapshot: &CoreSnapshot) -> ClusterResult<()> {
        let index = snapshot.prev_index();
        state.dispatcher.install_all(index, snapshot.states())?;
        state
            .sessions
            .install_snapshot(index, snapshot.get(StateType::SessionTracker))?;
        state.last_applied = index;
        state.last_applied_term = snapshot.prev_term();
        state.checkpoint.persist(&snapshot.position())
    }

    /// Durably checkpoint all state as of `last_applied`, which must be the
    /// current applied index.
    ///
    /// State machines are flushed first, then the session tracker, then the
    /// checkpoint itself, so the checkpoint never runs ahead of the state it
    /// describes.
    pub fn flush(&self, last_applied: u64) -> ClusterResult<()> {
        let mut state = self.apply.lock();
        if last_applied != state.last_applied {
            return Err(ClusterError::FlushOutOfSync {
                requested: last_applied,
                applied: state.last_applied,
            });
        }

        state.dispatcher.flush_all(last_applied)?;
        state.sessions.flush(last_applied)?;
        let position = LogPosition::new(last_applied, state.last_applied_term);
        state.checkpoint.persist(&position)?;

        self.flushed.store(last_applied, Ordering::Release);
        tracing::debug!(last_flushed = last_applied, "Flushed core state");
        Ok(())
    }

    /// Highest applied index.
    pub fn last_applied_index(&self) -> u64 {
        self.applied.load(Ordering::Acquire)
    }

    /// Highest durably checkpointed index.
    pub fn last_flushed_index(&self) -> u64 {
        self.flushed.load(Ordering::Acquire)
    }

    /// Highest index below which the log is no longer needed for recovery.
    pub fn prunable_index(&self) -> u64 {
        let state = self.apply.lock();
        let flushed = self.flushed.load(Ordering::Acquire);
        let machines = state.dispatcher.min_last_applied().unwrap_or(flushed);
        flushed.min(machines)
    }

    /// Whether application stopped after a state machine failure.
    pub fn is_failed(&self) -> bool {
        self.failed.load(Ordering::Acquire)
    }
}

impl IndexTracker for CoreState {
    fn current_index(&self) -> u64 {
        self.last_flushed_index()
    }
}

impl std::fmt::Debug for CoreState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoreState")
            .field("last_applied", &self.last_applied_index())
            .field("last_flushed", &self.last_flushed_index())
            .field("failed", &self.is_failed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{
        GlobalSession, IdAllocationRequest, LocalOperationId, ReplicatedTransaction,
    };
    use crate::state::machine::{IdAllocationState, StateMachine};
    use crate::state::session::SessionTrackerState;
    use crate::state::storage::InMemoryStateStorage;
    use crate::store::MemoryDatabase;
    use causal_core::{IdType, MemberId, StoreId};
    use tempfile::TempDir;

    fn open(dir: &Path) -> CoreState {
        let db = Arc::new(MemoryDatabase::new(StoreId::new(1, 1)));
        CoreState::open(dir, &StateConfig::default(), db).unwrap()
    }

    fn alloc(owner: MemberId, start: u64) -> ReplicatedContent {
        ReplicatedContent::IdAllocation(IdAllocationRequest {
            owner,
            id_type: IdType::Node,
            range_start: start,
            range_length: 10,
        })
    }

    #[test]
    fn entries_apply_in_order_only() {
        let dir = TempDir::new().unwrap();
        let state = open(dir.path());
        let owner = MemberId::new();

        state
            .apply_committed(&LogEntry::new(1, 1, alloc(owner, 0)))
            .unwrap();
        assert!(matches!(
            state.apply_committed(&LogEntry::new(3, 1, alloc(owner, 10))),
            Err(ClusterError::OutOfOrder {
                expected: 2,
                actual: 3
            })
        ));
        assert_eq!(
            state
                .apply_committed(&LogEntry::new(1, 1, alloc(owner, 0)))
                .unwrap(),
            ApplyResult::AlreadyApplied
        );
        assert_eq!(state.last_applied_index(), 1);
    }

    #[test]
    fn duplicate_session_operation_mutates_once() {
        let dir = TempDir::new().unwrap();
        let state = open(dir.path());
        let owner = MemberId::new();
        let session = GlobalSession::new(owner);
        let op = alloc(owner, 0).in_session(session, LocalOperationId::new(1, 1));

        assert_eq!(
            state.apply_committed(&LogEntry::new(1, 1, op.clone())).unwrap(),
            ApplyResult::Accepted
        );
        assert_eq!(
            state.apply_committed(&LogEntry::new(2, 1, op)).unwrap(),
            ApplyResult::Duplicate
        );
        assert_eq!(state.last_applied_index(), 2);

        let ids: IdAllocationState = state
            .build_snapshot()
            .unwrap()
            .get_state(StateType::IdAllocation)
            .unwrap();
        assert_eq!(ids.first_unallocated(IdType::Node), 10);
    }

    #[test]
    fn flush_must_match_applied_index() {
        let dir = TempDir::new().unwrap();
        let state = open(dir.path());
        state
            .apply_committed(&LogEntry::new(1, 2, ReplicatedContent::NewLeaderBarrier))
            .unwrap();
        assert!(matches!(
            state.flush(5),
            Err(ClusterError::FlushOutOfSync {
                requested: 5,
                applied: 1
            })
        ));
        state.flush(1).unwrap();
        assert_eq!(state.last_flushed_index(), 1);
        assert_eq!(state.prunable_index(), 1);
    }

    #[test]
    fn reopen_resumes_after_checkpoint() {
        let dir = TempDir::new().unwrap();
        let owner = MemberId::new();
        {
            let state = open(dir.path());
            state
                .apply_committed(&LogEntry::new(1, 1, alloc(owner, 0)))
                .unwrap();
            state.flush(1).unwrap();
            state
                .apply_committed(&LogEntry::new(2, 1, alloc(owner, 10)))
                .unwrap();
        }
        let state = open(dir.path());
        assert_eq!(state.last_applied_index(), 1);
        state
            .apply_committed(&LogEntry::new(2, 1, alloc(owner, 10)))
            .unwrap();
        let ids: IdAllocationState = state
            .build_snapshot()
            .unwrap()
            .get_state(StateType::IdAllocation)
            .unwrap();
        assert_eq!(ids.first_unallocated(IdType::Node), 20);
    }

    #[test]
    fn snapshot_install_reproduces_state() {
        let source_dir = TempDir::new().unwrap();
        let target_dir = TempDir::new().unwrap();
        let source = open(source_dir.path());
        let owner = MemberId::new();
        let session = GlobalSession::new(owner);

        let contents = [
            alloc(owner, 0),
            ReplicatedContent::Transaction(ReplicatedTransaction { tx: b"tx".to_vec() }),
            alloc(owner, 10).in_session(session, LocalOperationId::new(1, 1)),
        ];
        for (i, content) in contents.into_iter().enumerate() {
            source
                .apply_committed(&LogEntry::new(i as u64 + 1, 4, content))
                .unwrap();
        }

        let snapshot = source.build_snapshot().unwrap();
        assert_eq!(snapshot.position(), LogPosition::new(3, 4));

        let target = open(target_dir.path());
        target.install_snapshot(&snapshot).unwrap();
        assert_eq!(target.last_applied_index(), 3);
        assert_eq!(target.last_flushed_index(), 3);
        assert_eq!(
            target.build_snapshot().unwrap().to_bytes().unwrap(),
            snapshot.to_bytes().unwrap()
        );
    }

    #[test]
    fn incomplete_snapshot_is_refused_untouched() {
        let owner = MemberId::new();
        let source_dir = TempDir::new().unwrap();
        let source = open(source_dir.path());
        for i in 0..10 {
            source
                .apply_committed(&LogEntry::new(i + 1, 1, alloc(owner, i * 10)))
                .unwrap();
        }
        let full = source.build_snapshot().unwrap();
        let mut partial = CoreSnapshot::new(full.prev_index(), full.prev_term());
        partial.add(
            StateType::IdAllocation,
            full.get(StateType::IdAllocation).unwrap().to_vec(),
        );

        let dir = TempDir::new().unwrap();
        let state = open(dir.path());
        state
            .apply_committed(&LogEntry::new(1, 1, alloc(owner, 0)))
            .unwrap();

        assert!(matches!(
            state.install_snapshot(&partial),
            Err(ClusterError::MissingSnapshotState(_))
        ));
        assert!(!state.is_failed());
        assert_eq!(state.last_applied_index(), 1);

        // Unreadable data is refused the same way.
        let mut garbled = full.clone();
        garbled.add(StateType::SessionTracker, b"not json".to_vec());
        assert!(state.install_snapshot(&garbled).is_err());
        assert!(!state.is_failed());

        // The next entry still applies against the old state.
        assert_eq!(
            state
                .apply_committed(&LogEntry::new(2, 1, alloc(owner, 10)))
                .unwrap(),
            ApplyResult::Accepted
        );
        let ids: IdAllocationState = state
            .build_snapshot()
            .unwrap()
            .get_state(StateType::IdAllocation)
            .unwrap();
        assert_eq!(ids.first_unallocated(IdType::Node), 20);
    }

    struct UnwritableInstall;

    impl StateMachine for UnwritableInstall {
        fn state_type(&self) -> StateType {
            StateType::LockToken
        }
        fn apply(&mut self, _: u64, _: &ReplicatedContent) -> ClusterResult<ApplyResult> {
            Ok(ApplyResult::Ignored)
        }
        fn last_applied_index(&self) -> u64 {
            0
        }
        fn flush(&mut self, _: u64) -> ClusterResult<()> {
            Ok(())
        }
        fn snapshot(&self, _: u64) -> ClusterResult<Option<Vec<u8>>> {
            Ok(None)
        }
        fn install_snapshot(&mut self, _: u64, _: Option<&[u8]>) -> ClusterResult<()> {
            Err(std::io::Error::other("disk full").into())
        }
    }

    #[test]
    fn failed_install_stops_replica() {
        let mut dispatcher = CommandDispatcher::new();
        dispatcher.register(Box::new(UnwritableInstall));
        let sessions = SessionTracker::new(
            Box::new(InMemoryStateStorage::new(SessionTrackerState::default())),
            10,
        );
        let state = CoreState::new(
            dispatcher,
            sessions,
            Box::new(InMemoryStateStorage::new(LogPosition::ZERO)),
        );

        let mut snapshot = CoreSnapshot::new(5, 1);
        snapshot.add(
            StateType::SessionTracker,
            serde_json::to_vec(&SessionTrackerState::default()).unwrap(),
        );
        assert!(state.install_snapshot(&snapshot).is_err());
        assert!(state.is_failed());
        assert!(matches!(
            state.apply_committed(&LogEntry::new(1, 1, ReplicatedContent::NewLeaderBarrier)),
            Err(ClusterError::ReplicaFailed { .. })
        ));
    }
}
