//! Client session de-duplication.
//!
//! Clients tag each command with a global session and a per-local-session
//! sequence number. Retries and at-least-once delivery can put the same
//! operation in the log more than once; only the first occurrence may mutate
//! state. Sessions are evicted least-recently-used once the configured bound
//! is exceeded, with recency measured in log indices so every replica evicts
//! identically.

use causal_core::MemberId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use uuid::Uuid;

use super::machine::{AppliedState, PersistentState, StateType};
use super::storage::{DurableStateStorage, StateStorage};
use crate::command::{GlobalSession, LocalOperationId};
use crate::error::ClusterResult;

/// Verdict for one session operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionCheck {
    /// First time this operation is seen; apply it.
    Accept,
    /// Seen before; skip the mutation.
    Duplicate,
}

/// Per global session bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackedSession {
    /// Member that owns the session.
    pub owner: MemberId,
    /// Last accepted sequence number per local session.
    pub last_sequence: BTreeMap<u64, u64>,
    /// Log index of the most recent operation.
    pub last_touched: u64,
}

/// Serialized session table.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionTrackerState {
    /// Sessions by global session id.
    pub sessions: BTreeMap<Uuid, TrackedSession>,
    /// Highest applied log index.
    pub last_applied: u64,
}

impl AppliedState for SessionTrackerState {
    fn last_applied(&self) -> u64 {
        self.last_applied
    }

    fn set_last_applied(&mut self, index: u64) {
        self.last_applied = index;
    }
}

/// Tracks client sessions to make command application idempotent.
pub struct SessionTracker {
    inner: PersistentState<SessionTrackerState>,
    max_sessions: usize,
}

impl SessionTracker {
    /// Create over the given storage, tracking at most `max_sessions`.
    pub fn new(storage: Box<dyn StateStorage<SessionTrackerState>>, max_sessions: usize) -> Self {
        Self {
            inner: PersistentState::new(StateType::SessionTracker, storage),
            max_sessions: max_sessions.max(1),
        }
    }

    /// Create over `dir/session-tracker.state`.
    pub fn open(dir: &Path, max_sessions: usize) -> ClusterResult<Self> {
        let storage =
            DurableStateStorage::open(dir, "session-tracker", SessionTrackerState::default())?;
        Ok(Self::new(Box::new(storage), max_sessions))
    }

    /// Current session table.
    pub fn state(&self) -> &SessionTrackerState {
        self.inner.get()
    }

    /// Check the operation committed at `index` and record it if new.
    ///
    /// The applied index advances either way. An index already applied
    /// before a restart is reported as a duplicate without touching state.
    pub fn validate_and_record(
        &mut self,
        index: u64,
        session: &GlobalSession,
        operation: &LocalOperationId,
    ) -> SessionCheck {
        if self.inner.already_applied(index) {
            return SessionCheck::Duplicate;
        }

        let max_sessions = self.max_sessions;
        let check = self.inner.update(index, |state| {
            let tracked = state
                .sessions
                .entry(session.session_id)
                .or_insert_with(|| TrackedSession {
                    owner: session.owner,
                    last_sequence: BTreeMap::new(),
                    last_touched: index,
                });
            if tracked.owner != session.owner {
                // Same id reused by another member: a different session.
                tracked.owner = session.owner;
                tracked.last_sequence.clear();
            }
            tracked.last_touched = index;

            let check = match tracked.last_sequence.get(&operation.local_session_id) {
                Some(&last) if operation.sequence_number <= last => SessionCheck::Duplicate,
                _ => {
                    tracked
                        .last_sequence
                        .insert(operation.local_session_id, operation.sequence_number);
                    SessionCheck::Accept
                }
            };

            while state.sessions.len() > max_sessions {
                let oldest = state
                    .sessions
                    .iter()
                    .min_by_key(|(id, s)| (s.last_touched, **id))
                    .map(|(id, _)| *id);
                match oldest {
                    Some(id) => {
                        state.sessions.remove(&id);
                        tracing::debug!(session = %id, "Evicted least recently used session");
                    }
                    None => break,
                }
            }

            check
        });

        if check == SessionCheck::Duplicate {
            tracing::debug!(
                index,
                session = %session.session_id,
                local_session = operation.local_session_id,
                sequence = operation.sequence_number,
                "Duplicate session operation"
            );
        }
        check
    }

    /// Highest applied log index.
    pub fn last_applied_index(&self) -> u64 {
        self.inner.get().last_applied
    }

    /// Advance to `applied_through` and persist.
    pub fn flush(&mut self, applied_through: u64) -> ClusterResult<()> {
        self.inner.flush(applied_through)
    }

    /// Serialized session table as of `applied_through`.
    pub fn snapshot(&self, applied_through: u64) -> ClusterResult<Vec<u8>> {
        self.inner.snapshot(applied_through)
    }

    /// Verify that `data` decodes to a session table.
    pub fn check_snapshot(&self, data: Option<&[u8]>) -> ClusterResult<()> {
        self.inner.decode(data).map(drop)
    }

    /// Replace the session table with a snapshot taken at `index`.
    pub fn install_snapshot(&mut self, index: u64, data: Option<&[u8]>) -> ClusterResult<()> {
        self.inner.install(index, data)
    }
}
