//! The single apply path.
//!
//! The Raft core reports commit progress; this process replays the newly
//! committed entries from the log into the core state, checkpoints it
//! periodically and prunes the log behind the checkpoint.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use super::core_state::CoreState;
use crate::config::StateConfig;
use crate::error::ClusterResult;
use crate::raft::SegmentedRaftLog;

/// Applies committed entries strictly in order, one batch at a time.
pub struct ApplicationProcess {
    log: SegmentedRaftLog,
    state: Arc<CoreState>,
    flush_every: u64,
    commit_index: AtomicU64,
    apply_path: Mutex<()>,
}

impl ApplicationProcess {
    /// Create over `log` and `state`.
    pub fn new(log: SegmentedRaftLog, state: Arc<CoreState>, config: &StateConfig) -> Self {
        Self {
            log,
            state,
            flush_every: config.flush_every.max(1),
            commit_index: AtomicU64::new(0),
            apply_path: Mutex::new(()),
        }
    }

    /// Record that the log is committed through `commit_index` and apply
    /// everything up to it that is present locally.
    ///
    /// Concurrent callers serialize on the apply path; a caller that arrives
    /// while another batch runs applies whatever is left once it gets in.
    /// Returns the applied index.
    pub fn notify_commit(&self, commit_index: u64) -> ClusterResult<u64> {
        self.commit_index.fetch_max(commit_index, Ordering::AcqRel);
        let _apply = self.apply_path.lock();

        let target = self
            .commit_index
            .load(Ordering::Acquire)
            .min(self.log.append_index());
        let mut applied = self.state.last_applied_index();
        if target <= applied {
            return Ok(applied);
        }

        let start = applied;
        let mut unflushed = applied.saturating_sub(self.state.last_flushed_index());
        let mut cursor = self.log.reader(applied + 1)?;
        while applied < target {
            let entry = match cursor.next() {
                Some(entry) => entry?,
                None => break,
            };
            self.state.apply_committed(&entry)?;
            applied = entry.index;
            unflushed += 1;
            if unflushed >= self.flush_every {
                self.checkpoint(applied)?;
                unflushed = 0;
            }
        }
        drop(cursor);

        if unflushed > 0 {
            self.checkpoint(applied)?;
        }
        tracing::debug!(from = start + 1, to = applied, "Applied committed entries");
        Ok(applied)
    }

    /// Highest commit index reported so far.
    pub fn commit_index(&self) -> u64 {
        self.commit_index.load(Ordering::Acquire)
    }

    /// Checkpoint at the current applied index, e.g. before shutdown.
    pub fn flush(&self) -> ClusterResult<()> {
        let _apply = self.apply_path.lock();
        let applied = self.state.last_applied_index();
        if applied > self.state.last_flushed_index() {
            self.checkpoint(applied)?;
        }
        Ok(())
    }

    /// Hold the apply path for the duration of `f`.
    ///
    /// Used when state is replaced wholesale, e.g. by a snapshot install, so
    /// no batch replays into it half way.
    pub fn exclusive<R>(&self, f: impl FnOnce() -> R) -> R {
        let _apply = self.apply_path.lock();
        f()
    }

    fn checkpoint(&self, applied: u64) -> ClusterResult<()> {
        self.state.flush(applied)?;
        self.log.prune_by_strategy(self.state.prunable_index())?;
        Ok(())
    }
}

impl std::fmt::Debug for ApplicationProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApplicationProcess")
            .field("commit_index", &self.commit_index())
            .field("flush_every", &self.flush_every)
            .finish()
    }
}
