//! Bounded pool of segment read handles.
//!
//! Handles are cached per segment ordinal and lent to one reader at a time.
//! When every handle is lent out, acquirers wait on a condvar up to the
//! configured timeout. Leases return their handle on drop, including on error
//! paths.

use parking_lot::{Condvar, Mutex};
use std::collections::BTreeSet;
use std::fs::File;
use std::io::{BufReader, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::entries::{read_entry, ReadOutcome};
use crate::error::{ClusterError, ClusterResult};
use crate::types::RaftLogEntry;

struct PoolState {
    /// Cached handles not currently lent, oldest first.
    idle: Vec<(u64, File)>,
    leased: usize,
    /// Ordinals below this belong to pruned segments.
    retired_below: u64,
    /// Individually retired ordinals at or above `retired_below`.
    retired: BTreeSet<u64>,
}

impl PoolState {
    fn is_retired(&self, ordinal: u64) -> bool {
        ordinal < self.retired_below || self.retired.contains(&ordinal)
    }
}

struct PoolShared {
    capacity: usize,
    acquire_timeout: Duration,
    state: Mutex<PoolState>,
    released: Condvar,
}

/// Fixed-size pool of read handles.
#[derive(Clone)]
pub struct ReaderPool {
    shared: Arc<PoolShared>,
}

impl ReaderPool {
    /// Create a pool of `capacity` handles.
    pub fn new(capacity: usize, acquire_timeout: Duration) -> Self {
        Self {
            shared: Arc::new(PoolShared {
                capacity: capacity.max(1),
                acquire_timeout,
                state: Mutex::new(PoolState {
                    idle: Vec::new(),
                    leased: 0,
                    retired_below: 0,
                    retired: BTreeSet::new(),
                }),
                released: Condvar::new(),
            }),
        }
    }

    /// Pool capacity.
    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    /// Handles currently lent out.
    pub fn leased(&self) -> usize {
        self.shared.state.lock().leased
    }

    /// Borrow a handle for segment `ordinal`, opening `path` if none is cached.
    ///
    /// Blocks while the pool is exhausted, failing with
    /// [`ClusterError::ReaderPoolExhausted`] once the acquire timeout passes.
    pub fn acquire(&self, ordinal: u64, path: &Path) -> ClusterResult<PooledReader> {
        let shared = &self.shared;
        let start = Instant::now();
        let deadline = start + shared.acquire_timeout;
        let mut state = shared.state.lock();

        loop {
            if let Some(pos) = state.idle.iter().position(|(o, _)| *o == ordinal) {
                let (_, file) = state.idle.remove(pos);
                state.leased += 1;
                return Ok(self.lease(ordinal, path, file));
            }

            if state.leased + state.idle.len() < shared.capacity {
                state.leased += 1;
                drop(state);
                return match File::open(path) {
                    Ok(file) => Ok(self.lease(ordinal, path, file)),
                    Err(e) => {
                        let mut state = shared.state.lock();
                        state.leased -= 1;
                        shared.released.notify_one();
                        Err(e.into())
                    }
                };
            }

            if !state.idle.is_empty() {
                // Evict the least recently returned handle to make room.
                state.idle.remove(0);
                continue;
            }

            if shared.released.wait_until(&mut state, deadline).timed_out() {
                return Err(ClusterError::ReaderPoolExhausted {
                    capacity: shared.capacity,
                    waited: start.elapsed(),
                });
            }
        }
    }

    /// Drop cached handles for segments below `ordinal`.
    pub fn retire_below(&self, ordinal: u64) {
        let mut state = self.shared.state.lock();
        state.retired_below = state.retired_below.max(ordinal);
        let below = state.retired_below;
        state.retired = state.retired.split_off(&below);
        state.idle.retain(|(o, _)| *o >= below);
    }

    /// Drop cached handles for specific segments.
    pub fn retire(&self, ordinals: impl IntoIterator<Item = u64>) {
        let mut state = self.shared.state.lock();
        for ordinal in ordinals {
            if ordinal >= state.retired_below {
                state.retired.insert(ordinal);
            }
        }
        let PoolState { idle, retired, .. } = &mut *state;
        idle.retain(|(o, _)| !retired.contains(o));
    }

    fn lease(&self, ordinal: u64, path: &Path, file: File) -> PooledReader {
        PooledReader {
            pool: Arc::clone(&self.shared),
            ordinal,
            path: path.to_path_buf(),
            file: Some(file),
        }
    }
}

/// A handle borrowed from the pool.
pub struct PooledReader {
    pool: Arc<PoolShared>,
    ordinal: u64,
    path: PathBuf,
    file: Option<File>,
}

impl PooledReader {
    /// Read the entry whose frame starts at `offset`.
    pub fn read_at(&mut self, offset: u64) -> ClusterResult<RaftLogEntry> {
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| ClusterError::Task("reader handle already released".to_string()))?;
        file.seek(SeekFrom::Start(offset))?;
        let mut reader = BufReader::with_capacity(4096, file);
        match read_entry(&mut reader, &self.path)? {
            ReadOutcome::Entry(entry, _) => Ok(entry),
            ReadOutcome::End | ReadOutcome::Torn => Err(ClusterError::corruption(
                &self.path,
                format!("no complete entry at offset {offset}"),
            )),
        }
    }
}

impl Drop for PooledReader {
    fn drop(&mut self) {
        let mut state = self.pool.state.lock();
        state.leased -= 1;
        if let Some(file) = self.file.take() {
            if !state.is_retired(self.ordinal) {
                state.idle.push((self.ordinal, file));
            }
        }
        self.pool.released.notify_one();
    }
}
