//! Segmented, persistent raft log.
//!
//! Entries live in a strictly ordered sequence of segment files named by
//! increasing ordinal. Appends go to the last segment and rotate to a fresh
//! one once it reaches the configured size; each new segment's header records
//! the index and term of the entry preceding it, so the chain can be verified
//! on recovery. Old segments are deleted whole once no consumer needs them.
//!
//! # Locking
//!
//! `writer` serializes appends and structural changes. The `state` lock is
//! held only to publish or look up segment metadata; file reads and writes
//! happen outside it. When both are taken, `writer` comes first.

mod cursor;
mod entries;
mod header;
mod inner;
mod pruning;
mod reader;
mod segment;

pub use cursor::LogCursor;
pub use entries::{encoded_len, FRAME_OVERHEAD};
pub use header::{SegmentHeader, FORMAT_VERSION, HEADER_SIZE};
pub use pruning::PruningStrategy;
pub use reader::{PooledReader, ReaderPool};
pub use segment::{EntryLocation, Segment};

use causal_core::IndexTracker;
use parking_lot::{Mutex, RwLock};
use std::collections::VecDeque;
use std::fs;
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::command::ReplicatedContent;
use crate::config::RaftLogConfig;
use crate::error::{ClusterError, ClusterResult};
use crate::types::{LogEntry, RaftLogEntry};
use entries::encode_entry;
use inner::{ActiveWriter, LogInner, LogState};

/// Durable, rotating, prunable log of raft entries.
///
/// Cheap to clone; clones share the same files and state.
#[derive(Clone)]
pub struct SegmentedRaftLog {
    inner: Arc<LogInner>,
}

impl SegmentedRaftLog {
    /// Open the log in `dir`, recovering any existing segments.
    ///
    /// A torn write at the very end of the log is cut off. Any other checksum,
    /// header or chaining mismatch is corruption and the log refuses to open.
    pub fn open(dir: impl Into<PathBuf>, config: RaftLogConfig) -> ClusterResult<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        remove_temp_files(&dir)?;

        let listed = Segment::list(&dir)?;
        let count = listed.len();
        let mut segments: VecDeque<Segment> = VecDeque::with_capacity(count.max(1));

        for (i, (ordinal, path)) in listed.iter().enumerate() {
            let segment = Segment::recover(path, *ordinal, i + 1 == count)?;

            if let Some(prev) = segments.back() {
                let header = &segment.header;
                if header.prev_index > prev.last_index() {
                    // A skip past a snapshot was interrupted before the
                    // superseded segments were deleted.
                    tracing::warn!(
                        ordinal = header.ordinal,
                        prev_index = header.prev_index,
                        discarded = segments.len(),
                        "Completing interrupted log skip"
                    );
                    for old in segments.drain(..) {
                        old.delete()?;
                    }
                } else if header.prev_index != prev.last_index()
                    || header.prev_term != prev.last_term()
                {
                    return Err(ClusterError::corruption(
                        path,
                        format!(
                            "header expects previous entry {}@{} but segment {} ends at {}@{}",
                            header.prev_index,
                            header.prev_term,
                            prev.header.ordinal,
                            prev.last_index(),
                            prev.last_term()
                        ),
                    ));
                }
            }

            segments.push_back(segment);
        }

        if segments.is_empty() {
            segments.push_back(Segment::create(&dir, SegmentHeader::new(1, 0, 0))?);
        }

        let active = segments
            .back()
            .ok_or_else(|| ClusterError::corruption(&dir, "log has no segments"))?;
        let writer = ActiveWriter {
            ordinal: active.header.ordinal,
            file: active.open_for_append()?,
        };
        let next_ordinal = active.header.ordinal + 1;

        let state = LogState {
            segments,
            epoch: 0,
            next_ordinal,
        };

        tracing::info!(
            dir = %dir.display(),
            segments = state.segments.len(),
            prev_index = state.prev_index(),
            append_index = state.append_index(),
            "Opened raft log"
        );

        let pool = ReaderPool::new(config.reader_pool_size, config.reader_acquire_timeout());
        Ok(Self {
            inner: Arc::new(LogInner {
                dir,
                config,
                state: RwLock::new(state),
                writer: Mutex::new(writer),
                pool,
                cursors: Mutex::new(Vec::new()),
                failed: AtomicBool::new(false),
            }),
        })
    }

    /// Directory holding the segment files.
    pub fn dir(&self) -> &Path {
        &self.inner.dir
    }

    /// Append entries, returning the index of the last one.
    ///
    /// Transient I/O failures are retried with backoff. If retries run out the
    /// partial write is rolled back, the log is marked failed and every later
    /// append fails with [`ClusterError::LogFailed`].
    pub fn append(&self, entries: &[RaftLogEntry]) -> ClusterResult<u64> {
        let mut writer = self.inner.writer.lock();
        if self.inner.failed.load(Ordering::Acquire) {
            return Err(ClusterError::LogFailed);
        }

        let (mut size, mut index) = {
            let state = self.inner.state.read();
            let active = state
                .active()
                .ok_or_else(|| ClusterError::corruption(&self.inner.dir, "log has no segments"))?;
            (active.size, state.append_index())
        };
        if entries.is_empty() {
            return Ok(index);
        }

        let rotate_at = self.inner.config.rotate_at_size;
        let mut buf = Vec::new();
        let mut locations = Vec::new();

        for entry in entries {
            let offset = size + buf.len() as u64;
            encode_entry(entry, &mut buf)?;
            locations.push(EntryLocation {
                offset,
                term: entry.term,
            });
            index += 1;

            if size + buf.len() as u64 >= rotate_at {
                self.write_batch(&mut writer, &buf, &mut locations, size)?;
                self.rotate(&mut writer)?;
                size = HEADER_SIZE as u64;
                buf.clear();
            }
        }

        if !buf.is_empty() {
            self.write_batch(&mut writer, &buf, &mut locations, size)?;
        }

        tracing::trace!(append_index = index, count = entries.len(), "Appended entries");
        Ok(index)
    }

    /// Append a single entry.
    pub fn append_entry(&self, term: u64, content: ReplicatedContent) -> ClusterResult<u64> {
        self.append(&[RaftLogEntry::new(term, content)])
    }

    fn write_batch(
        &self,
        writer: &mut ActiveWriter,
        buf: &[u8],
        locations: &mut Vec<EntryLocation>,
        start_size: u64,
    ) -> ClusterResult<()> {
        let sync = self.inner.config.sync_on_append;
        let result = self.inner.config.append_retry.run(
            |attempt| {
                if attempt > 1 {
                    writer.file.set_len(start_size)?;
                    writer.file.seek(SeekFrom::Start(start_size))?;
                }
                writer.file.write_all(buf)?;
                if sync {
                    writer.file.sync_data()?;
                }
                Ok::<(), std::io::Error>(())
            },
            |_| true,
        );

        if let Err(exhausted) = result {
            if let Err(e) = writer.file.set_len(start_size) {
                tracing::error!(error = %e, "Failed to roll back partial append");
            }
            self.inner.failed.store(true, Ordering::Release);
            tracing::error!(
                ordinal = writer.ordinal,
                attempts = exhausted.attempts,
                error = %exhausted.last,
                "Append failed permanently, log marked failed"
            );
            return Err(ClusterError::AppendFailed {
                attempts: exhausted.attempts,
                source: exhausted.last,
            });
        }

        let mut state = self.inner.state.write();
        let active = state
            .segments
            .back_mut()
            .ok_or_else(|| ClusterError::corruption(&self.inner.dir, "log has no segments"))?;
        active.entries.append(locations);
        active.size = start_size + buf.len() as u64;
        Ok(())
    }

    fn rotate(&self, writer: &mut ActiveWriter) -> ClusterResult<()> {
        writer.file.sync_all()?;

        let (ordinal, prev_index, prev_term) = {
            let state = self.inner.state.read();
            (state.next_ordinal, state.append_index(), state.last_term())
        };

        let segment = Segment::create(
            &self.inner.dir,
            SegmentHeader::new(ordinal, prev_index, prev_term),
        )?;
        let file = segment.open_for_append()?;

        {
            let mut state = self.inner.state.write();
            state.segments.push_back(segment);
            state.next_ordinal = ordinal + 1;
        }
        *writer = ActiveWriter { ordinal, file };

        tracing::info!(ordinal, prev_index, prev_term, "Rotated to new segment");
        Ok(())
    }

    /// Open a cursor starting at `from`; `0` means the first available entry.
    pub fn reader(&self, from: u64) -> ClusterResult<LogCursor> {
        let state = self.inner.state.read();
        let first_available = state.prev_index() + 1;
        let from = if from == 0 { first_available } else { from };
        if from < first_available {
            return Err(ClusterError::Pruned {
                requested: from,
                first_available,
            });
        }
        // Registered under the state lock so a concurrent prune sees it.
        let position = self.inner.register_cursor(from);
        drop(state);
        Ok(LogCursor::new(Arc::clone(&self.inner), from, position))
    }

    /// Read a single entry.
    pub fn read_entry(&self, index: u64) -> ClusterResult<Option<LogEntry>> {
        self.reader(index)?.next().transpose()
    }

    /// Read up to `max` entries starting at `from`.
    pub fn read_range(&self, from: u64, max: usize) -> ClusterResult<Vec<LogEntry>> {
        self.reader(from)?.take(max).collect()
    }

    /// Remove every entry at or after `from`.
    ///
    /// Used when a new leader's entries conflict with ours. Truncating past
    /// the tail is a no-op; truncating into pruned history is rejected.
    pub fn truncate(&self, from: u64) -> ClusterResult<()> {
        let mut writer = self.inner.writer.lock();
        let mut state = self.inner.state.write();

        let prev_index = state.prev_index();
        let append_index = state.append_index();
        if from > append_index {
            return Ok(());
        }
        if from <= prev_index {
            return Err(ClusterError::InvalidTruncation {
                from,
                prev_index,
                append_index,
            });
        }

        // Newest first, so a crash part way leaves a valid chain.
        let mut removed = Vec::new();
        while state.segments.len() > 1
            && state
                .segments
                .back()
                .is_some_and(|s| s.first_index() >= from)
        {
            if let Some(segment) = state.segments.pop_back() {
                segment.delete()?;
                removed.push(segment.header.ordinal);
            }
        }

        let active = state
            .segments
            .back_mut()
            .ok_or_else(|| ClusterError::corruption(&self.inner.dir, "log has no segments"))?;
        active.truncate_from(from)?;
        *writer = ActiveWriter {
            ordinal: active.header.ordinal,
            file: active.open_for_append()?,
        };
        state.epoch += 1;
        drop(state);

        self.inner.pool.retire(removed.iter().copied());
        tracing::warn!(
            from,
            previous_append_index = append_index,
            removed_segments = removed.len(),
            "Truncated raft log"
        );
        Ok(())
    }

    /// Delete whole segments whose entries all lie below `up_to`.
    ///
    /// The limit is lowered to the position of the slowest open cursor, and
    /// the active segment is never deleted. Returns the new `prev_index`.
    pub fn prune(&self, up_to: u64) -> ClusterResult<u64> {
        let mut state = self.inner.state.write();

        let limit = match self.inner.min_cursor_position() {
            Some(cursor) => up_to.min(cursor),
            None => up_to,
        };

        let mut removed = 0usize;
        while state.segments.len() > 1
            && state.segments.front().is_some_and(|s| s.last_index() < limit)
        {
            let Some(segment) = state.segments.pop_front() else {
                break;
            };
            if let Err(e) = segment.delete() {
                state.segments.push_front(segment);
                return Err(e);
            }
            removed += 1;
        }

        let prev_index = state.prev_index();
        if removed > 0 {
            if let Some(first) = state.segments.front() {
                self.inner.pool.retire_below(first.header.ordinal);
            }
            tracing::info!(
                up_to,
                limit,
                removed_segments = removed,
                prev_index,
                "Pruned raft log"
            );
        }
        Ok(prev_index)
    }

    /// Prune according to the configured strategy, never at or above
    /// `safe_index`. Returns the new `prev_index`.
    pub fn prune_by_strategy(&self, safe_index: u64) -> ClusterResult<u64> {
        let retain_from = {
            let state = self.inner.state.read();
            let sizes: Vec<(u64, u64)> = state
                .segments
                .iter()
                .map(|s| (s.first_index(), s.size))
                .collect();
            self.inner
                .config
                .pruning
                .retain_from(state.append_index(), &sizes)
        };

        match retain_from {
            Some(index) => self.prune(index.min(safe_index)),
            None => Ok(self.prev_index()),
        }
    }

    /// Move the log past `index`, discarding everything before it.
    ///
    /// Used after installing a snapshot taken at `(index, term)`. If the log
    /// already reaches `index` this is a no-op. Returns the new append index.
    pub fn skip(&self, index: u64, term: u64) -> ClusterResult<u64> {
        let mut writer = self.inner.writer.lock();
        let mut state = self.inner.state.write();

        let append_index = state.append_index();
        if index <= append_index {
            return Ok(append_index);
        }

        let ordinal = state.next_ordinal;
        let segment = Segment::create(&self.inner.dir, SegmentHeader::new(ordinal, index, term))?;
        let file = segment.open_for_append()?;

        let old: Vec<Segment> = state.segments.drain(..).collect();
        state.segments.push_back(segment);
        state.next_ordinal = ordinal + 1;
        state.epoch += 1;
        *writer = ActiveWriter { ordinal, file };
        drop(state);

        for segment in &old {
            segment.delete()?;
        }
        self.inner
            .pool
            .retire(old.iter().map(|s| s.header.ordinal));

        tracing::info!(index, term, discarded_segments = old.len(), "Skipped raft log");
        Ok(index)
    }

    /// Index of the last appended entry.
    pub fn append_index(&self) -> u64 {
        self.inner.state.read().append_index()
    }

    /// Index preceding the first entry still held.
    pub fn prev_index(&self) -> u64 {
        self.inner.state.read().prev_index()
    }

    /// Term of the last appended entry.
    pub fn last_term(&self) -> u64 {
        self.inner.state.read().last_term()
    }

    /// Term of the entry at `index`, if it is still held.
    pub fn term_at(&self, index: u64) -> Option<u64> {
        self.inner.state.read().term_at(index)
    }

    /// Number of segment files.
    pub fn segment_count(&self) -> usize {
        self.inner.state.read().segments.len()
    }

    /// Whether an append has failed permanently.
    pub fn is_failed(&self) -> bool {
        self.inner.failed.load(Ordering::Acquire)
    }

    /// The reader pool.
    pub fn reader_pool(&self) -> &ReaderPool {
        &self.inner.pool
    }
}

impl IndexTracker for SegmentedRaftLog {
    fn current_index(&self) -> u64 {
        self.append_index()
    }
}

impl std::fmt::Debug for SegmentedRaftLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.read();
        f.debug_struct("SegmentedRaftLog")
            .field("dir", &self.inner.dir)
            .field("segments", &state.segments.len())
            .field("prev_index", &state.prev_index())
            .field("append_index", &state.append_index())
            .finish()
    }
}

fn remove_temp_files(dir: &Path) -> ClusterResult<()> {
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.extension().is_some_and(|ext| ext == "tmp") {
            tracing::debug!(path = %path.display(), "Removing leftover temp file");
            fs::remove_file(&path)?;
        }
    }
    Ok(())
}
