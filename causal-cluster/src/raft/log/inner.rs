//! Internal log state shared between the writer, cursors and pruning.

use parking_lot::{Mutex, RwLock};
use std::collections::VecDeque;
use std::fs::File;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use super::reader::ReaderPool;
use super::segment::{EntryLocation, Segment};
use crate::config::RaftLogConfig;

/// Segment sequence and derived positions.
pub struct LogState {
    /// Segments oldest first; never empty, the last one is active.
    pub segments: VecDeque<Segment>,
    /// Bumped whenever existing entries are removed or replaced, so cursors
    /// can detect that a location they looked up went stale.
    pub epoch: u64,
    /// Ordinal the next created segment receives.
    pub next_ordinal: u64,
}

impl LogState {
    /// Index preceding the first entry still in the log.
    pub fn prev_index(&self) -> u64 {
        self.segments
            .front()
            .map(|s| s.header.prev_index)
            .unwrap_or(0)
    }

    /// Term of the entry at `prev_index`.
    pub fn prev_term(&self) -> u64 {
        self.segments
            .front()
            .map(|s| s.header.prev_term)
            .unwrap_or(0)
    }

    /// Index of the last appended entry.
    pub fn append_index(&self) -> u64 {
        self.segments.back().map(|s| s.last_index()).unwrap_or(0)
    }

    /// Term of the last appended entry.
    pub fn last_term(&self) -> u64 {
        self.segments.back().map(|s| s.last_term()).unwrap_or(0)
    }

    /// The active segment.
    pub fn active(&self) -> Option<&Segment> {
        self.segments.back()
    }

    /// Find the segment position and entry location for `index`.
    pub fn locate(&self, index: u64) -> Option<(usize, EntryLocation)> {
        // Segments are sorted by index, so search from the newest: readers
        // mostly trail the tail.
        self.segments
            .iter()
            .enumerate()
            .rev()
            .find(|(_, s)| s.contains(index))
            .and_then(|(pos, s)| s.locate(index).map(|loc| (pos, loc)))
    }

    /// Term at `index`, if known.
    pub fn term_at(&self, index: u64) -> Option<u64> {
        if index == self.prev_index() {
            return Some(self.prev_term());
        }
        self.locate(index).map(|(_, loc)| loc.term)
    }
}

/// Writer side of the log; at most one append runs at a time.
pub struct ActiveWriter {
    /// Ordinal of the segment `file` writes to.
    pub ordinal: u64,
    /// Open file positioned at the end of valid data.
    pub file: File,
}

/// Everything the log and its cursors share.
pub struct LogInner {
    /// Directory holding segment files.
    pub dir: PathBuf,
    /// Storage configuration.
    pub config: RaftLogConfig,
    /// Segment index; readers take it shared, structural changes take it
    /// exclusively. Always acquired after `writer` when both are needed.
    pub state: RwLock<LogState>,
    /// Single-writer append path.
    pub writer: Mutex<ActiveWriter>,
    /// Pooled read handles.
    pub pool: ReaderPool,
    /// Positions of open cursors.
    pub cursors: Mutex<Vec<Weak<AtomicU64>>>,
    /// Set once an append exhausts its retries.
    pub failed: AtomicBool,
}

impl LogInner {
    /// Register a cursor about to read `index`.
    pub fn register_cursor(&self, index: u64) -> Arc<AtomicU64> {
        let position = Arc::new(AtomicU64::new(index));
        let mut cursors = self.cursors.lock();
        cursors.retain(|c| c.strong_count() > 0);
        cursors.push(Arc::downgrade(&position));
        position
    }

    /// Lowest index any open cursor may still read.
    pub fn min_cursor_position(&self) -> Option<u64> {
        let mut cursors = self.cursors.lock();
        cursors.retain(|c| c.strong_count() > 0);
        cursors
            .iter()
            .filter_map(|c| c.upgrade())
            .map(|p| p.load(Ordering::Acquire))
            .min()
    }
}
