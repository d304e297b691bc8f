//! Lazy, restartable readers over the log.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use super::inner::LogInner;
use crate::error::{ClusterError, ClusterResult};
use crate::types::LogEntry;

/// Iterator over log entries from a starting index up to the tail as of each
/// call to `next`.
///
/// Every step borrows a pooled handle only for the duration of one read. The
/// cursor's position is registered with the log so pruning never removes a
/// segment it may still need.
pub struct LogCursor {
    inner: Arc<LogInner>,
    next: u64,
    position: Arc<AtomicU64>,
}

impl LogCursor {
    pub(super) fn new(inner: Arc<LogInner>, next: u64, position: Arc<AtomicU64>) -> Self {
        Self {
            inner,
            next,
            position,
        }
    }

    /// Index the next call to `next` returns.
    pub fn position(&self) -> u64 {
        self.next
    }

    /// Restart from `index`.
    pub fn seek(&mut self, index: u64) {
        self.next = index;
        self.position.store(index, Ordering::Release);
    }

    fn read_next(&mut self) -> ClusterResult<Option<LogEntry>> {
        let index = self.next;
        loop {
            let (ordinal, path, location, epoch) = {
                let state = self.inner.state.read();
                if index <= state.prev_index() {
                    return Err(ClusterError::Pruned {
                        requested: index,
                        first_available: state.prev_index() + 1,
                    });
                }
                if index > state.append_index() {
                    return Ok(None);
                }
                let Some((pos, location)) = state.locate(index) else {
                    return Err(ClusterError::corruption(
                        &self.inner.dir,
                        format!("index {index} inside log bounds but not in any segment"),
                    ));
                };
                let segment = &state.segments[pos];
                (
                    segment.header.ordinal,
                    segment.path.clone(),
                    location,
                    state.epoch,
                )
            };

            // The state lock is released while waiting for a handle and
            // reading, so appends and pruning are not held up.
            let read = self
                .inner
                .pool
                .acquire(ordinal, &path)
                .and_then(|mut reader| reader.read_at(location.offset));

            let state = self.inner.state.read();
            if state.epoch != epoch {
                // Truncated or skipped underneath us; look the index up again.
                continue;
            }
            let entry = match read {
                Ok(entry) => entry,
                Err(_) if index <= state.prev_index() => {
                    return Err(ClusterError::Pruned {
                        requested: index,
                        first_available: state.prev_index() + 1,
                    });
                }
                Err(e) => return Err(e),
            };
            drop(state);

            if entry.term != location.term {
                return Err(ClusterError::corruption(
                    path,
                    format!(
                        "entry {index} has term {} but was indexed with term {}",
                        entry.term, location.term
                    ),
                ));
            }

            self.next = index + 1;
            self.position.store(self.next, Ordering::Release);
            return Ok(Some(LogEntry {
                index,
                term: entry.term,
                content: entry.content,
            }));
        }
    }
}

impl Iterator for LogCursor {
    type Item = ClusterResult<LogEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        self.read_next().transpose()
    }
}

impl std::fmt::Debug for LogCursor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogCursor").field("next", &self.next).finish()
    }
}
