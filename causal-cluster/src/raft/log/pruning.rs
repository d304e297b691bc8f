//! How much log to retain when pruning.

use serde::{Deserialize, Serialize};

/// Retention policy applied on top of the safe prune index.
///
/// Whatever the strategy, nothing at or above the safe index is removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PruningStrategy {
    /// Never prune.
    KeepAll,
    /// Prune everything that is safe to prune.
    KeepNone,
    /// Keep at least this many of the most recent entries.
    KeepEntries(u64),
    /// Keep at least this many bytes of the most recent segments.
    KeepBytes(u64),
}

impl Default for PruningStrategy {
    fn default() -> Self {
        // 256MB of history for lagging followers
        PruningStrategy::KeepBytes(256 * 1024 * 1024)
    }
}

impl PruningStrategy {
    /// Lowest index this strategy wants retained, or `None` to retain
    /// everything.
    ///
    /// `segments` lists `(first_index, size_in_bytes)` oldest first.
    pub fn retain_from(&self, append_index: u64, segments: &[(u64, u64)]) -> Option<u64> {
        match *self {
            PruningStrategy::KeepAll => None,
            PruningStrategy::KeepNone => Some(append_index + 1),
            PruningStrategy::KeepEntries(n) => Some((append_index + 1).saturating_sub(n)),
            PruningStrategy::KeepBytes(limit) => {
                let mut kept = 0u64;
                for &(first_index, size) in segments.iter().rev() {
                    kept += size;
                    if kept >= limit {
                        return Some(first_index);
                    }
                }
                None
            }
        }
    }
}
