//! Raft log storage.
//!
//! Leader election and replication are driven by an external raft core; this
//! module persists the entries it hands over and serves them back to the
//! apply path and to catch-up readers.

pub mod log;

pub use log::{LogCursor, PruningStrategy, SegmentedRaftLog};
