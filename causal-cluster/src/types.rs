//! Log entry types.

use crate::command::ReplicatedContent;
use serde::{Deserialize, Serialize};

/// An entry as handed to the log for appending; the log assigns its index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RaftLogEntry {
    /// Term the entry was created in.
    pub term: u64,
    /// Replicated command.
    pub content: ReplicatedContent,
}

impl RaftLogEntry {
    /// Build an entry.
    pub fn new(term: u64, content: ReplicatedContent) -> Self {
        Self { term, content }
    }
}

/// A committed, indexed log entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    /// Position in the log; contiguous and strictly increasing.
    pub index: u64,
    /// Term the entry was created in.
    pub term: u64,
    /// Replicated command.
    pub content: ReplicatedContent,
}

impl LogEntry {
    /// Build an entry.
    pub fn new(index: u64, term: u64, content: ReplicatedContent) -> Self {
        Self {
            index,
            term,
            content,
        }
    }

    /// Drop the index.
    pub fn into_raft_entry(self) -> RaftLogEntry {
        RaftLogEntry {
            term: self.term,
            content: self.content,
        }
    }
}
