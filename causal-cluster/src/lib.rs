//! Replicated-state-machine core for causal clustering.
//!
//! This crate holds everything between a Raft core that decides what is
//! committed and the local store that holds the data: the segmented raft
//! log, the state machines fed from it, snapshots for bootstrapping and
//! resynchronizing members, and the catch-up protocol that brings lagging
//! members current.
//!
//! # Architecture
//!
//! ```text
//!            Raft core (external)
//!         append │        │ commit index
//!                ▼        ▼
//!   ┌──────────────────────────────────────────────┐
//!   │ CoreReplica                                  │
//!   │  ┌────────────────┐   ┌────────────────────┐ │
//!   │  │ SegmentedRaft- │──►│ ApplicationProcess │ │
//!   │  │ Log            │   └─────────┬──────────┘ │
//!   │  └───────▲────────┘             ▼            │
//!   │          │ prune      ┌────────────────────┐ │
//!   │          └────────────│ CoreState          │ │
//!   │                       │  SessionTracker    │ │
//!   │                       │  CommandDispatcher │ │
//!   │                       │   └ StateMachines  │ │
//!   │                       └────────────────────┘ │
//!   └───────────┬──────────────────────▲───────────┘
//!               │ CatchupServer        │ CatchupProcess
//!               ▼                      │
//!        lagging members         healthy member
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use causal_cluster::{ClusterConfig, CoreReplica, MemoryDatabase};
//!
//! let config = ClusterConfig::builder().data_dir("/var/lib/causal").build()?;
//! let replica = Arc::new(CoreReplica::open(config, Arc::new(MemoryDatabase::new(store_id)))?);
//!
//! // Seed a new cluster from the local store
//! replica.bootstrap(&MemberSet::new(members))?;
//!
//! // Fed by the Raft core
//! replica.append_entry(term, content)?;
//! replica.notify_commit(commit_index)?;
//!
//! // Serve lagging members
//! let server = replica.serve_catchup().await?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod catchup;
pub mod command;
pub mod config;
pub mod error;
pub mod raft;
pub mod replica;
pub mod state;
pub mod store;
pub mod types;

pub use catchup::{CatchupClient, CatchupOutcome, CatchupProcess, CatchupServer, CatchupState};
pub use command::{MemberSet, ReplicatedContent};
pub use config::ClusterConfig;
pub use error::{ClusterError, ClusterResult, RejectionKind};
pub use raft::{PruningStrategy, SegmentedRaftLog};
pub use replica::CoreReplica;
pub use state::{CoreBootstrapper, CoreSnapshot, CoreState, StateType};
pub use store::{LocalDatabase, MemoryDatabase};
pub use types::{LogEntry, RaftLogEntry};
