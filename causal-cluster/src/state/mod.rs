//! Replicated state: state machines, session tracking, snapshots and the
//! apply path feeding them.
//!
//! ## Module Structure
//!
//! - `machine`: the state machines and their shared persistence plumbing
//! - `dispatcher`: routes commands to machines by content type
//! - `session`: client session de-duplication
//! - `core_state`: all of the above behind one apply lock, plus flushing
//! - `snapshot`: the point-in-time aggregate exchanged between members
//! - `application`: replays committed log entries into the core state
//! - `bootstrap`: first snapshot of a new cluster
//! - `storage`: durable and in-memory state persistence

mod application;
mod bootstrap;
mod core_state;
mod dispatcher;
pub mod machine;
mod session;
mod snapshot;
mod storage;

pub use application::ApplicationProcess;
pub use bootstrap::CoreBootstrapper;
pub use core_state::CoreState;
pub use dispatcher::CommandDispatcher;
pub use machine::{ApplyResult, StateMachine, StateType};
pub use session::{SessionCheck, SessionTracker, SessionTrackerState, TrackedSession};
pub use snapshot::CoreSnapshot;
pub use storage::{DurableStateStorage, InMemoryStateStorage, StateStorage};
