//! Catch-up: bringing a lagging or new member current over the network.
//!
//! ## Module Structure
//!
//! - `protocol`: frame codec and request/response messages
//! - `client`: connections with inactivity watchdogs
//! - `server`: read-only request handling on the serving member
//! - `process`: the client-side flow driving a local member

mod client;
mod process;
pub mod protocol;
mod server;

pub use client::{CatchupClient, CatchupConnection, LogEntryStream, TransactionStream};
pub use process::{CatchupOutcome, CatchupProcess, CatchupSink, CatchupState};
pub use protocol::{CatchupRequest, CatchupResponse, Frame, FrameCodec};
pub use server::{CatchupServer, CatchupSource};
