//! Core primitives for the causal clustering kernel.
//!
//! This crate holds the leaf building blocks shared by the cluster crate:
//!
//! - **Types**: strongly-typed member, store and log-position identifiers
//! - **Codec**: varint and checksum helpers used by every on-disk format
//! - **Retry**: bounded exponential backoff for transient I/O
//! - **Timer**: cancellable, resettable one-shot timers on a shared runtime
//!
//! # Example
//!
//! ```ignore
//! use causal_core::timer::{TimerService, TimeoutPolicy};
//! use std::time::Duration;
//!
//! let timers = TimerService::current()?;
//! let election = timers.create("election", |_timer| {
//!     tracing::info!("election timeout");
//! });
//! election.set(TimeoutPolicy::uniform(
//!     Duration::from_millis(150),
//!     Duration::from_millis(300),
//! ));
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod codec;
pub mod error;
pub mod retry;
pub mod timer;
pub mod types;

pub use error::{CoreError, Result};
pub use retry::RetryPolicy;
pub use timer::{TimeoutPolicy, Timer, TimerService};
pub use types::{IdType, IndexTracker, LogPosition, MemberId, StoreId};
