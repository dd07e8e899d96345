//! StateStream Core
//!
//! Append-only temporal state store: periodic full-state snapshots
//! interleaved with incremental mutations, plus cursors that materialize
//! the tracked state as of any requested timestamp.
//!
//! # Architecture
//!
//! - **Log model**: snapshots bound the worst-case replay distance;
//!   mutations are diffs between consecutive states
//! - **Cursors**: read-forward, read-bidirectional (buffered inverse
//!   diffs for rewinding), and write (amend/snapshot/mutation policy)
//! - **Pluggable storage**: a four-operation async contract with an
//!   in-memory reference implementation
//!
//! # Invariants
//!
//! - Entries are totally ordered by timestamp; amends are the only
//!   exact-timestamp writes
//! - A mutation applied to the state preceding it in log order yields the
//!   state following it
//! - Deterministic replay: the same log materializes the same state at
//!   any timestamp

#![forbid(unsafe_code)]
#![warn(
    missing_docs,
    rust_2018_idioms,
    missing_debug_implementations,
    clippy::all
)]

pub mod config;
pub mod cursor;
pub mod error;
pub mod mutate;
pub mod storage;
pub mod stream;
pub mod types;

// Re-exports
pub use config::{Config, RateConfig};
pub use cursor::{Cursor, CursorType};
pub use error::{Error, Result};
pub use storage::{MemoryBackend, StorageBackend};
pub use stream::Stream;
pub use types::{EntryFilter, EntryType, StateData, StreamEntry};
