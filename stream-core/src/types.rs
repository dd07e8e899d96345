//! Core types for the stream log
//!
//! Entries are value types with no behavior of their own. Within a backend
//! they are totally ordered by timestamp; two distinct stored entries never
//! share an instant (the amend operation is the only exact-timestamp write).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Opaque state payload: a string-keyed mapping to arbitrary JSON values.
pub type StateData = serde_json::Map<String, Value>;

/// Kind of a stored log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryType {
    /// A complete state.
    Snapshot,
    /// A diff that, applied to the state immediately preceding it in log
    /// order, yields the state immediately following it.
    Mutation,
}

impl fmt::Display for EntryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntryType::Snapshot => write!(f, "snapshot"),
            EntryType::Mutation => write!(f, "mutation"),
        }
    }
}

/// Type filter for entry lookups.
///
/// Kept separate from [`EntryType`] so stored entries can never carry a
/// filter-only tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryFilter {
    /// Match snapshot entries only.
    Snapshot,
    /// Match mutation entries only.
    Mutation,
    /// Match any entry.
    Any,
}

impl EntryFilter {
    /// Whether an entry of the given type passes this filter.
    pub fn matches(self, entry_type: EntryType) -> bool {
        match self {
            EntryFilter::Any => true,
            EntryFilter::Snapshot => entry_type == EntryType::Snapshot,
            EntryFilter::Mutation => entry_type == EntryType::Mutation,
        }
    }
}

impl From<EntryType> for EntryFilter {
    fn from(entry_type: EntryType) -> Self {
        match entry_type {
            EntryType::Snapshot => EntryFilter::Snapshot,
            EntryType::Mutation => EntryFilter::Mutation,
        }
    }
}

/// An entry in the stream log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamEntry {
    /// Instant this entry belongs to.
    pub timestamp: DateTime<Utc>,

    /// Snapshot or mutation.
    pub entry_type: EntryType,

    /// Full state for snapshots, diff payload for mutations.
    pub data: StateData,
}

impl StreamEntry {
    /// Build a snapshot entry holding a complete state.
    pub fn snapshot(timestamp: DateTime<Utc>, data: StateData) -> Self {
        Self {
            timestamp,
            entry_type: EntryType::Snapshot,
            data,
        }
    }

    /// Build a mutation entry holding a diff against the preceding state.
    pub fn mutation(timestamp: DateTime<Utc>, data: StateData) -> Self {
        Self {
            timestamp,
            entry_type: EntryType::Mutation,
            data,
        }
    }
}
