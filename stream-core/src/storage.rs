//! Storage backend contract and the in-memory reference implementation
//!
//! The four operations below are the entire compatibility surface between
//! cursors and a backend; their strict-inequality and exact-match
//! semantics must be preserved by any implementation over memory, disk, or
//! network. [`MemoryBackend`] is the reference implementation and the
//! conformance fixture for the contract.

use crate::{
    error::{Error, Result},
    types::{EntryFilter, EntryType, StreamEntry},
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;

/// Pluggable storage for stream entries.
///
/// All operations may suspend; the backend is shared across arbitrarily
/// many cursors and is responsible for making its own access safe.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// The most recent snapshot entry strictly before `timestamp`, or
    /// `None` if no such entry exists. Never returns a mutation entry or
    /// an entry at or after `timestamp`.
    async fn get_snapshot_before(
        &self,
        timestamp: DateTime<Utc>,
    ) -> Result<Option<StreamEntry>>;

    /// The entry with the smallest timestamp strictly greater than
    /// `timestamp` whose type passes `filter`, or `None`.
    async fn get_entry_after(
        &self,
        timestamp: DateTime<Utc>,
        filter: EntryFilter,
    ) -> Result<Option<StreamEntry>>;

    /// Append a new entry. Callers guarantee entries arrive in
    /// non-decreasing timestamp order; the backend need not validate this.
    async fn save_entry(&self, entry: StreamEntry) -> Result<()>;

    /// Replace, in place, the entry whose timestamp exactly equals
    /// `old_timestamp`. Fails when no entry has that exact timestamp;
    /// never inserts.
    async fn amend_entry(
        &self,
        entry: StreamEntry,
        old_timestamp: DateTime<Utc>,
    ) -> Result<()>;
}

/// A general purpose in-memory backend.
///
/// Entries are kept strictly sorted ascending by timestamp. Lookups run a
/// binary search for the closest index followed by a bounded linear scan
/// in the required direction.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    entries: RwLock<Vec<StreamEntry>>,
}

impl MemoryBackend {
    /// Create an empty backend.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a backend seeded with entries, which must already be sorted
    /// ascending by timestamp.
    pub fn with_entries(entries: Vec<StreamEntry>) -> Self {
        Self {
            entries: RwLock::new(entries),
        }
    }

    /// Copy of the stored entries, oldest first.
    pub fn entries(&self) -> Vec<StreamEntry> {
        self.entries.read().clone()
    }

    /// Number of stored entries.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// True when nothing is stored.
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// The stored entry closest to `timestamp` at or after it, if any.
    pub fn find_closest_entry(&self, timestamp: DateTime<Utc>) -> Option<StreamEntry> {
        let entries = self.entries.read();
        let idx = Self::find_closest(&entries, timestamp);
        entries.get(idx).cloned()
    }

    // First index whose timestamp is at or after `timestamp`; equal to the
    // length when every entry is before it.
    fn find_closest(entries: &[StreamEntry], timestamp: DateTime<Utc>) -> usize {
        entries.partition_point(|e| e.timestamp < timestamp)
    }
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    async fn get_snapshot_before(
        &self,
        timestamp: DateTime<Utc>,
    ) -> Result<Option<StreamEntry>> {
        let entries = self.entries.read();
        let idx = Self::find_closest(&entries, timestamp);

        // Everything below idx is strictly before the timestamp; walk back
        // to the nearest snapshot.
        Ok(entries[..idx]
            .iter()
            .rev()
            .find(|e| e.entry_type == EntryType::Snapshot)
            .cloned())
    }

    async fn get_entry_after(
        &self,
        timestamp: DateTime<Utc>,
        filter: EntryFilter,
    ) -> Result<Option<StreamEntry>> {
        let entries = self.entries.read();
        let idx = entries.partition_point(|e| e.timestamp <= timestamp);

        Ok(entries[idx..]
            .iter()
            .find(|e| filter.matches(e.entry_type))
            .cloned())
    }

    async fn save_entry(&self, entry: StreamEntry) -> Result<()> {
        let mut entries = self.entries.write();

        tracing::debug!(
            timestamp = %entry.timestamp,
            entry_type = %entry.entry_type,
            "entry appended"
        );

        // Writers append in order; keep the sorted invariant anyway for
        // out-of-order stragglers.
        let idx = entries.partition_point(|e| e.timestamp <= entry.timestamp);
        entries.insert(idx, entry);
        Ok(())
    }

    async fn amend_entry(
        &self,
        entry: StreamEntry,
        old_timestamp: DateTime<Utc>,
    ) -> Result<()> {
        let mut entries = self.entries.write();
        let idx = Self::find_closest(&entries, old_timestamp);

        match entries.get_mut(idx) {
            Some(existing) if existing.timestamp == old_timestamp => {
                tracing::debug!(timestamp = %old_timestamp, "entry amended");
                *existing = entry;
                Ok(())
            }
            _ => Err(Error::ProtocolViolation(format!(
                "amend target not found at {}",
                old_timestamp
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::StateData;
    use chrono::{Duration, TimeZone};
    use serde_json::json;

    fn base_time() -> DateTime<Utc> {
        Utc.timestamp_millis_opt(1_478_492_726_987).unwrap()
    }

    fn test_data(n: i64) -> StateData {
        let mut data = StateData::new();
        data.insert("test".to_string(), json!(n));
        data
    }

    // Ten entries, one second apart, ending one second before base time.
    // Snapshots at positions 0 and 5.
    fn mock_entries() -> Vec<StreamEntry> {
        (0..10i64)
            .map(|i| {
                let timestamp = base_time() + Duration::seconds(-10 + i);
                let data = test_data(i + 1);
                if i == 0 || i == 5 {
                    StreamEntry::snapshot(timestamp, data)
                } else {
                    StreamEntry::mutation(timestamp, data)
                }
            })
            .collect()
    }

    fn mock_backend() -> MemoryBackend {
        MemoryBackend::with_entries(mock_entries())
    }

    #[tokio::test]
    async fn test_entry_after_with_filter() {
        let backend = mock_backend();
        let entry = backend
            .get_entry_after(base_time() + Duration::seconds(-9), EntryFilter::Snapshot)
            .await
            .unwrap()
            .expect("expected a snapshot");
        assert_eq!(entry.entry_type, EntryType::Snapshot);
        assert_eq!(entry.data, test_data(6));
    }

    #[tokio::test]
    async fn test_snapshot_before() {
        let backend = mock_backend();
        let entry = backend
            .get_snapshot_before(base_time() + Duration::seconds(-9))
            .await
            .unwrap()
            .expect("expected a snapshot");
        assert_eq!(entry.data, test_data(1));
    }

    #[tokio::test]
    async fn test_snapshot_before_is_strict() {
        // Exactly at the second snapshot's timestamp, the first one wins.
        let backend = mock_backend();
        let entry = backend
            .get_snapshot_before(base_time() + Duration::seconds(-5))
            .await
            .unwrap()
            .expect("expected a snapshot");
        assert_eq!(entry.data, test_data(1));
    }

    #[tokio::test]
    async fn test_entry_after_is_strict() {
        let backend = mock_backend();
        let entry = backend
            .get_entry_after(base_time() + Duration::seconds(-5), EntryFilter::Any)
            .await
            .unwrap()
            .expect("expected an entry");
        assert_eq!(entry.data, test_data(7));
    }

    #[tokio::test]
    async fn test_empty_backend_returns_none() {
        let backend = MemoryBackend::new();
        assert!(backend
            .get_snapshot_before(base_time())
            .await
            .unwrap()
            .is_none());
        assert!(backend
            .get_entry_after(base_time(), EntryFilter::Any)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_entry_after_past_end_returns_none() {
        let backend = mock_backend();
        assert!(backend
            .get_entry_after(base_time(), EntryFilter::Any)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_filter_never_mismatches() {
        let backend = mock_backend();
        let mut probe = base_time() - Duration::seconds(11);
        while let Some(entry) = backend
            .get_entry_after(probe, EntryFilter::Mutation)
            .await
            .unwrap()
        {
            assert_eq!(entry.entry_type, EntryType::Mutation);
            probe = entry.timestamp;
        }
    }

    #[tokio::test]
    async fn test_save_entry_keeps_sorted_order() {
        let backend = mock_backend();
        // A straggler older than the newest entry still lands in order.
        let straggler = StreamEntry::mutation(
            base_time() + Duration::milliseconds(-4_500),
            test_data(0),
        );
        backend.save_entry(straggler).await.unwrap();

        let entries = backend.entries();
        assert_eq!(entries.len(), 11);
        assert!(entries
            .windows(2)
            .all(|pair| pair[0].timestamp <= pair[1].timestamp));
        assert_eq!(entries[6].data, test_data(0));
    }

    #[tokio::test]
    async fn test_amend_entry_exact_match() {
        let backend = mock_backend();
        let target = base_time() + Duration::seconds(-9);
        let replacement = StreamEntry::mutation(target, test_data(42));

        backend
            .amend_entry(replacement.clone(), target)
            .await
            .unwrap();

        let entries = backend.entries();
        assert_eq!(entries[1], replacement);
        assert_eq!(entries.len(), 10);
    }

    #[tokio::test]
    async fn test_amend_entry_missing_is_an_error() {
        let backend = mock_backend();
        let target = base_time() + Duration::milliseconds(-9_500);
        let replacement = StreamEntry::mutation(target, test_data(42));

        let err = backend.amend_entry(replacement, target).await.unwrap_err();
        assert!(matches!(err, Error::ProtocolViolation(_)));
        assert_eq!(backend.len(), 10);
    }
}
