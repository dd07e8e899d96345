//! Point-in-time cursors over the stream log
//!
//! A cursor materializes the tracked state as of a target timestamp by
//! anchoring on the nearest snapshot and replaying mutations forward.
//! Bidirectional cursors additionally buffer inverse diffs while moving
//! forward so they can rewind without touching the backend. Write cursors
//! sit at the head of the stream and decide, per update, whether to amend
//! the previous mutation, persist a full snapshot, or append a new
//! mutation entry.

use crate::{
    config::RateConfig,
    error::{Error, Result},
    mutate,
    storage::StorageBackend,
    types::{EntryFilter, EntryType, StateData, StreamEntry},
};
use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Default bound on the inverse diffs buffered for rewinding.
const DEFAULT_REWIND_BUFFER_CAP: usize = 1024;

/// Behavior mode of a cursor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorType {
    /// Appends new state at the head of the stream.
    Write,
    /// Replays forward only; moving backward re-derives from a snapshot.
    ReadForward,
    /// Replays forward and rewinds through buffered inverse diffs.
    ReadBidirectional,
}

/// A cursor at a given point in time.
///
/// Single-owner: every operation takes `&mut self` and the cursor holds no
/// internal locks. Operations that touch the backend suspend at that
/// boundary.
pub struct Cursor {
    storage: Arc<dyn StorageBackend>,
    cursor_type: CursorType,

    /// Has init been called?
    inited: bool,
    /// Do we have a state computed at the target timestamp?
    ready: bool,
    /// Why the last computation failed, if it did.
    not_ready_error: Option<Error>,

    /// Current target timestamp.
    timestamp: DateTime<Utc>,
    /// Most recent snapshot at or before the target.
    last_snapshot: Option<StreamEntry>,
    /// Optimization: the next snapshot after the anchor, when known.
    next_snapshot: Option<StreamEntry>,

    /// Materialized state and the log position it corresponds to.
    computed_state: Option<StateData>,
    computed_timestamp: DateTime<Utc>,

    /// Inverse diffs for rewinding (bidirectional cursors), oldest first.
    rewind_buffer: VecDeque<StreamEntry>,
    rewind_buffer_cap: usize,

    /// Write bookkeeping: the most recent mutation entry and the state
    /// immediately before it, enabling amend-in-place.
    last_mutation: Option<StreamEntry>,
    last_state: Option<StateData>,

    /// Possibly known rate config.
    rate_config: Option<RateConfig>,

    /// Registered entry observers.
    subscribers: Vec<mpsc::UnboundedSender<StreamEntry>>,
}

impl fmt::Debug for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cursor")
            .field("cursor_type", &self.cursor_type)
            .field("inited", &self.inited)
            .field("ready", &self.ready)
            .field("timestamp", &self.timestamp)
            .field("computed_timestamp", &self.computed_timestamp)
            .finish_non_exhaustive()
    }
}

impl Cursor {
    /// Create a cursor bound to a backend, in the given mode. Usually
    /// built through [`crate::Stream::build_cursor`].
    pub fn new(storage: Arc<dyn StorageBackend>, cursor_type: CursorType) -> Self {
        Self {
            storage,
            cursor_type,
            inited: false,
            ready: false,
            not_ready_error: None,
            timestamp: DateTime::<Utc>::MIN_UTC,
            last_snapshot: None,
            next_snapshot: None,
            computed_state: None,
            computed_timestamp: DateTime::<Utc>::MIN_UTC,
            rewind_buffer: VecDeque::new(),
            rewind_buffer_cap: DEFAULT_REWIND_BUFFER_CAP,
            last_mutation: None,
            last_state: None,
            rate_config: None,
            subscribers: Vec::new(),
        }
    }

    /// Initialize the cursor and compute its first state.
    ///
    /// Read cursors require a target timestamp. Write cursors refuse one
    /// and start at the current instant; an empty backend is a valid
    /// starting point for them. Calling init twice is a usage error.
    pub async fn init(&mut self, timestamp: Option<DateTime<Utc>>) -> Result<()> {
        if self.inited {
            return Err(Error::Usage("cursor is already initialized".to_string()));
        }
        self.inited = true;

        if self.cursor_type == CursorType::Write {
            if timestamp.is_some() {
                return Err(Error::Usage(
                    "write cursors derive their own timestamp".to_string(),
                ));
            }
            self.ready = false;
            self.timestamp = Utc::now();
        } else {
            let timestamp = timestamp.ok_or_else(|| {
                Error::Usage("read cursors require a target timestamp".to_string())
            })?;
            self.set_timestamp(timestamp);
        }

        self.compute_state().await
    }

    /// Initialize a read cursor directly from a known snapshot entry,
    /// skipping the backend anchor lookup.
    ///
    /// A write cursor must derive its starting state from the backend (or
    /// from no prior data), never from an externally supplied snapshot.
    pub async fn init_with_snapshot(&mut self, snapshot: StreamEntry) -> Result<()> {
        if self.cursor_type == CursorType::Write {
            return Err(Error::Usage(
                "write cursors cannot be initialized with a snapshot".to_string(),
            ));
        }
        if self.inited {
            return Err(Error::Usage("cursor is already initialized".to_string()));
        }
        if snapshot.entry_type != EntryType::Snapshot {
            return Err(Error::Usage(
                "init_with_snapshot requires a snapshot entry".to_string(),
            ));
        }

        self.inited = true;
        self.timestamp = snapshot.timestamp;
        self.last_snapshot = Some(snapshot);
        self.copy_snapshot_state()?;
        self.fill_next_snapshot().await?;
        self.ready = true;
        Ok(())
    }

    /// The cursor can skip some lookahead fetches when it knows the write
    /// rate. An invalid config clears the hint.
    pub fn set_rate_config(&mut self, config: RateConfig) {
        self.rate_config = config.validate().is_ok().then_some(config);
    }

    /// Bound the number of inverse diffs buffered for rewinding. A rewind
    /// that outruns the retained buffer re-derives from the snapshot
    /// anchor instead. Clamped to at least one entry.
    pub fn set_rewind_buffer_cap(&mut self, cap: usize) {
        self.rewind_buffer_cap = cap.max(1);
        while self.rewind_buffer.len() > self.rewind_buffer_cap {
            self.rewind_buffer.pop_front();
        }
    }

    /// The computed state at the target timestamp.
    pub fn state(&self) -> Result<&StateData> {
        if !self.ready {
            return Err(Error::Usage("computation is not ready".to_string()));
        }
        self.computed_state
            .as_ref()
            .ok_or_else(|| Error::Usage("computation is not ready".to_string()))
    }

    /// Current target timestamp.
    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    /// Actual timestamp of the computed state.
    pub fn computed_timestamp(&self) -> DateTime<Utc> {
        self.computed_timestamp
    }

    /// Behavior mode of this cursor.
    pub fn cursor_type(&self) -> CursorType {
        self.cursor_type
    }

    /// Whether the computed state reflects the current target.
    pub fn is_ready(&self) -> bool {
        self.ready
    }

    /// The error captured by the last failed computation, if any.
    pub fn error(&self) -> Option<&Error> {
        self.not_ready_error.as_ref()
    }

    /// Force the next state query to recompute.
    pub fn invalidate(&mut self) {
        self.ready = false;
    }

    /// Register an observer for entries this cursor consumes or persists.
    ///
    /// Fan-out is synchronous with traversal and never blocks; dropping
    /// the receiver unsubscribes. Late subscribers miss prior entries.
    pub fn subscribe(&mut self) -> mpsc::UnboundedReceiver<StreamEntry> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.push(tx);
        rx
    }

    fn has_observers(&mut self) -> bool {
        self.subscribers.retain(|tx| !tx.is_closed());
        !self.subscribers.is_empty()
    }

    fn publish(&mut self, entry: &StreamEntry) {
        self.subscribers.retain(|tx| tx.send(entry.clone()).is_ok());
    }

    /// Move the target timestamp.
    ///
    /// No-op for write cursors, and when the cursor is already ready at
    /// exactly `timestamp`. Otherwise the cursor becomes not-ready until
    /// the next [`Cursor::compute_state`].
    pub fn set_timestamp(&mut self, timestamp: DateTime<Utc>) {
        if self.cursor_type == CursorType::Write {
            return;
        }
        if self.ready && self.timestamp == timestamp {
            return;
        }

        self.ready = false;
        self.timestamp = timestamp;

        if self
            .last_snapshot
            .as_ref()
            .map_or(false, |s| s.timestamp > timestamp)
        {
            // The held anchor is ahead of the new target; the next compute
            // must re-derive everything from the backend.
            self.last_snapshot = None;
            self.rewind_buffer.clear();
            self.computed_state = None;
        }

        // A forward cursor cannot rewind a computed state; it re-derives
        // from a snapshot instead.
        if self.cursor_type == CursorType::ReadForward
            && self.computed_state.is_some()
            && self.computed_timestamp > timestamp
        {
            self.computed_state = None;
        }
    }

    /// Make the cursor ready at its target timestamp, or surface why not.
    ///
    /// Idempotent once ready. A write cursor that finds no prior data
    /// becomes ready with an empty state; any other failure is recorded
    /// for [`Cursor::error`] and returned.
    pub async fn compute_state(&mut self) -> Result<()> {
        if !self.inited {
            return Err(Error::Usage("cursor is not initialized".to_string()));
        }
        if self.ready {
            return Ok(());
        }

        match self.do_compute_state().await {
            Ok(()) => {
                self.ready = true;
                self.not_ready_error = None;
                Ok(())
            }
            Err(Error::NoData) if self.cursor_type == CursorType::Write => {
                // An empty backend is a valid initial condition for a
                // writer, not a fault.
                self.ready = true;
                self.not_ready_error = None;
                self.computed_state = Some(StateData::new());
                self.computed_timestamp = self.timestamp;
                self.last_state = None;
                Ok(())
            }
            Err(err) => {
                self.ready = false;
                self.not_ready_error = Some(err.clone());
                Err(err)
            }
        }
    }

    async fn do_compute_state(&mut self) -> Result<()> {
        if self.last_snapshot.is_none() {
            self.fill_last_snapshot().await?;
            self.fill_next_snapshot().await?;
        }
        let anchor_ts = self
            .last_snapshot
            .as_ref()
            .map(|s| s.timestamp)
            .ok_or_else(|| {
                Error::ProtocolViolation("snapshot anchor missing after fill".to_string())
            })?;

        if self.timestamp == anchor_ts {
            self.copy_snapshot_state()?;
            self.next_snapshot = None;
        } else if self.computed_state.is_some() {
            if self.computed_timestamp > self.timestamp {
                self.rewind_state().await?;
            } else {
                // With observers attached every entry must still be
                // emitted, so only the anchor bookkeeping moves here; the
                // fast-forward below walks and publishes the entries.
                if self.has_observers()
                    && self
                        .next_snapshot
                        .as_ref()
                        .map_or(false, |s| s.timestamp < self.timestamp)
                {
                    self.last_snapshot = self.next_snapshot.take();
                    self.fill_next_snapshot().await?;
                    if self
                        .next_snapshot
                        .as_ref()
                        .map_or(true, |s| s.timestamp < self.timestamp)
                    {
                        self.last_snapshot = None;
                        self.next_snapshot = None;
                        self.fill_last_snapshot().await?;
                        self.fill_next_snapshot().await?;
                    }
                }
                self.fast_forward_state().await?;
            }
        } else {
            self.copy_snapshot_state()?;
            self.fast_forward_state().await?;
        }

        Ok(())
    }

    /// Fetch the snapshot anchor for the current target.
    async fn fill_last_snapshot(&mut self) -> Result<()> {
        let found = self.storage.get_snapshot_before(self.timestamp).await?;
        let snapshot = found.ok_or(Error::NoData)?;

        if snapshot.entry_type != EntryType::Snapshot {
            return Err(Error::ProtocolViolation(
                "backend returned a non-snapshot entry for get_snapshot_before".to_string(),
            ));
        }
        if snapshot.timestamp > self.timestamp {
            return Err(Error::ProtocolViolation(
                "backend returned a snapshot after the requested timestamp".to_string(),
            ));
        }

        tracing::debug!(anchor = %snapshot.timestamp, target = %self.timestamp, "snapshot anchor filled");
        self.last_snapshot = Some(snapshot);
        Ok(())
    }

    /// Refresh the lookahead snapshot hint.
    async fn fill_next_snapshot(&mut self) -> Result<()> {
        let Some(anchor_ts) = self.last_snapshot.as_ref().map(|s| s.timestamp) else {
            self.next_snapshot = None;
            return Ok(());
        };

        // If the configured keyframe cadence says the next snapshot cannot
        // have been written yet, skip the lookup. Fast-forward still
        // surfaces it when the stream was recorded at a different cadence.
        if let Some(rate) = self.rate_config {
            if anchor_ts + rate.keyframe_frequency() > Utc::now() {
                self.next_snapshot = None;
                return Ok(());
            }
        }

        let snap = self
            .storage
            .get_entry_after(anchor_ts, EntryFilter::Snapshot)
            .await?;
        if let Some(ref entry) = snap {
            if entry.entry_type != EntryType::Snapshot {
                return Err(Error::ProtocolViolation(
                    "backend returned the wrong entry type for a snapshot filter".to_string(),
                ));
            }
        }
        self.next_snapshot = snap;
        Ok(())
    }

    /// Reset the computed state to the snapshot anchor.
    fn copy_snapshot_state(&mut self) -> Result<()> {
        let snapshot = self.last_snapshot.as_ref().ok_or_else(|| {
            Error::ProtocolViolation("no snapshot anchor to copy".to_string())
        })?;

        let data = snapshot.data.clone();
        self.computed_timestamp = snapshot.timestamp;
        self.computed_state = Some(data.clone());
        self.last_mutation = None;
        self.last_state = Some(data);
        self.rewind_buffer.clear();
        Ok(())
    }

    /// Consume a mutation entry, advancing the computed state.
    fn apply_mutation(&mut self, entry: &StreamEntry) -> Result<()> {
        let state = self.computed_state.as_ref().ok_or_else(|| {
            Error::ProtocolViolation("no computed state to mutate".to_string())
        })?;
        let after = mutate::apply(state, &entry.data);

        match self.cursor_type {
            CursorType::ReadBidirectional => {
                let inverse =
                    StreamEntry::mutation(entry.timestamp, mutate::diff(&after, state));
                if self.rewind_buffer.len() >= self.rewind_buffer_cap {
                    self.rewind_buffer.pop_front();
                }
                self.rewind_buffer.push_back(inverse);
            }
            CursorType::Write => {
                self.last_state = self.computed_state.clone();
                self.last_mutation = Some(entry.clone());
            }
            CursorType::ReadForward => {}
        }

        self.computed_state = Some(after);
        self.computed_timestamp = entry.timestamp;
        Ok(())
    }

    /// Advance the computed state by consuming entries up to the target.
    ///
    /// Stops cleanly when the stream has no further entries: a cursor
    /// caught up to the head is a valid ready state.
    async fn fast_forward_state(&mut self) -> Result<()> {
        let result = self.fast_forward_inner().await;
        if result.is_err() {
            self.computed_state = None;
        }
        result
    }

    async fn fast_forward_inner(&mut self) -> Result<()> {
        while self.computed_timestamp < self.timestamp {
            let entry = self
                .storage
                .get_entry_after(self.computed_timestamp, EntryFilter::Any)
                .await?;
            let Some(entry) = entry else {
                break;
            };

            if entry.timestamp < self.computed_timestamp {
                return Err(Error::ProtocolViolation(
                    "backend returned an entry before the requested timestamp".to_string(),
                ));
            }
            if entry.timestamp > self.timestamp {
                // Not consumed, but worth remembering as a lookahead hint.
                if entry.entry_type == EntryType::Snapshot {
                    self.next_snapshot = Some(entry);
                }
                break;
            }

            self.publish(&entry);
            match entry.entry_type {
                EntryType::Mutation => self.apply_mutation(&entry)?,
                EntryType::Snapshot => {
                    self.last_snapshot = Some(entry);
                    self.next_snapshot = None;
                    self.copy_snapshot_state()?;
                    self.fill_next_snapshot().await?;
                }
            }
        }
        Ok(())
    }

    /// Rewind the computed state to the target through buffered inverse
    /// diffs, newest first. When the buffer does not reach far enough back
    /// (no mutations in the window, or trimmed history), the state is
    /// re-derived from the snapshot anchor instead.
    async fn rewind_state(&mut self) -> Result<()> {
        loop {
            let Some(newest_ts) = self.rewind_buffer.back().map(|e| e.timestamp) else {
                break;
            };
            if newest_ts <= self.timestamp {
                // Everything after the target has been undone.
                return Ok(());
            }

            let Some(inverse) = self.rewind_buffer.pop_back() else {
                break;
            };
            let state = self.computed_state.as_ref().ok_or_else(|| {
                Error::ProtocolViolation("no computed state to rewind".to_string())
            })?;
            self.computed_state = Some(mutate::apply(state, &inverse.data));
            self.computed_timestamp = match self.rewind_buffer.back() {
                Some(previous) => previous.timestamp,
                None => self
                    .last_snapshot
                    .as_ref()
                    .map_or(self.timestamp, |s| s.timestamp),
            };
        }

        // The buffer ran out before reaching the target.
        self.copy_snapshot_state()?;
        self.fast_forward_state().await
    }

    fn check_can_handle_entry(&self, timestamp: DateTime<Utc>) -> Result<()> {
        if self.cursor_type != CursorType::Write || !self.ready {
            return Err(Error::Usage(
                "cursor is not a ready write cursor".to_string(),
            ));
        }
        if self.last_state.is_some() && timestamp < self.computed_timestamp {
            return Err(Error::Usage(
                "entry is before the latest recorded change".to_string(),
            ));
        }
        Ok(())
    }

    /// Feed an externally observed entry into a write cursor so its view
    /// stays consistent with entries it did not itself produce. The entry
    /// is republished to this cursor's observers.
    pub fn handle_entry(&mut self, entry: StreamEntry) -> Result<()> {
        self.check_can_handle_entry(entry.timestamp)?;

        match entry.entry_type {
            EntryType::Snapshot => {
                self.last_snapshot = Some(entry.clone());
                self.copy_snapshot_state()?;
            }
            EntryType::Mutation => self.apply_mutation(&entry)?,
        }

        self.publish(&entry);
        Ok(())
    }

    /// Persist a new state at `timestamp` under the given rate policy.
    ///
    /// A state deep-equal to the last known one is a no-op. Writes inside
    /// the merge window amend the previous mutation in place; a write due
    /// for a keyframe (or with no prior data) persists a full snapshot;
    /// everything else appends a mutation diffed from the current state.
    pub async fn write_state(
        &mut self,
        timestamp: DateTime<Utc>,
        state: StateData,
        config: RateConfig,
    ) -> Result<()> {
        if self.last_state.is_some() && self.computed_state.as_ref() == Some(&state) {
            return Ok(());
        }

        self.check_can_handle_entry(timestamp)?;

        let last_change = match (&self.last_mutation, &self.last_snapshot) {
            (Some(mutation), _) => Some(mutation.timestamp),
            (None, Some(snapshot)) => Some(snapshot.timestamp),
            (None, None) => None,
        };
        if self.last_state.is_some() && last_change.map_or(false, |t| timestamp < t) {
            return Err(Error::Usage(
                "cannot write an entry before the last recorded change".to_string(),
            ));
        }

        let amend_target = self
            .last_mutation
            .as_ref()
            .map(|m| m.timestamp)
            .filter(|t| timestamp.signed_duration_since(*t) < config.change_frequency());

        let saved = if let Some(old_timestamp) = amend_target {
            // Too soon for a distinct entry: fold this write into the
            // previous mutation.
            let last_state = self.last_state.as_ref().ok_or_else(|| {
                Error::ProtocolViolation(
                    "write cursor lost the state preceding its last mutation".to_string(),
                )
            })?;
            let merged = mutate::diff(last_state, &state);
            let amended = StreamEntry::mutation(old_timestamp, merged.clone());
            self.storage.amend_entry(amended.clone(), old_timestamp).await?;

            tracing::debug!(
                timestamp = %timestamp,
                amended = %old_timestamp,
                "mutation amended in place"
            );
            self.last_mutation = Some(amended);
            self.computed_state = Some(state);
            StreamEntry::mutation(timestamp, merged)
        } else if self.last_state.is_none()
            || self.last_snapshot.as_ref().map_or(true, |s| {
                timestamp.signed_duration_since(s.timestamp) >= config.keyframe_frequency()
            })
        {
            // Keyframe due, or no prior data: persist the full state.
            let snapshot = StreamEntry::snapshot(timestamp, state);
            self.storage.save_entry(snapshot.clone()).await?;

            tracing::debug!(timestamp = %timestamp, "snapshot persisted");
            self.last_snapshot = Some(snapshot.clone());
            self.last_mutation = None;
            if let Err(err) = self.copy_snapshot_state() {
                self.ready = false;
                self.computed_state = None;
                return Err(err);
            }
            snapshot
        } else {
            // Steady state: a delta from the current computed state, which
            // is the new entry's predecessor in the log.
            let previous = self.computed_state.clone().ok_or_else(|| {
                Error::ProtocolViolation("write cursor has no computed state".to_string())
            })?;
            let entry = StreamEntry::mutation(timestamp, mutate::diff(&previous, &state));
            self.storage.save_entry(entry.clone()).await?;

            tracing::debug!(timestamp = %timestamp, "mutation persisted");
            self.last_mutation = Some(entry.clone());
            self.last_state = Some(previous);
            self.computed_state = Some(state);
            entry
        };

        self.computed_timestamp = timestamp;
        self.publish(&saved);
        Ok(())
    }

    /// Write a full entry through the same rate policy as
    /// [`Cursor::write_state`].
    ///
    /// Snapshot entries carry the state directly; a mutation entry is
    /// first applied to the current state so the amend/snapshot/mutation
    /// decision applies uniformly.
    pub async fn write_entry(&mut self, entry: StreamEntry, config: RateConfig) -> Result<()> {
        match entry.entry_type {
            EntryType::Snapshot => self.write_state(entry.timestamp, entry.data, config).await,
            EntryType::Mutation => {
                let next = mutate::apply(self.state()?, &entry.data);
                self.write_state(entry.timestamp, next, config).await
            }
        }
    }
}
