//! Stream façade owning the write path
//!
//! A [`Stream`] binds one storage backend to the active rate
//! configuration and keeps a single lazily created write cursor. Read
//! cursors are built on demand and owned by their callers.

use crate::{
    config::Config,
    cursor::{Cursor, CursorType},
    error::{Error, Result},
    storage::StorageBackend,
    types::{StateData, StreamEntry},
};
use chrono::{DateTime, Utc};
use std::fmt;
use std::sync::Arc;

/// A temporal state stream over one storage backend.
pub struct Stream {
    config: Config,
    storage: Arc<dyn StorageBackend>,

    // If initialized, tracks the latest state for writing.
    write_cursor: Option<Cursor>,
}

impl fmt::Debug for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stream")
            .field("config", &self.config)
            .field("writer_initialized", &self.write_cursor.is_some())
            .finish_non_exhaustive()
    }
}

impl Stream {
    /// Create a stream over `storage`, with the default config if none is
    /// given.
    pub fn new(storage: Arc<dyn StorageBackend>, config: Option<Config>) -> Result<Self> {
        let config = config.unwrap_or_default();
        config.validate()?;

        Ok(Self {
            config,
            storage,
            write_cursor: None,
        })
    }

    /// Active configuration.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Shared handle to the backing storage.
    pub fn storage(&self) -> Arc<dyn StorageBackend> {
        Arc::clone(&self.storage)
    }

    /// Drop the write cursor; the next write builds a fresh one from the
    /// backend.
    pub fn reset_writer(&mut self) {
        self.write_cursor = None;
    }

    /// Turn off the merge window so every write lands as a distinct entry.
    pub fn disable_amends(&mut self) {
        self.config.record_rate.change_frequency_ms = 0;
        if let Some(cursor) = self.write_cursor.as_mut() {
            cursor.set_rate_config(self.config.record_rate);
        }
    }

    /// Initialize the stream for writing. If not called, done
    /// automatically at the first write.
    pub async fn init_writer(&mut self) -> Result<()> {
        if self.write_cursor.is_some() {
            return Ok(());
        }

        let mut cursor = self.build_cursor(CursorType::Write);
        cursor.init(None).await?;
        if !cursor.is_ready() {
            return Err(Error::Usage(
                "write cursor not ready after init".to_string(),
            ));
        }

        tracing::debug!("write cursor initialized");
        self.write_cursor = Some(cursor);
        Ok(())
    }

    /// The write cursor, initializing it on first use.
    pub async fn write_cursor(&mut self) -> Result<&mut Cursor> {
        self.init_writer().await?;
        self.write_cursor
            .as_mut()
            .ok_or_else(|| Error::Usage("write cursor unavailable".to_string()))
    }

    /// Record `state` at `timestamp` under the stream's rate policy.
    pub async fn write_state(
        &mut self,
        timestamp: DateTime<Utc>,
        state: StateData,
    ) -> Result<()> {
        let rate = self.config.record_rate;
        let cursor = self.write_cursor().await?;
        cursor.write_state(timestamp, state, rate).await
    }

    /// Record a full entry under the stream's rate policy.
    pub async fn write_entry(&mut self, entry: StreamEntry) -> Result<()> {
        let rate = self.config.record_rate;
        let cursor = self.write_cursor().await?;
        cursor.write_entry(entry, rate).await
    }

    /// Build a detached cursor over this stream's storage.
    pub fn build_cursor(&self, cursor_type: CursorType) -> Cursor {
        Cursor::new(Arc::clone(&self.storage), cursor_type)
    }
}
