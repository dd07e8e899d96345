//! Error types for the stream engine

use thiserror::Error;

/// Result type for stream operations
pub type Result<T> = std::result::Result<T, Error>;

/// Stream errors
///
/// `Clone` is derived so a cursor can retain its last failure for
/// inspection while still returning it to the caller.
#[derive(Error, Debug, Clone)]
pub enum Error {
    /// No snapshot exists before the requested timestamp. Recoverable only
    /// by a write cursor at initialization; fatal for read cursors.
    #[error("no data before the requested timestamp")]
    NoData,

    /// A backend returned data violating an ordering or type guarantee.
    /// Never retried; indicates backend corruption or a contract bug.
    #[error("storage contract violation: {0}")]
    ProtocolViolation(String),

    /// Programmer misuse of the cursor or stream API.
    #[error("usage error: {0}")]
    Usage(String),

    /// Storage backend failure
    #[error("storage error: {0}")]
    Storage(String),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),
}

impl Error {
    /// True for the distinguished empty-backend condition.
    pub fn is_no_data(&self) -> bool {
        matches!(self, Error::NoData)
    }
}
