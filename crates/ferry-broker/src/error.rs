//! Broker failure taxonomy.
//!
//! Out-of-range reads carry the valid window so callers can tell "no new
//! data yet" apart from "data was garbage-collected" without a second query.

use thiserror::Error;

/// Result type alias using `BrokerError`.
pub type Result<T> = std::result::Result<T, BrokerError>;

/// Errors returned by broker adapters.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BrokerError {
    /// Broker cannot be reached or has been closed.
    #[error("broker unavailable: {0}")]
    Unavailable(String),

    /// Topic has no stream in the broker.
    #[error("topic not found: {0}")]
    TopicNotFound(String),

    /// Topic already has a stream in the broker.
    #[error("topic already exists: {0}")]
    TopicExists(String),

    /// Requested offset lies outside the consumable window `[min, max]`.
    #[error("offset {requested} out of range [{min}, {max}]")]
    OffsetOutOfRange {
        /// Offset that was requested
        requested: u64,
        /// Oldest retained offset
        min: u64,
        /// Offset the next publish will receive
        max: u64,
    },

    /// Stored record could not be encoded or decoded.
    #[error("record codec error: {0}")]
    Codec(String),
}

impl BrokerError {
    /// Creates an unavailable error.
    pub fn unavailable(reason: impl Into<String>) -> Self {
        Self::Unavailable(reason.into())
    }

    /// Returns true if the read position has been garbage-collected.
    pub fn is_offset_too_old(&self) -> bool {
        matches!(self, Self::OffsetOutOfRange { requested, min, .. } if requested < min)
    }

    /// Returns true if the read position is beyond the end of the log.
    pub fn is_offset_too_new(&self) -> bool {
        matches!(self, Self::OffsetOutOfRange { requested, max, .. } if requested > max)
    }

    /// Returns true if the failure is expected to clear on its own.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

impl From<sqlx::Error> for BrokerError {
    fn from(err: sqlx::Error) -> Self {
        Self::Unavailable(err.to_string())
    }
}
