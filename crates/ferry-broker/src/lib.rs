//! Broker abstraction over an offset-addressed, append-only log.
//!
//! Every topic is a single ordered stream. Offsets start at zero and grow by
//! one per published message; retention may raise the minimum offset but
//! never reorders records. Consumers read `[min, max)` where `max` is the
//! offset the next publish will receive.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use std::{future::Future, pin::Pin};

use chrono::{DateTime, Utc};
use ferry_core::Message;

pub mod error;
pub mod memory;
pub mod postgres;

pub use error::{BrokerError, Result};
pub use memory::MemoryBroker;
pub use postgres::PostgresBroker;

/// A message read back from the log together with its position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    /// Position in the topic's log.
    pub offset: u64,
    /// Stored message; `message_id` is the offset rendered as a string.
    pub message: Message,
}

/// Outcome of a successful publish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishReceipt {
    /// Identifier assigned to the message.
    pub message_id: String,
    /// Partition the record landed in. Always `0` for single-stream topics.
    pub partition: i32,
    /// Offset of the new record.
    pub offset: u64,
    /// When the broker accepted the record.
    pub timestamp: DateTime<Utc>,
}

/// Operations every broker adapter provides.
///
/// Methods take owned arguments and return boxed futures so adapters can be
/// shared as `Arc<dyn Broker>` across workers.
pub trait Broker: Send + Sync + 'static {
    /// Appends a message to a topic.
    ///
    /// Fails with `BrokerError::Unavailable` or `BrokerError::TopicNotFound`.
    fn publish(
        &self,
        topic: String,
        message: Message,
    ) -> Pin<Box<dyn Future<Output = Result<PublishReceipt>> + Send + '_>>;

    /// Oldest offset still retained for the topic.
    fn min_offset(&self, topic: String) -> Pin<Box<dyn Future<Output = Result<u64>> + Send + '_>>;

    /// Offset the next published record will receive.
    fn max_offset(&self, topic: String) -> Pin<Box<dyn Future<Output = Result<u64>> + Send + '_>>;

    /// Reads up to `max_messages` records in offset order starting at
    /// `offset`.
    ///
    /// Reading at `max` yields an empty batch. With `immediate = false` the
    /// adapter may wait briefly for a record to arrive. Offsets outside
    /// `[min, max]` fail with `BrokerError::OffsetOutOfRange`.
    fn consume(
        &self,
        topic: String,
        offset: u64,
        max_messages: usize,
        immediate: bool,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<Record>>> + Send + '_>>;

    /// Creates the stream backing a topic.
    fn create_topic(&self, topic: String) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;

    /// Removes a topic's stream and all of its records.
    fn delete_topic(&self, topic: String) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;

    /// Releases all broker resources. Idempotent; afterwards every call fails
    /// with `BrokerError::Unavailable`.
    fn close(&self) -> Pin<Box<dyn Future<Output = ()> + Send + '_>>;
}

/// Checks `offset` against the consumable window of a log.
pub(crate) fn check_range(offset: u64, min: u64, max: u64) -> Result<()> {
    if offset < min || offset > max {
        return Err(BrokerError::OffsetOutOfRange { requested: offset, min, max });
    }
    Ok(())
}
