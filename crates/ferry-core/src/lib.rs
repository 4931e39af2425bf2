//! Core domain models shared by the broker and delivery crates.
//!
//! Provides identifiers, the topic and subscription catalog, consumption
//! cursors with compare-and-set updates, the message envelope, a clock
//! abstraction, and the Postgres repositories that persist them.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
pub mod models;
pub mod storage;
pub mod time;

pub use error::{CoreError, Result};
pub use models::{
    broker_topic_name, AclResource, Cursor, Message, OffsetUpdate, PendingAck, Principal,
    ProjectId, PushConfig, RetryKind, RetryPolicy, Subscription, SubscriptionKey, Topic,
    TrafficStats, DEFAULT_ACK_DEADLINE_SECONDS,
};
pub use time::{Clock, RealClock, TestClock};
