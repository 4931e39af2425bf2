//! Subscription consumption and push delivery for the ferry gateway.
//!
//! Push subscriptions are each driven by a dedicated worker task that reads
//! batches from the broker and POSTs them to the subscription's endpoint,
//! advancing the committed offset only after the whole batch was accepted.
//! Pull subscriptions are served on demand and committed by explicit
//! acknowledgment.
//!
//! # Architecture
//!
//! 1. **Verify** - An unverified endpoint only receives the verification
//!    challenge until it answers with a 2xx status
//! 2. **Consume** - The worker reads up to `max_messages` records from its
//!    next offset and reserves them with a pending ack
//! 3. **Deliver** - Records are sent in offset order; the first failure
//!    stops the batch
//! 4. **Acknowledge or retry** - A delivered batch moves the offset; a failed
//!    one is retried under the subscription's policy until the ack deadline,
//!    then abandoned without moving the offset
//!
//! Every cursor write is a compare-and-set on the stored `next_offset`, so
//! delivery is at-least-once and offsets never move backwards.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use ferry_broker::MemoryBroker;
//! use ferry_core::RealClock;
//! use ferry_delivery::{
//!     storage::mock::MockSubscriptionStore, DeliveryConfig, DeliveryContext, DeliveryError,
//!     DeliveryManager, HttpSender,
//! };
//!
//! # async fn example() -> std::result::Result<(), DeliveryError> {
//! let config = DeliveryConfig::default();
//! let context = DeliveryContext::new(
//!     Arc::new(MemoryBroker::new()),
//!     Arc::new(MockSubscriptionStore::new()),
//!     Arc::new(HttpSender::new(config.client_config.clone())?),
//!     Arc::new(RealClock::new()),
//!     config,
//! );
//!
//! let manager = DeliveryManager::new(context);
//! manager.load_push_subs().await?;
//! manager.start_all().await?;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod access;
pub mod client;
pub mod context;
pub mod error;
pub mod manager;
pub mod publish;
pub mod pull;
pub mod retry;
pub mod storage;
pub mod worker;

pub use access::AccessControl;
pub use client::{ClientConfig, HttpSender, PushEnvelope, PushSender};
pub use context::{DeliveryConfig, DeliveryContext};
pub use error::{DeliveryError, ErrorCategory, Result};
pub use manager::DeliveryManager;
pub use publish::Publisher;
pub use pull::{PullService, ReceivedMessage};
pub use storage::{PostgresSubscriptionStore, SubscriptionStore};
pub use worker::{Fault, WorkerPhase, WorkerStatus};

/// Default upper bound on messages returned by one pull.
pub const DEFAULT_MAX_PULL_MESSAGES: u32 = 1000;
