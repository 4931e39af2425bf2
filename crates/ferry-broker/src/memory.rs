//! In-process broker adapter.
//!
//! Keeps each topic's log in memory with a rising base offset. Used by tests
//! and single-node deployments; outages and retention can be injected to
//! exercise consumer recovery paths.

use std::{
    collections::{HashMap, VecDeque},
    future::Future,
    pin::Pin,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use ferry_core::{Clock, Message, RealClock};
use tokio::sync::{Notify, RwLock};
use tracing::debug;

use crate::{check_range, Broker, BrokerError, PublishReceipt, Record, Result};

const DEFAULT_LONG_POLL: Duration = Duration::from_millis(500);

#[derive(Debug, Default)]
struct TopicLog {
    base: u64,
    records: VecDeque<Message>,
}

impl TopicLog {
    fn end(&self) -> u64 {
        self.base + self.records.len() as u64
    }
}

/// Broker holding every topic's log in memory.
pub struct MemoryBroker {
    topics: RwLock<HashMap<String, TopicLog>>,
    published: Notify,
    closed: AtomicBool,
    outage: AtomicBool,
    long_poll: Duration,
    clock: Arc<dyn Clock>,
}

impl MemoryBroker {
    /// Creates an empty broker using the system clock.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(RealClock::new()))
    }

    /// Creates an empty broker stamping receipts with `clock`.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            topics: RwLock::new(HashMap::new()),
            published: Notify::new(),
            closed: AtomicBool::new(false),
            outage: AtomicBool::new(false),
            long_poll: DEFAULT_LONG_POLL,
            clock,
        }
    }

    /// Sets how long a non-immediate consume waits for a new record.
    #[must_use]
    pub fn with_long_poll(mut self, long_poll: Duration) -> Self {
        self.long_poll = long_poll;
        self
    }

    /// Simulates the broker becoming unreachable (`true`) or recovering.
    pub fn set_outage(&self, down: bool) {
        self.outage.store(down, Ordering::Release);
    }

    /// Drops every record below `offset`, raising the topic's minimum
    /// offset. Offsets past the end of the log are clamped to it.
    ///
    /// # Errors
    ///
    /// Returns `BrokerError::TopicNotFound` for an unknown topic.
    pub async fn truncate_before(&self, topic: &str, offset: u64) -> Result<()> {
        let mut topics = self.topics.write().await;
        let log = topics.get_mut(topic).ok_or_else(|| BrokerError::TopicNotFound(topic.into()))?;

        while log.base < offset && log.records.pop_front().is_some() {
            log.base += 1;
        }
        debug!(topic, min_offset = log.base, "truncated topic log");
        Ok(())
    }

    fn ensure_available(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(BrokerError::unavailable("broker closed"));
        }
        if self.outage.load(Ordering::Acquire) {
            return Err(BrokerError::unavailable("broker unreachable"));
        }
        Ok(())
    }

    async fn window(&self, topic: &str) -> Result<(u64, u64)> {
        self.ensure_available()?;
        let topics = self.topics.read().await;
        let log = topics.get(topic).ok_or_else(|| BrokerError::TopicNotFound(topic.into()))?;
        Ok((log.base, log.end()))
    }

    async fn read(&self, topic: &str, offset: u64, max_messages: usize) -> Result<Vec<Record>> {
        self.ensure_available()?;
        let topics = self.topics.read().await;
        let log = topics.get(topic).ok_or_else(|| BrokerError::TopicNotFound(topic.into()))?;
        check_range(offset, log.base, log.end())?;

        let start = usize::try_from(offset - log.base).unwrap_or(usize::MAX);
        Ok(log
            .records
            .iter()
            .skip(start)
            .take(max_messages)
            .zip(offset..)
            .map(|(message, offset)| Record { offset, message: message.clone() })
            .collect())
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MemoryBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryBroker")
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .field("outage", &self.outage.load(Ordering::Relaxed))
            .field("long_poll", &self.long_poll)
            .finish_non_exhaustive()
    }
}

impl Broker for MemoryBroker {
    fn publish(
        &self,
        topic: String,
        mut message: Message,
    ) -> Pin<Box<dyn Future<Output = Result<PublishReceipt>> + Send + '_>> {
        Box::pin(async move {
            self.ensure_available()?;
            let timestamp = self.clock.now_utc();

            let offset = {
                let mut topics = self.topics.write().await;
                let log =
                    topics.get_mut(&topic).ok_or_else(|| BrokerError::TopicNotFound(topic.clone()))?;
                let offset = log.end();
                message.message_id = offset.to_string();
                log.records.push_back(message);
                offset
            };
            self.published.notify_waiters();

            Ok(PublishReceipt { message_id: offset.to_string(), partition: 0, offset, timestamp })
        })
    }

    fn min_offset(&self, topic: String) -> Pin<Box<dyn Future<Output = Result<u64>> + Send + '_>> {
        Box::pin(async move { self.window(&topic).await.map(|(min, _)| min) })
    }

    fn max_offset(&self, topic: String) -> Pin<Box<dyn Future<Output = Result<u64>> + Send + '_>> {
        Box::pin(async move { self.window(&topic).await.map(|(_, max)| max) })
    }

    fn consume(
        &self,
        topic: String,
        offset: u64,
        max_messages: usize,
        immediate: bool,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<Record>>> + Send + '_>> {
        Box::pin(async move {
            let notified = self.published.notified();
            let records = self.read(&topic, offset, max_messages).await?;
            if immediate || max_messages == 0 || !records.is_empty() {
                return Ok(records);
            }

            let _ = tokio::time::timeout(self.long_poll, notified).await;
            self.read(&topic, offset, max_messages).await
        })
    }

    fn create_topic(&self, topic: String) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        Box::pin(async move {
            self.ensure_available()?;
            let mut topics = self.topics.write().await;
            if topics.contains_key(&topic) {
                return Err(BrokerError::TopicExists(topic));
            }
            topics.insert(topic, TopicLog::default());
            Ok(())
        })
    }

    fn delete_topic(&self, topic: String) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        Box::pin(async move {
            self.ensure_available()?;
            let removed = self.topics.write().await.remove(&topic);
            removed.map(|_| ()).ok_or(BrokerError::TopicNotFound(topic))
        })
    }

    fn close(&self) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(async move {
            if !self.closed.swap(true, Ordering::AcqRel) {
                self.topics.write().await.clear();
                self.published.notify_waiters();
                debug!("memory broker closed");
            }
        })
    }
}
