//! Shared fixtures for delivery integration tests.

#![allow(dead_code)]

use std::{collections::BTreeMap, future::Future, sync::Arc, time::Duration};

use anyhow::{bail, Result};
use ferry_broker::{Broker, MemoryBroker};
use ferry_core::{
    Clock, Message, ProjectId, PushConfig, RetryPolicy, Subscription, SubscriptionKey, TestClock,
    Topic,
};
use ferry_delivery::{
    client::mock::ScriptedSender, storage::mock::MockSubscriptionStore, DeliveryConfig,
    DeliveryContext,
};

/// In-memory collaborators wired the way the service wires production ones.
pub struct TestEnv {
    pub clock: TestClock,
    pub broker: Arc<MemoryBroker>,
    pub store: MockSubscriptionStore,
    pub sender: ScriptedSender,
    pub project: ProjectId,
    pub config: DeliveryConfig,
}

impl TestEnv {
    pub fn new() -> Self {
        let clock = TestClock::new();
        let broker = MemoryBroker::with_clock(Arc::new(clock.clone()))
            .with_long_poll(Duration::from_millis(50));

        Self {
            broker: Arc::new(broker),
            clock,
            store: MockSubscriptionStore::new(),
            sender: ScriptedSender::new(),
            project: ProjectId::new(),
            config: DeliveryConfig::default(),
        }
    }

    pub fn context(&self) -> DeliveryContext {
        self.context_with_clock(Arc::new(self.clock.clone()))
    }

    pub fn context_with_clock(&self, clock: Arc<dyn Clock>) -> DeliveryContext {
        DeliveryContext::new(
            self.broker.clone(),
            Arc::new(self.store.clone()),
            Arc::new(self.sender.clone()),
            clock,
            self.config.clone(),
        )
    }

    /// Registers a topic in the catalog and the broker, then publishes
    /// `count` messages with payloads `m0..`.
    pub async fn topic(&self, name: &str, count: usize) -> Result<Topic> {
        let topic = Topic::new(self.project, name);
        self.store.add_topic(topic.clone()).await;
        self.broker.create_topic(topic.broker_name()).await?;
        self.publish(&topic, count).await?;
        Ok(topic)
    }

    pub async fn publish(&self, topic: &Topic, count: usize) -> Result<()> {
        let start = self.broker.max_offset(topic.broker_name()).await?;
        for i in 0..count as u64 {
            let message = Message::new(format!("m{}", start + i).into_bytes(), BTreeMap::new());
            self.broker.publish(topic.broker_name(), message).await?;
        }
        Ok(())
    }

    pub fn key(&self, name: &str) -> SubscriptionKey {
        SubscriptionKey::new(self.project, name)
    }

    /// Stores a verified push subscription.
    pub async fn push_subscription(
        &self,
        name: &str,
        topic: &str,
        max_messages: u32,
        retry: RetryPolicy,
    ) -> Subscription {
        let mut push = PushConfig::new("https://push.example.com/hook", max_messages, retry);
        push.verified = true;
        let subscription = Subscription::push(self.key(name), topic, push);
        self.store.add_subscription(subscription.clone()).await;
        subscription
    }

    pub async fn pull_subscription(&self, name: &str, topic: &str) -> Subscription {
        let subscription = Subscription::pull(self.key(name), topic);
        self.store.add_subscription(subscription.clone()).await;
        subscription
    }

    pub async fn stored(&self, key: &SubscriptionKey) -> Result<Subscription> {
        match self.store.subscription(key).await {
            Some(subscription) => Ok(subscription),
            None => bail!("subscription {key} missing from store"),
        }
    }
}

/// Polls `check` until it holds, failing after five seconds of real time.
pub async fn wait_until<F, Fut>(what: &str, mut check: F) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !check().await {
        if tokio::time::Instant::now() >= deadline {
            bail!("timed out waiting until {what}");
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    Ok(())
}
