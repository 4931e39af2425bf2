//! Engine configuration and the shared handles passed to every worker.

use std::{sync::Arc, time::Duration};

use ferry_broker::Broker;
use ferry_core::Clock;
use serde::{Deserialize, Serialize};

use crate::{
    client::{ClientConfig, PushSender},
    retry::BackoffPolicy,
    storage::SubscriptionStore,
};

/// Configuration for push workers, the manager and the pull path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryConfig {
    /// Pause after an empty consume or an abandoned batch.
    pub poll_interval: Duration,

    /// Pause between failed verification handshakes.
    pub verification_interval: Duration,

    /// Backoff while the broker or storage is unavailable.
    pub backoff: BackoffPolicy,

    /// HTTP client configuration.
    pub client_config: ClientConfig,

    /// Maximum time to wait for workers to stop.
    pub shutdown_timeout: Duration,

    /// Upper bound on messages returned by a single pull.
    pub max_pull_messages: u32,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            verification_interval: Duration::from_secs(5),
            backoff: BackoffPolicy::default(),
            client_config: ClientConfig::default(),
            shutdown_timeout: Duration::from_secs(30),
            max_pull_messages: crate::DEFAULT_MAX_PULL_MESSAGES,
        }
    }
}

/// Process-wide collaborators, constructed once at startup.
///
/// Cloning is cheap; every field is shared.
#[derive(Clone)]
pub struct DeliveryContext {
    /// Broker holding topic logs.
    pub broker: Arc<dyn Broker>,
    /// Subscription and topic catalog.
    pub store: Arc<dyn SubscriptionStore>,
    /// Transport for push endpoints.
    pub sender: Arc<dyn PushSender>,
    /// Time source.
    pub clock: Arc<dyn Clock>,
    /// Engine settings.
    pub config: DeliveryConfig,
}

impl DeliveryContext {
    /// Bundles the collaborators with a configuration.
    pub fn new(
        broker: Arc<dyn Broker>,
        store: Arc<dyn SubscriptionStore>,
        sender: Arc<dyn PushSender>,
        clock: Arc<dyn Clock>,
        config: DeliveryConfig,
    ) -> Self {
        Self { broker, store, sender, clock, config }
    }
}
