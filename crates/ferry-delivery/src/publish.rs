//! Publishing messages to a project's topics.

use ferry_core::{Message, ProjectId};
use tracing::{debug, warn};

use crate::{context::DeliveryContext, error::Result};

/// Appends messages to topics and keeps their traffic statistics.
#[derive(Clone)]
pub struct Publisher {
    context: DeliveryContext,
}

impl Publisher {
    /// Creates a publisher over the shared collaborators.
    pub fn new(context: DeliveryContext) -> Self {
        Self { context }
    }

    /// Publishes messages in order and returns their broker-assigned IDs.
    ///
    /// Each message is stamped with the current publish time. Statistics are
    /// recorded once for the messages that made it into the log.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::NotFound` if the topic is unknown and a broker
    /// error if a publish fails. Messages published before the failure stay
    /// in the log.
    pub async fn publish(
        &self,
        project_id: ProjectId,
        topic: &str,
        messages: Vec<Message>,
    ) -> Result<Vec<String>> {
        let topic = self.context.store.load_topic(project_id, topic.to_string()).await?;
        let stream = topic.broker_name();
        let now = self.context.clock.now_utc();

        let mut message_ids = Vec::with_capacity(messages.len());
        let mut bytes = 0;
        let mut failure = None;

        for mut message in messages {
            message.publish_time = now;
            let size = message.size();
            match self.context.broker.publish(stream.clone(), message).await {
                Ok(receipt) => {
                    debug!(topic = %stream, offset = receipt.offset, "message published");
                    bytes += size;
                    message_ids.push(receipt.message_id);
                },
                Err(e) => {
                    failure = Some(e);
                    break;
                },
            }
        }

        if !message_ids.is_empty() {
            let count = message_ids.len() as u64;
            if let Err(e) = self
                .context
                .store
                .increment_topic_stats(project_id, topic.name.clone(), count, bytes, now)
                .await
            {
                warn!(topic = %stream, error = %e, "failed to record publish statistics");
            }
        }

        match failure {
            Some(e) => {
                warn!(topic = %stream, published = message_ids.len(), error = %e, "publish failed");
                Err(e.into())
            },
            None => Ok(message_ids),
        }
    }
}
