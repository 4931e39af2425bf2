//! Client-driven consumption for pull subscriptions.
//!
//! A pull hands out one batch and reserves it with a pending ack; the batch
//! is committed only when the client acknowledges it. A batch that is not
//! acknowledged within the subscription's ack deadline is superseded by the
//! next pull, which re-reads from the unmoved offset.

use ferry_broker::{BrokerError, Record};
use ferry_core::{Message, OffsetUpdate, PendingAck, Subscription, SubscriptionKey};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::{
    context::DeliveryContext,
    error::{DeliveryError, Result},
};

/// A pulled message and the ID that acknowledges it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReceivedMessage {
    /// `{subscription path}:{offset}`.
    pub ack_id: String,
    /// The message itself.
    pub message: Message,
}

/// Pull and acknowledge operations for pull subscriptions.
#[derive(Clone)]
pub struct PullService {
    context: DeliveryContext,
}

impl PullService {
    /// Creates a pull service over the shared collaborators.
    pub fn new(context: DeliveryContext) -> Self {
        Self { context }
    }

    /// Hands out the next batch of a pull subscription.
    ///
    /// `max_messages` is clamped to `[1, max_pull_messages]`. With
    /// `immediate = false` the broker may wait briefly for new records. An
    /// empty result reserves nothing.
    ///
    /// # Errors
    ///
    /// - `DeliveryError::NotFound` for unknown subscriptions
    /// - `DeliveryError::InvalidSubscription` for push subscriptions
    /// - `DeliveryError::AckPending` while an unexpired batch is outstanding
    /// - `DeliveryError::StaleWrite` if a concurrent pull reserved first
    /// - broker and storage failures
    pub async fn pull_once(
        &self,
        key: &SubscriptionKey,
        max_messages: u32,
        immediate: bool,
    ) -> Result<Vec<ReceivedMessage>> {
        let mut subscription = self.context.store.load_subscription(key.clone()).await?;
        if subscription.push.is_some() {
            return Err(DeliveryError::invalid_subscription(format!(
                "{key} is a push subscription"
            )));
        }

        let now = self.context.clock.now_utc();
        if let Some(pending) = &subscription.cursor.pending_ack {
            if !pending.is_expired(subscription.ack_deadline(), now) {
                return Err(DeliveryError::AckPending { subscription: key.to_string() });
            }
            debug!(
                subscription = %key,
                end_offset = pending.end_offset,
                "pending batch expired, redelivering from committed offset"
            );
        }

        let limit = max_messages.clamp(1, self.context.config.max_pull_messages.max(1));
        let records = self.read(&mut subscription, limit, immediate).await?;
        let Some(last) = records.last() else {
            return Ok(Vec::new());
        };

        let pending = PendingAck::new(last.offset + 1, now);
        let update = OffsetUpdate::reserve(&subscription.cursor, pending);
        self.context.store.update_offsets(key.clone(), update).await?;

        let count = records.len() as u64;
        let bytes = records.iter().map(|r| r.message.size()).sum();
        if let Err(e) = self.context.store.increment_stats(key.clone(), count, bytes, now).await {
            warn!(subscription = %key, error = %e, "failed to record consume statistics");
        }

        debug!(subscription = %key, offset = subscription.cursor.next_offset, count, "pulled batch");

        let path = key.to_string();
        Ok(records
            .into_iter()
            .map(|record| ReceivedMessage {
                ack_id: format!("{path}:{}", record.offset),
                message: record.message,
            })
            .collect())
    }

    /// Acknowledges pulled messages.
    ///
    /// Acknowledgment is cumulative: the committed offset moves to one past
    /// the highest acknowledged offset. Anything after it stays pending.
    /// An empty list is a no-op.
    ///
    /// # Errors
    ///
    /// - `DeliveryError::InvalidAckId` for IDs of another subscription or
    ///   outside the pending batch
    /// - `DeliveryError::AckTimeout` when nothing is pending or the ack
    ///   deadline has passed
    /// - `DeliveryError::StaleWrite` if the cursor changed concurrently
    pub async fn acknowledge(&self, key: &SubscriptionKey, ack_ids: &[String]) -> Result<()> {
        if ack_ids.is_empty() {
            return Ok(());
        }

        let subscription = self.context.store.load_subscription(key.clone()).await?;
        let cursor = &subscription.cursor;
        let now = self.context.clock.now_utc();

        let pending = match &cursor.pending_ack {
            Some(pending) if !pending.is_expired(subscription.ack_deadline(), now) => pending,
            _ => return Err(DeliveryError::AckTimeout { subscription: key.to_string() }),
        };

        let path = key.to_string();
        let mut highest = None;
        for ack_id in ack_ids {
            let offset = parse_ack_id(ack_id, &path)
                .filter(|offset| (cursor.next_offset..pending.end_offset).contains(offset))
                .ok_or_else(|| DeliveryError::InvalidAckId { ack_id: ack_id.clone() })?;
            highest = highest.max(Some(offset));
        }
        let Some(highest) = highest else {
            return Ok(());
        };

        let new_offset = highest + 1;
        let remaining = (new_offset < pending.end_offset).then(|| pending.clone());
        let update = OffsetUpdate::advance(cursor, new_offset, remaining);
        self.context.store.update_offsets(key.clone(), update).await?;

        info!(
            subscription = %key,
            offset = new_offset,
            count = new_offset - cursor.next_offset,
            "pull batch acknowledged"
        );
        Ok(())
    }

    /// Reads from the subscription's next offset, resynchronizing once if
    /// retention has moved past it.
    async fn read(
        &self,
        subscription: &mut Subscription,
        limit: u32,
        immediate: bool,
    ) -> Result<Vec<Record>> {
        let topic = subscription.broker_topic();
        let limit = usize::try_from(limit).unwrap_or(usize::MAX);

        let consumed = self
            .context
            .broker
            .consume(topic.clone(), subscription.cursor.next_offset, limit, immediate)
            .await;

        match consumed {
            Ok(records) => Ok(records),
            Err(e) if e.is_offset_too_new() => Ok(Vec::new()),
            Err(BrokerError::OffsetOutOfRange { requested, min, .. }) if requested < min => {
                warn!(
                    subscription = %subscription.key,
                    requested,
                    min_offset = min,
                    lost = min - requested,
                    "offset fell behind retention, resyncing to oldest available message"
                );
                let update = OffsetUpdate::resync(&subscription.cursor, min);
                self.context.store.update_offsets(subscription.key.clone(), update.clone()).await?;
                subscription.apply(&update)?;

                match self.context.broker.consume(topic, min, limit, immediate).await {
                    Err(e) if e.is_offset_too_new() => Ok(Vec::new()),
                    other => Ok(other?),
                }
            },
            Err(e) => Err(e.into()),
        }
    }
}

fn parse_ack_id(ack_id: &str, subscription_path: &str) -> Option<u64> {
    let (path, offset) = ack_id.rsplit_once(':')?;
    if path != subscription_path {
        return None;
    }
    offset.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    const PATH: &str = "projects/00000000-0000-0000-0000-000000000000/subscriptions/s";

    #[test]
    fn ack_id_parses_offset() {
        assert_eq!(parse_ack_id(&format!("{PATH}:42"), PATH), Some(42));
    }

    #[test]
    fn ack_id_of_other_subscription_rejected() {
        let other = "projects/00000000-0000-0000-0000-000000000000/subscriptions/t:1";
        assert_eq!(parse_ack_id(other, PATH), None);
    }

    #[test]
    fn malformed_ack_ids_rejected() {
        assert_eq!(parse_ack_id("garbage", PATH), None);
        assert_eq!(parse_ack_id(&format!("{PATH}:x"), PATH), None);
        assert_eq!(parse_ack_id(&format!("{PATH}:-1"), PATH), None);
    }
}
