//! Repository for subscription records and their consumption cursors.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::PgPool;

use crate::{
    error::{CoreError, Result},
    models::{OffsetUpdate, ProjectId, PushConfig, Subscription, SubscriptionKey},
};

const SELECT_COLUMNS: &str = r"
    SELECT project_id, name, topic, committed_offset, next_offset,
           pending_ack, pending_end_offset, pending_since, ack_deadline_seconds,
           push_endpoint, max_messages, retry_policy, retry_period_seconds,
           verification_hash, verified,
           msg_num, total_bytes, latest_consume, consume_rate, acl
    FROM subscriptions
";

fn to_i64(value: u64, what: &str) -> Result<i64> {
    i64::try_from(value).map_err(|_| CoreError::InvalidInput(format!("{what} out of range: {value}")))
}

fn to_i32(value: u32, what: &str) -> Result<i32> {
    i32::try_from(value).map_err(|_| CoreError::InvalidInput(format!("{what} out of range: {value}")))
}

/// Repository for subscription database operations.
pub struct Repository {
    pool: Arc<PgPool>,
}

impl Repository {
    /// Creates a new repository instance.
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    /// Returns a reference to the database pool.
    pub fn pool(&self) -> Arc<PgPool> {
        self.pool.clone()
    }

    /// Inserts a new subscription.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Conflict` if the name is taken within the project.
    pub async fn create(&self, subscription: &Subscription) -> Result<()> {
        let push = subscription.push.as_ref();
        let pending = subscription.cursor.pending_ack.as_ref();

        sqlx::query(
            r"
            INSERT INTO subscriptions (
                project_id, name, topic, committed_offset, next_offset,
                pending_ack, pending_end_offset, pending_since, ack_deadline_seconds,
                push_endpoint, max_messages, retry_policy, retry_period_seconds,
                verification_hash, verified, acl
            ) VALUES (
                $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16
            )
            ",
        )
        .bind(subscription.key.project_id)
        .bind(&subscription.key.name)
        .bind(&subscription.topic)
        .bind(to_i64(subscription.cursor.offset, "offset")?)
        .bind(to_i64(subscription.cursor.next_offset, "next offset")?)
        .bind(pending.map(|p| p.token.clone()))
        .bind(pending.map(|p| to_i64(p.end_offset, "pending end offset")).transpose()?)
        .bind(pending.map(|p| p.since))
        .bind(to_i32(subscription.ack_deadline_seconds, "ack deadline")?)
        .bind(push.map(|p| p.endpoint.clone()))
        .bind(to_i32(push.map_or(1, |p| p.max_messages), "max messages")?)
        .bind(push.map_or_else(|| "none".to_string(), |p| p.retry.kind.to_string()))
        .bind(to_i32(push.map_or(0, |p| p.retry.period_seconds), "retry period")?)
        .bind(push.map_or_else(String::new, |p| p.verification_hash.clone()))
        .bind(push.is_some_and(|p| p.verified))
        .bind(&subscription.acl)
        .execute(&*self.pool)
        .await?;

        Ok(())
    }

    /// Finds a subscription by key.
    ///
    /// # Errors
    ///
    /// Returns error if query fails.
    pub async fn find(&self, key: &SubscriptionKey) -> Result<Option<Subscription>> {
        let subscription = sqlx::query_as::<_, Subscription>(&format!(
            "{SELECT_COLUMNS} WHERE project_id = $1 AND name = $2"
        ))
        .bind(key.project_id)
        .bind(&key.name)
        .fetch_optional(&*self.pool)
        .await?;

        Ok(subscription)
    }

    /// Lists every subscription with a push endpoint.
    ///
    /// # Errors
    ///
    /// Returns error if query fails or a row cannot be decoded.
    pub async fn list_push(&self) -> Result<Vec<Subscription>> {
        let subscriptions = sqlx::query_as::<_, Subscription>(&format!(
            "{SELECT_COLUMNS} WHERE push_endpoint IS NOT NULL ORDER BY project_id, name"
        ))
        .fetch_all(&*self.pool)
        .await?;

        Ok(subscriptions)
    }

    /// Lists the subscriptions of a project, ordered by name.
    ///
    /// # Errors
    ///
    /// Returns error if query fails.
    pub async fn list_by_project(&self, project_id: ProjectId) -> Result<Vec<Subscription>> {
        let subscriptions = sqlx::query_as::<_, Subscription>(&format!(
            "{SELECT_COLUMNS} WHERE project_id = $1 ORDER BY name"
        ))
        .bind(project_id)
        .fetch_all(&*self.pool)
        .await?;

        Ok(subscriptions)
    }

    /// Lists the subscriptions attached to a topic.
    ///
    /// # Errors
    ///
    /// Returns error if query fails.
    pub async fn list_by_topic(
        &self,
        project_id: ProjectId,
        topic: &str,
    ) -> Result<Vec<Subscription>> {
        let subscriptions = sqlx::query_as::<_, Subscription>(&format!(
            "{SELECT_COLUMNS} WHERE project_id = $1 AND topic = $2 ORDER BY name"
        ))
        .bind(project_id)
        .bind(topic)
        .fetch_all(&*self.pool)
        .await?;

        Ok(subscriptions)
    }

    /// Applies a compare-and-set cursor update.
    ///
    /// The write only lands if the stored `next_offset` still equals
    /// `update.expected_next_offset`, the stored pending token still equals
    /// `update.expected_pending`, and the committed offset does not move
    /// backwards.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Conflict` if the row changed underneath the caller,
    /// `CoreError::NotFound` if it no longer exists, and
    /// `CoreError::InvalidInput` for an update that breaks cursor ordering.
    pub async fn update_offsets(&self, key: &SubscriptionKey, update: &OffsetUpdate) -> Result<()> {
        if update.next_offset < update.offset {
            return Err(CoreError::InvalidInput(format!(
                "next offset {} behind committed offset {}",
                update.next_offset, update.offset
            )));
        }
        let pending = update.pending_ack.as_ref();

        let result = sqlx::query(
            r"
            UPDATE subscriptions
            SET committed_offset = $3,
                next_offset = $4,
                pending_ack = $5,
                pending_end_offset = $6,
                pending_since = $7
            WHERE project_id = $1 AND name = $2
              AND next_offset = $8
              AND pending_ack IS NOT DISTINCT FROM $9
              AND committed_offset <= $3
            ",
        )
        .bind(key.project_id)
        .bind(&key.name)
        .bind(to_i64(update.offset, "offset")?)
        .bind(to_i64(update.next_offset, "next offset")?)
        .bind(pending.map(|p| p.token.clone()))
        .bind(pending.map(|p| to_i64(p.end_offset, "pending end offset")).transpose()?)
        .bind(pending.map(|p| p.since))
        .bind(to_i64(update.expected_next_offset, "expected next offset")?)
        .bind(update.expected_pending.as_deref())
        .execute(&*self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return match self.find(key).await? {
                Some(current) => Err(CoreError::Conflict(format!(
                    "{key}: expected next offset {} and pending {:?}, found {} and {:?}",
                    update.expected_next_offset,
                    update.expected_pending,
                    current.cursor.next_offset,
                    current.cursor.pending_token()
                ))),
                None => Err(CoreError::NotFound(format!("subscription {key}"))),
            };
        }

        Ok(())
    }

    /// Adds a consumed batch to the subscription's statistics.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::NotFound` if the subscription no longer exists.
    pub async fn increment_stats(
        &self,
        key: &SubscriptionKey,
        message_count: u64,
        byte_count: u64,
        at: DateTime<Utc>,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let subscription = sqlx::query_as::<_, Subscription>(&format!(
            "{SELECT_COLUMNS} WHERE project_id = $1 AND name = $2 FOR UPDATE"
        ))
        .bind(key.project_id)
        .bind(&key.name)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| CoreError::NotFound(format!("subscription {key}")))?;

        let mut stats = subscription.stats;
        stats.record(message_count, byte_count, at);

        sqlx::query(
            r"
            UPDATE subscriptions
            SET msg_num = $3, total_bytes = $4, latest_consume = $5, consume_rate = $6
            WHERE project_id = $1 AND name = $2
            ",
        )
        .bind(key.project_id)
        .bind(&key.name)
        .bind(to_i64(stats.message_count, "message count")?)
        .bind(to_i64(stats.byte_count, "byte count")?)
        .bind(stats.latest)
        .bind(stats.rate)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    /// Records that the push endpoint passed verification.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::NotFound` if the subscription no longer exists.
    pub async fn mark_verified(&self, key: &SubscriptionKey) -> Result<()> {
        let result = sqlx::query(
            "UPDATE subscriptions SET verified = TRUE WHERE project_id = $1 AND name = $2",
        )
        .bind(key.project_id)
        .bind(&key.name)
        .execute(&*self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(CoreError::NotFound(format!("subscription {key}")));
        }
        Ok(())
    }

    /// Replaces the push configuration. `None` turns the subscription into a
    /// pull subscription.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::NotFound` if the subscription no longer exists.
    pub async fn update_push_config(
        &self,
        key: &SubscriptionKey,
        push: Option<&PushConfig>,
    ) -> Result<()> {
        let result = sqlx::query(
            r"
            UPDATE subscriptions
            SET push_endpoint = $3, max_messages = $4, retry_policy = $5,
                retry_period_seconds = $6, verification_hash = $7, verified = $8
            WHERE project_id = $1 AND name = $2
            ",
        )
        .bind(key.project_id)
        .bind(&key.name)
        .bind(push.map(|p| p.endpoint.clone()))
        .bind(to_i32(push.map_or(1, |p| p.max_messages), "max messages")?)
        .bind(push.map_or_else(|| "none".to_string(), |p| p.retry.kind.to_string()))
        .bind(to_i32(push.map_or(0, |p| p.retry.period_seconds), "retry period")?)
        .bind(push.map_or_else(String::new, |p| p.verification_hash.clone()))
        .bind(push.is_some_and(|p| p.verified))
        .execute(&*self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(CoreError::NotFound(format!("subscription {key}")));
        }
        Ok(())
    }

    /// Replaces the identities allowed to consume from the subscription.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::NotFound` if the subscription no longer exists.
    pub async fn set_acl(&self, key: &SubscriptionKey, acl: &[String]) -> Result<()> {
        let result =
            sqlx::query("UPDATE subscriptions SET acl = $3 WHERE project_id = $1 AND name = $2")
                .bind(key.project_id)
                .bind(&key.name)
                .bind(acl)
                .execute(&*self.pool)
                .await?;

        if result.rows_affected() == 0 {
            return Err(CoreError::NotFound(format!("subscription {key}")));
        }
        Ok(())
    }

    /// Deletes a subscription. Returns false if it did not exist.
    ///
    /// # Errors
    ///
    /// Returns error if query fails.
    pub async fn delete(&self, key: &SubscriptionKey) -> Result<bool> {
        let result = sqlx::query("DELETE FROM subscriptions WHERE project_id = $1 AND name = $2")
            .bind(key.project_id)
            .bind(&key.name)
            .execute(&*self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn out_of_range_offsets_rejected() {
        assert!(to_i64(u64::MAX, "offset").is_err());
        assert_eq!(to_i64(42, "offset").unwrap(), 42);
        assert!(to_i32(u32::MAX, "ack deadline").is_err());
    }
}
