//! Repository for topics and their publish statistics.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::PgPool;

use crate::{
    error::{CoreError, Result},
    models::{ProjectId, Topic},
};

/// Repository for topic database operations.
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

    /// Inserts a new topic.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Conflict` if the name is taken within the project.
    pub async fn create(&self, topic: &Topic) -> Result<()> {
        sqlx::query("INSERT INTO topics (project_id, name, acl) VALUES ($1, $2, $3)")
            .bind(topic.project_id)
            .bind(&topic.name)
            .bind(&topic.acl)
            .execute(&*self.pool)
            .await?;

        Ok(())
    }

    /// Finds a topic by project and name.
    ///
    /// # Errors
    ///
    /// Returns error if query fails.
    pub async fn find(&self, project_id: ProjectId, name: &str) -> Result<Option<Topic>> {
        let topic = sqlx::query_as::<_, Topic>(
            r"
            SELECT project_id, name, msg_num, total_bytes, latest_publish, publish_rate, acl
            FROM topics
            WHERE project_id = $1 AND name = $2
            ",
        )
        .bind(project_id)
        .bind(name)
        .fetch_optional(&*self.pool)
        .await?;

        Ok(topic)
    }

    /// Lists the topics of a project, ordered by name.
    ///
    /// # Errors
    ///
    /// Returns error if query fails.
    pub async fn list_by_project(&self, project_id: ProjectId) -> Result<Vec<Topic>> {
        let topics = sqlx::query_as::<_, Topic>(
            r"
            SELECT project_id, name, msg_num, total_bytes, latest_publish, publish_rate, acl
            FROM topics
            WHERE project_id = $1
            ORDER BY name
            ",
        )
        .bind(project_id)
        .fetch_all(&*self.pool)
        .await?;

        Ok(topics)
    }

    /// Adds a published batch to the topic's statistics.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::NotFound` if the topic no longer exists.
    pub async fn increment_stats(
        &self,
        project_id: ProjectId,
        name: &str,
        message_count: u64,
        byte_count: u64,
        at: DateTime<Utc>,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let topic = sqlx::query_as::<_, Topic>(
            r"
            SELECT project_id, name, msg_num, total_bytes, latest_publish, publish_rate, acl
            FROM topics
            WHERE project_id = $1 AND name = $2
            FOR UPDATE
            ",
        )
        .bind(project_id)
        .bind(name)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| CoreError::NotFound(format!("topic {project_id}/{name}")))?;

        let mut stats = topic.stats;
        stats.record(message_count, byte_count, at);

        let count = i64::try_from(stats.message_count)
            .map_err(|_| CoreError::InvalidInput("message count out of range".to_string()))?;
        let bytes = i64::try_from(stats.byte_count)
            .map_err(|_| CoreError::InvalidInput("byte count out of range".to_string()))?;

        sqlx::query(
            r"
            UPDATE topics
            SET msg_num = $3, total_bytes = $4, latest_publish = $5, publish_rate = $6
            WHERE project_id = $1 AND name = $2
            ",
        )
        .bind(project_id)
        .bind(name)
        .bind(count)
        .bind(bytes)
        .bind(stats.latest)
        .bind(stats.rate)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    /// Replaces the identities allowed to publish to the topic.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::NotFound` if the topic does not exist.
    pub async fn set_acl(&self, project_id: ProjectId, name: &str, acl: &[String]) -> Result<()> {
        let result = sqlx::query("UPDATE topics SET acl = $3 WHERE project_id = $1 AND name = $2")
            .bind(project_id)
            .bind(name)
            .bind(acl)
            .execute(&*self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(CoreError::NotFound(format!("topic {project_id}/{name}")));
        }
        Ok(())
    }

    /// Deletes a topic. Returns false if it did not exist.
    ///
    /// # Errors
    ///
    /// Returns error if query fails.
    pub async fn delete(&self, project_id: ProjectId, name: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM topics WHERE project_id = $1 AND name = $2")
            .bind(project_id)
            .bind(name)
            .execute(&*self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }
}
