//! Database access layer for the topic and subscription catalog.
//!
//! Repositories translate between domain models and the Postgres schema.
//! Cursor writes are compare-and-set on `next_offset` so concurrent workers
//! and pull clients cannot silently overwrite each other.

use std::sync::Arc;

use sqlx::PgPool;

pub mod subscriptions;
pub mod topics;

use crate::error::Result;

/// Catalog schema. Every statement is idempotent.
const SCHEMA: &[&str] = &[
    r"
    CREATE TABLE IF NOT EXISTS topics (
        project_id UUID NOT NULL,
        name TEXT NOT NULL,
        msg_num BIGINT NOT NULL DEFAULT 0,
        total_bytes BIGINT NOT NULL DEFAULT 0,
        latest_publish TIMESTAMPTZ,
        publish_rate DOUBLE PRECISION NOT NULL DEFAULT 0,
        acl TEXT[] NOT NULL DEFAULT '{}',
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        PRIMARY KEY (project_id, name)
    )
    ",
    r"
    CREATE TABLE IF NOT EXISTS subscriptions (
        project_id UUID NOT NULL,
        name TEXT NOT NULL,
        topic TEXT NOT NULL,
        committed_offset BIGINT NOT NULL DEFAULT 0,
        next_offset BIGINT NOT NULL DEFAULT 0,
        pending_ack TEXT,
        pending_end_offset BIGINT,
        pending_since TIMESTAMPTZ,
        ack_deadline_seconds INTEGER NOT NULL DEFAULT 10,
        push_endpoint TEXT,
        max_messages INTEGER NOT NULL DEFAULT 1,
        retry_policy TEXT NOT NULL DEFAULT 'none',
        retry_period_seconds INTEGER NOT NULL DEFAULT 0,
        verification_hash TEXT NOT NULL DEFAULT '',
        verified BOOLEAN NOT NULL DEFAULT FALSE,
        msg_num BIGINT NOT NULL DEFAULT 0,
        total_bytes BIGINT NOT NULL DEFAULT 0,
        latest_consume TIMESTAMPTZ,
        consume_rate DOUBLE PRECISION NOT NULL DEFAULT 0,
        acl TEXT[] NOT NULL DEFAULT '{}',
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        PRIMARY KEY (project_id, name),
        CHECK (next_offset >= committed_offset),
        CHECK (committed_offset >= 0)
    )
    ",
    r"
    CREATE INDEX IF NOT EXISTS idx_subscriptions_push
        ON subscriptions (project_id, name)
        WHERE push_endpoint IS NOT NULL
    ",
];

/// Container for all repository instances.
#[derive(Clone)]
pub struct Storage {
    /// Repository for subscriptions and their cursors.
    pub subscriptions: Arc<subscriptions::Repository>,

    /// Repository for topics.
    pub topics: Arc<topics::Repository>,
}

impl Storage {
    /// Creates a new storage instance with the given connection pool.
    pub fn new(pool: PgPool) -> Self {
        let pool = Arc::new(pool);

        Self {
            subscriptions: Arc::new(subscriptions::Repository::new(pool.clone())),
            topics: Arc::new(topics::Repository::new(pool)),
        }
    }

    /// Creates the catalog tables if they do not exist.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Database` if any DDL statement fails.
    pub async fn initialize(&self) -> Result<()> {
        let pool = self.subscriptions.pool();
        for statement in SCHEMA {
            sqlx::query(statement).execute(&*pool).await?;
        }
        Ok(())
    }

    /// Verifies database connectivity.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Database` if the connection is unhealthy.
    pub async fn health_check(&self) -> Result<()> {
        let _: (i32,) = sqlx::query_as("SELECT 1").fetch_one(&*self.subscriptions.pool()).await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn storage_can_be_created() {
        let pool = sqlx::PgPool::connect_lazy("postgresql://test").unwrap();
        let _storage = Storage::new(pool);
    }

    #[test]
    fn schema_statements_are_idempotent() {
        for statement in SCHEMA {
            assert!(statement.contains("IF NOT EXISTS"), "{statement}");
        }
    }
}
