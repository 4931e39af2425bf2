//! PostgreSQL-backed broker adapter.
//!
//! Each topic owns a row in `broker_topics` holding its retention floor and
//! the offset the next record receives. Records live in `broker_records`
//! keyed by `(topic, record_offset)` with the message stored as JSONB.
//! Offsets are allocated inside the publishing transaction so concurrent
//! publishers never share or skip an offset.

use std::{
    future::Future,
    pin::Pin,
    sync::atomic::{AtomicBool, Ordering},
    time::{Duration, Instant},
};

use chrono::Utc;
use ferry_core::Message;
use sqlx::{postgres::PgPoolOptions, types::Json, PgPool};
use tracing::{debug, info, warn};

use crate::{check_range, Broker, BrokerError, PublishReceipt, Record, Result};

const SCHEMA: &[&str] = &[
    r"
    CREATE TABLE IF NOT EXISTS broker_topics (
        name TEXT PRIMARY KEY,
        min_offset BIGINT NOT NULL DEFAULT 0,
        next_offset BIGINT NOT NULL DEFAULT 0
    )
    ",
    r"
    CREATE TABLE IF NOT EXISTS broker_records (
        topic TEXT NOT NULL REFERENCES broker_topics (name) ON DELETE CASCADE,
        record_offset BIGINT NOT NULL,
        message JSONB NOT NULL,
        published_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        PRIMARY KEY (topic, record_offset)
    )
    ",
];

fn to_i64(value: u64) -> Result<i64> {
    i64::try_from(value).map_err(|_| BrokerError::Codec(format!("offset out of range: {value}")))
}

fn to_u64(value: i64) -> Result<u64> {
    u64::try_from(value).map_err(|_| BrokerError::Codec(format!("negative offset: {value}")))
}

/// Broker storing topic logs in PostgreSQL tables.
pub struct PostgresBroker {
    pool: PgPool,
    closed: AtomicBool,
    poll_interval: Duration,
    long_poll: Duration,
}

impl PostgresBroker {
    /// Connects to the first reachable peer and creates the broker tables.
    ///
    /// # Errors
    ///
    /// Returns `BrokerError::Unavailable` if no peer accepts a connection or
    /// schema creation fails.
    pub async fn initialize(peers: &[String]) -> Result<Self> {
        for peer in peers {
            match PgPoolOptions::new()
                .max_connections(5)
                .acquire_timeout(Duration::from_secs(5))
                .connect(peer)
                .await
            {
                Ok(pool) => {
                    let broker = Self::with_pool(pool);
                    broker.ensure_schema().await?;
                    info!(peers = peers.len(), "broker connected");
                    return Ok(broker);
                },
                Err(e) => warn!(error = %e, "broker peer unreachable, trying next"),
            }
        }

        Err(BrokerError::unavailable("no reachable broker peer"))
    }

    /// Wraps an existing pool. Call [`PostgresBroker::ensure_schema`] before
    /// first use.
    pub fn with_pool(pool: PgPool) -> Self {
        Self {
            pool,
            closed: AtomicBool::new(false),
            poll_interval: Duration::from_millis(100),
            long_poll: Duration::from_millis(500),
        }
    }

    /// Creates the broker tables if they do not exist.
    ///
    /// # Errors
    ///
    /// Returns `BrokerError::Unavailable` if a DDL statement fails.
    pub async fn ensure_schema(&self) -> Result<()> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    /// Drops records below `offset` and raises the topic's minimum offset.
    ///
    /// # Errors
    ///
    /// Returns `BrokerError::TopicNotFound` for an unknown topic.
    pub async fn truncate_before(&self, topic: &str, offset: u64) -> Result<()> {
        self.ensure_open()?;
        let offset = to_i64(offset)?;
        let mut tx = self.pool.begin().await?;

        let min: Option<i64> = sqlx::query_scalar(
            r"
            UPDATE broker_topics
            SET min_offset = GREATEST(min_offset, LEAST($2, next_offset))
            WHERE name = $1
            RETURNING min_offset
            ",
        )
        .bind(topic)
        .bind(offset)
        .fetch_optional(&mut *tx)
        .await?;
        let min = min.ok_or_else(|| BrokerError::TopicNotFound(topic.into()))?;

        sqlx::query("DELETE FROM broker_records WHERE topic = $1 AND record_offset < $2")
            .bind(topic)
            .bind(min)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        debug!(topic, min_offset = min, "truncated topic log");
        Ok(())
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(BrokerError::unavailable("broker closed"));
        }
        Ok(())
    }

    async fn window(&self, topic: &str) -> Result<(u64, u64)> {
        self.ensure_open()?;
        let row: Option<(i64, i64)> =
            sqlx::query_as("SELECT min_offset, next_offset FROM broker_topics WHERE name = $1")
                .bind(topic)
                .fetch_optional(&self.pool)
                .await?;

        let (min, max) = row.ok_or_else(|| BrokerError::TopicNotFound(topic.into()))?;
        Ok((to_u64(min)?, to_u64(max)?))
    }

    /// Reads the window and the records from one snapshot, so retention
    /// running concurrently cannot shift the batch past `offset`.
    async fn read(&self, topic: &str, offset: u64, max_messages: usize) -> Result<Vec<Record>> {
        self.ensure_open()?;
        let mut tx = self.pool.begin().await?;
        sqlx::query("SET TRANSACTION ISOLATION LEVEL REPEATABLE READ READ ONLY")
            .execute(&mut *tx)
            .await?;

        let row: Option<(i64, i64)> =
            sqlx::query_as("SELECT min_offset, next_offset FROM broker_topics WHERE name = $1")
                .bind(topic)
                .fetch_optional(&mut *tx)
                .await?;
        let (min, max) = row.ok_or_else(|| BrokerError::TopicNotFound(topic.into()))?;
        let (min, max) = (to_u64(min)?, to_u64(max)?);

        check_range(offset, min, max)?;
        if offset == max || max_messages == 0 {
            return Ok(Vec::new());
        }

        let rows: Vec<(i64, Json<Message>)> = sqlx::query_as(
            r"
            SELECT record_offset, message
            FROM broker_records
            WHERE topic = $1 AND record_offset >= $2
            ORDER BY record_offset
            LIMIT $3
            ",
        )
        .bind(topic)
        .bind(to_i64(offset)?)
        .bind(i64::try_from(max_messages).unwrap_or(i64::MAX))
        .fetch_all(&mut *tx)
        .await?;
        tx.commit().await?;

        let records = rows
            .into_iter()
            .map(|(offset, Json(message))| Ok(Record { offset: to_u64(offset)?, message }))
            .collect::<Result<Vec<_>>>()?;
        ensure_starts_at(offset, max, &records)?;
        Ok(records)
    }
}

/// Rejects a batch that does not begin at the requested offset. A gap means
/// the records were removed underneath the reader.
fn ensure_starts_at(offset: u64, max: u64, records: &[Record]) -> Result<()> {
    match records.first() {
        Some(first) if first.offset != offset => Err(BrokerError::OffsetOutOfRange {
            requested: offset,
            min: first.offset,
            max,
        }),
        _ => Ok(()),
    }
}

impl std::fmt::Debug for PostgresBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgresBroker")
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .field("poll_interval", &self.poll_interval)
            .finish_non_exhaustive()
    }
}

impl Broker for PostgresBroker {
    fn publish(
        &self,
        topic: String,
        mut message: Message,
    ) -> Pin<Box<dyn Future<Output = Result<PublishReceipt>> + Send + '_>> {
        Box::pin(async move {
            self.ensure_open()?;
            let mut tx = self.pool.begin().await?;

            let offset: Option<i64> = sqlx::query_scalar(
                r"
                UPDATE broker_topics
                SET next_offset = next_offset + 1
                WHERE name = $1
                RETURNING next_offset - 1
                ",
            )
            .bind(&topic)
            .fetch_optional(&mut *tx)
            .await?;
            let offset = offset.ok_or_else(|| BrokerError::TopicNotFound(topic.clone()))?;

            message.message_id = offset.to_string();
            let timestamp = Utc::now();

            sqlx::query(
                r"
                INSERT INTO broker_records (topic, record_offset, message, published_at)
                VALUES ($1, $2, $3, $4)
                ",
            )
            .bind(&topic)
            .bind(offset)
            .bind(Json(&message))
            .bind(timestamp)
            .execute(&mut *tx)
            .await?;

            tx.commit().await?;

            Ok(PublishReceipt {
                message_id: message.message_id,
                partition: 0,
                offset: to_u64(offset)?,
                timestamp,
            })
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
            let started = Instant::now();
            loop {
                let records = self.read(&topic, offset, max_messages).await?;
                if immediate || !records.is_empty() || started.elapsed() >= self.long_poll {
                    return Ok(records);
                }
                tokio::time::sleep(self.poll_interval).await;
            }
        })
    }

    fn create_topic(&self, topic: String) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        Box::pin(async move {
            self.ensure_open()?;
            let result = sqlx::query(
                "INSERT INTO broker_topics (name) VALUES ($1) ON CONFLICT (name) DO NOTHING",
            )
            .bind(&topic)
            .execute(&self.pool)
            .await?;

            if result.rows_affected() == 0 {
                return Err(BrokerError::TopicExists(topic));
            }
            Ok(())
        })
    }

    fn delete_topic(&self, topic: String) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        Box::pin(async move {
            self.ensure_open()?;
            let result = sqlx::query("DELETE FROM broker_topics WHERE name = $1")
                .bind(&topic)
                .execute(&self.pool)
                .await?;

            if result.rows_affected() == 0 {
                return Err(BrokerError::TopicNotFound(topic));
            }
            Ok(())
        })
    }

    fn close(&self) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(async move {
            if !self.closed.swap(true, Ordering::AcqRel) {
                self.pool.close().await;
                info!("broker connections closed");
            }
        })
    }
}
