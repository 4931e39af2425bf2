//! Core domain models and strongly-typed identifiers.
//!
//! Defines projects, topics, subscriptions and their consumption cursors,
//! the message envelope carried through the broker, and the compare-and-set
//! offset update shared by every storage adapter. Database row mapping lives
//! next to the types so repositories only deal in domain values.

use std::{collections::BTreeMap, fmt, str::FromStr, time::Duration};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::Row;
use uuid::Uuid;

use crate::error::{CoreError, Result};

type PgDb = sqlx::Postgres;
type PgRow = sqlx::postgres::PgRow;
type PgValueRef<'r> = sqlx::postgres::PgValueRef<'r>;
type PgTypeInfo = sqlx::postgres::PgTypeInfo;
type PgArgumentBuffer = sqlx::postgres::PgArgumentBuffer;
type EncodeResult =
    std::result::Result<sqlx::encode::IsNull, Box<dyn std::error::Error + Send + Sync + 'static>>;
type BoxDynError = sqlx::error::BoxDynError;

/// Default acknowledgment deadline applied to new subscriptions.
pub const DEFAULT_ACK_DEADLINE_SECONDS: u32 = 10;

/// Strongly-typed project identifier.
///
/// Projects are the tenancy boundary: every topic and subscription belongs to
/// exactly one project and names are only unique within it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ProjectId(pub Uuid);

impl ProjectId {
    /// Creates a new random project ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ProjectId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ProjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for ProjectId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl sqlx::Type<PgDb> for ProjectId {
    fn type_info() -> PgTypeInfo {
        <Uuid as sqlx::Type<PgDb>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, PgDb> for ProjectId {
    fn decode(value: PgValueRef<'r>) -> std::result::Result<Self, BoxDynError> {
        let uuid = <Uuid as sqlx::Decode<PgDb>>::decode(value)?;
        Ok(Self(uuid))
    }
}

impl sqlx::Encode<'_, PgDb> for ProjectId {
    fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> EncodeResult {
        <Uuid as sqlx::Encode<PgDb>>::encode_by_ref(&self.0, buf)
    }
}

/// Name of the broker stream backing a project's topic.
pub fn broker_topic_name(project_id: ProjectId, topic: &str) -> String {
    format!("{project_id}.{topic}")
}

/// Fully-qualified subscription identity.
///
/// Renders as `projects/{uuid}/subscriptions/{name}`, the same form used as
/// the prefix of pull acknowledgment IDs.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SubscriptionKey {
    /// Owning project.
    pub project_id: ProjectId,
    /// Subscription name, unique within the project.
    pub name: String,
}

impl SubscriptionKey {
    /// Creates a key for the named subscription in a project.
    pub fn new(project_id: ProjectId, name: impl Into<String>) -> Self {
        Self { project_id, name: name.into() }
    }
}

impl fmt::Display for SubscriptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "projects/{}/subscriptions/{}", self.project_id, self.name)
    }
}

impl FromStr for SubscriptionKey {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || CoreError::InvalidInput(format!("malformed subscription path: {s}"));

        let rest = s.strip_prefix("projects/").ok_or_else(invalid)?;
        let (project, name) = rest.split_once("/subscriptions/").ok_or_else(invalid)?;
        if name.is_empty() || name.contains('/') {
            return Err(invalid());
        }
        let project_id = Uuid::parse_str(project).map_err(|_| invalid())?;

        Ok(Self::new(ProjectId(project_id), name))
    }
}

/// Retry behavior applied when a push delivery fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum RetryKind {
    /// Retry the same batch every retry period until the ack deadline.
    #[serde(rename = "linear")]
    Linear,
    /// Abandon a failed batch immediately.
    #[default]
    #[serde(rename = "none")]
    Disabled,
}

impl fmt::Display for RetryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Linear => write!(f, "linear"),
            Self::Disabled => write!(f, "none"),
        }
    }
}

impl FromStr for RetryKind {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "linear" => Ok(Self::Linear),
            "" | "none" => Ok(Self::Disabled),
            other => Err(CoreError::InvalidInput(format!("unknown retry policy: {other}"))),
        }
    }
}

/// Retry policy of a push subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Whether failed batches are retried.
    pub kind: RetryKind,
    /// Seconds between retries. Ignored when retries are disabled.
    pub period_seconds: u32,
}

impl RetryPolicy {
    /// Linear retry every `period_seconds`.
    pub fn linear(period_seconds: u32) -> Self {
        Self { kind: RetryKind::Linear, period_seconds }
    }

    /// No retries.
    pub fn disabled() -> Self {
        Self { kind: RetryKind::Disabled, period_seconds: 0 }
    }

    /// Returns true when failed batches may be re-attempted.
    pub fn allows_retry(&self) -> bool {
        self.kind == RetryKind::Linear
    }

    /// Interval between retries.
    pub fn period(&self) -> Duration {
        Duration::from_secs(u64::from(self.period_seconds))
    }
}

/// Push delivery configuration attached to a subscription.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushConfig {
    /// URL receiving `POST` deliveries.
    pub endpoint: String,
    /// Maximum messages consumed per delivery batch.
    pub max_messages: u32,
    /// Retry behavior for failed batches.
    pub retry: RetryPolicy,
    /// Nonce the endpoint must accept to prove ownership.
    pub verification_hash: String,
    /// Whether the endpoint has completed the verification handshake.
    pub verified: bool,
}

impl PushConfig {
    /// Creates an unverified push configuration with a fresh verification
    /// hash.
    pub fn new(endpoint: impl Into<String>, max_messages: u32, retry: RetryPolicy) -> Self {
        Self {
            endpoint: endpoint.into(),
            max_messages,
            retry,
            verification_hash: Uuid::new_v4().simple().to_string(),
            verified: false,
        }
    }
}

/// An outstanding, unacknowledged batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingAck {
    /// Opaque token identifying the batch.
    pub token: String,
    /// One past the last offset in the batch.
    pub end_offset: u64,
    /// When the batch was handed out.
    pub since: DateTime<Utc>,
}

impl PendingAck {
    /// Creates a pending batch ending before `end_offset` with a fresh token.
    pub fn new(end_offset: u64, since: DateTime<Utc>) -> Self {
        Self { token: Uuid::new_v4().to_string(), end_offset, since }
    }

    /// Returns true once `deadline` has passed since the batch was issued.
    pub fn is_expired(&self, deadline: Duration, now: DateTime<Utc>) -> bool {
        let Ok(deadline) = chrono::Duration::from_std(deadline) else {
            return false;
        };
        now - self.since > deadline
    }
}

/// Consumption position of a subscription.
///
/// `offset` is the committed position: everything before it has been
/// acknowledged. `next_offset` is where the next consume starts. A pending
/// batch never moves either value; only its acknowledgment does.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cursor {
    /// Committed (acknowledged) position.
    pub offset: u64,
    /// Next position to read.
    pub next_offset: u64,
    /// Outstanding batch, if any.
    pub pending_ack: Option<PendingAck>,
}

impl Cursor {
    /// Token of the outstanding batch, if any.
    pub fn pending_token(&self) -> Option<String> {
        self.pending_ack.as_ref().map(|p| p.token.clone())
    }

    /// Cursor starting at `offset` with nothing pending.
    pub fn at(offset: u64) -> Self {
        Self { offset, next_offset: offset, pending_ack: None }
    }
}

/// Cumulative traffic counters kept for topics (publish side) and
/// subscriptions (consume side).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrafficStats {
    /// Total messages.
    pub message_count: u64,
    /// Total payload bytes.
    pub byte_count: u64,
    /// Time of the most recent recorded batch.
    pub latest: Option<DateTime<Utc>>,
    /// Messages per second between the two most recent batches.
    pub rate: f64,
}

impl TrafficStats {
    /// Adds a batch observed at `at` and refreshes the rate.
    ///
    /// The rate is left untouched for the first batch or when the clock did
    /// not advance since the previous one.
    pub fn record(&mut self, message_count: u64, byte_count: u64, at: DateTime<Utc>) {
        self.message_count = self.message_count.saturating_add(message_count);
        self.byte_count = self.byte_count.saturating_add(byte_count);

        match self.latest {
            Some(previous) if at > previous => {
                let elapsed = (at - previous).num_milliseconds() as f64 / 1000.0;
                if elapsed > 0.0 {
                    self.rate = message_count as f64 / elapsed;
                }
                self.latest = Some(at);
            },
            Some(_) => {},
            None => self.latest = Some(at),
        }
    }
}

/// A topic within a project.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Topic {
    /// Owning project.
    pub project_id: ProjectId,
    /// Topic name, unique within the project.
    pub name: String,
    /// Publish statistics.
    pub stats: TrafficStats,
    /// Identities allowed to publish.
    pub acl: Vec<String>,
}

impl Topic {
    /// Creates a topic with empty statistics and ACL.
    pub fn new(project_id: ProjectId, name: impl Into<String>) -> Self {
        Self { project_id, name: name.into(), stats: TrafficStats::default(), acl: Vec::new() }
    }

    /// Name of the broker stream for this topic.
    pub fn broker_name(&self) -> String {
        broker_topic_name(self.project_id, &self.name)
    }
}

/// A pull or push subscription bound to one topic of its project.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subscription {
    /// Identity.
    pub key: SubscriptionKey,
    /// Name of the topic in the same project.
    pub topic: String,
    /// Consumption position.
    pub cursor: Cursor,
    /// Seconds a handed-out batch may stay unacknowledged.
    pub ack_deadline_seconds: u32,
    /// Push delivery settings; `None` for pull subscriptions.
    pub push: Option<PushConfig>,
    /// Consume statistics.
    pub stats: TrafficStats,
    /// Identities allowed to consume.
    pub acl: Vec<String>,
}

impl Subscription {
    /// Creates a pull subscription reading from offset zero.
    pub fn pull(key: SubscriptionKey, topic: impl Into<String>) -> Self {
        Self {
            key,
            topic: topic.into(),
            cursor: Cursor::default(),
            ack_deadline_seconds: DEFAULT_ACK_DEADLINE_SECONDS,
            push: None,
            stats: TrafficStats::default(),
            acl: Vec::new(),
        }
    }

    /// Creates a push subscription reading from offset zero.
    pub fn push(key: SubscriptionKey, topic: impl Into<String>, push: PushConfig) -> Self {
        Self { push: Some(push), ..Self::pull(key, topic) }
    }

    /// Name of the broker stream this subscription consumes.
    pub fn broker_topic(&self) -> String {
        broker_topic_name(self.key.project_id, &self.topic)
    }

    /// Acknowledgment deadline as a duration.
    pub fn ack_deadline(&self) -> Duration {
        Duration::from_secs(u64::from(self.ack_deadline_seconds))
    }

    /// Applies a compare-and-set cursor update.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Conflict` when the stored `next_offset` or pending
    /// batch token differs from the update's expectation and `CoreError::InvalidInput` when the
    /// update would move the committed offset backwards or past
    /// `next_offset`.
    pub fn apply(&mut self, update: &OffsetUpdate) -> Result<()> {
        if self.cursor.next_offset != update.expected_next_offset {
            return Err(CoreError::Conflict(format!(
                "{}: expected next offset {}, found {}",
                self.key, update.expected_next_offset, self.cursor.next_offset
            )));
        }
        let current_token = self.cursor.pending_ack.as_ref().map(|p| p.token.as_str());
        if current_token != update.expected_pending.as_deref() {
            return Err(CoreError::Conflict(format!(
                "{}: pending batch changed from {:?} to {:?}",
                self.key, update.expected_pending, current_token
            )));
        }
        update.validate_against(&self.cursor)?;

        self.cursor = Cursor {
            offset: update.offset,
            next_offset: update.next_offset,
            pending_ack: update.pending_ack.clone(),
        };
        Ok(())
    }
}

/// Conditional cursor write, rejected when the stored `next_offset` or the
/// stored pending batch token no longer match what the writer observed.
///
/// Reserving never moves `next_offset`, so the token comparison is what
/// stops two writers from reserving the same batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OffsetUpdate {
    /// `next_offset` the writer last observed.
    pub expected_next_offset: u64,
    /// Token of the pending batch the writer last observed.
    pub expected_pending: Option<String>,
    /// New committed offset.
    pub offset: u64,
    /// New next offset.
    pub next_offset: u64,
    /// New pending batch.
    pub pending_ack: Option<PendingAck>,
}

impl OffsetUpdate {
    /// Marks a batch as handed out without moving any offset.
    pub fn reserve(cursor: &Cursor, pending: PendingAck) -> Self {
        Self {
            expected_next_offset: cursor.next_offset,
            expected_pending: cursor.pending_token(),
            offset: cursor.offset,
            next_offset: cursor.next_offset,
            pending_ack: Some(pending),
        }
    }

    /// Commits everything before `new_offset`, leaving `remaining` pending.
    pub fn advance(cursor: &Cursor, new_offset: u64, remaining: Option<PendingAck>) -> Self {
        Self {
            expected_next_offset: cursor.next_offset,
            expected_pending: cursor.pending_token(),
            offset: new_offset,
            next_offset: new_offset,
            pending_ack: remaining,
        }
    }

    /// Drops the pending batch without moving any offset.
    pub fn release(cursor: &Cursor) -> Self {
        Self {
            expected_next_offset: cursor.next_offset,
            expected_pending: cursor.pending_token(),
            offset: cursor.offset,
            next_offset: cursor.next_offset,
            pending_ack: None,
        }
    }

    /// Snaps a cursor that fell behind the log's retention to `min_offset`.
    pub fn resync(cursor: &Cursor, min_offset: u64) -> Self {
        Self {
            expected_next_offset: cursor.next_offset,
            expected_pending: cursor.pending_token(),
            offset: cursor.offset.max(min_offset),
            next_offset: cursor.next_offset.max(min_offset),
            pending_ack: None,
        }
    }

    /// Checks the invariants of the resulting cursor against the current one.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::InvalidInput` if the committed offset would move
    /// backwards or overtake `next_offset`.
    pub fn validate_against(&self, current: &Cursor) -> Result<()> {
        if self.next_offset < self.offset {
            return Err(CoreError::InvalidInput(format!(
                "next offset {} behind committed offset {}",
                self.next_offset, self.offset
            )));
        }
        if self.offset < current.offset {
            return Err(CoreError::InvalidInput(format!(
                "committed offset cannot move backwards from {} to {}",
                current.offset, self.offset
            )));
        }
        Ok(())
    }
}

/// Immutable message as stored in a topic's log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    /// Broker-assigned identifier.
    pub message_id: String,
    /// Free-form attributes.
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
    /// Opaque payload, base64 on the wire.
    #[serde(with = "base64_bytes")]
    pub data: Bytes,
    /// When the broker accepted the message.
    pub publish_time: DateTime<Utc>,
}

impl Message {
    /// Creates an unpublished message; the broker fills in the ID.
    pub fn new(data: impl Into<Bytes>, attributes: BTreeMap<String, String>) -> Self {
        Self { message_id: String::new(), attributes, data: data.into(), publish_time: Utc::now() }
    }

    /// Payload size in bytes, as counted by traffic statistics.
    pub fn size(&self) -> u64 {
        self.data.len() as u64
    }
}

mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD, Engine};
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(data: &Bytes, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(data))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Bytes, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map(Bytes::from).map_err(serde::de::Error::custom)
    }
}

/// Opaque caller identity used for ACL lookups.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Principal(pub String);

impl fmt::Display for Principal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Resource guarded by an access control list.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum AclResource {
    /// A topic, identified by project and name.
    Topic {
        /// Owning project.
        project_id: ProjectId,
        /// Topic name.
        name: String,
    },
    /// A subscription.
    Subscription(SubscriptionKey),
}

impl fmt::Display for AclResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Topic { project_id, name } => write!(f, "projects/{project_id}/topics/{name}"),
            Self::Subscription(key) => write!(f, "{key}"),
        }
    }
}

fn decode_u64(row: &PgRow, column: &str) -> std::result::Result<u64, sqlx::Error> {
    let value: i64 = row.try_get(column)?;
    u64::try_from(value)
        .map_err(|e| sqlx::Error::ColumnDecode { index: column.to_string(), source: Box::new(e) })
}

fn decode_u32(row: &PgRow, column: &str) -> std::result::Result<u32, sqlx::Error> {
    let value: i32 = row.try_get(column)?;
    u32::try_from(value)
        .map_err(|e| sqlx::Error::ColumnDecode { index: column.to_string(), source: Box::new(e) })
}

impl<'r> sqlx::FromRow<'r, PgRow> for Subscription {
    fn from_row(row: &'r PgRow) -> std::result::Result<Self, sqlx::Error> {
        let key = SubscriptionKey { project_id: row.try_get("project_id")?, name: row.try_get("name")? };

        let pending_token: Option<String> = row.try_get("pending_ack")?;
        let pending_end: Option<i64> = row.try_get("pending_end_offset")?;
        let pending_since: Option<DateTime<Utc>> = row.try_get("pending_since")?;
        let pending_ack = match (pending_token, pending_end, pending_since) {
            (Some(token), Some(end), Some(since)) if !token.is_empty() => Some(PendingAck {
                token,
                end_offset: u64::try_from(end).map_err(|e| sqlx::Error::ColumnDecode {
                    index: "pending_end_offset".to_string(),
                    source: Box::new(e),
                })?,
                since,
            }),
            _ => None,
        };

        let endpoint: Option<String> = row.try_get("push_endpoint")?;
        let push = match endpoint.filter(|url| !url.is_empty()) {
            Some(endpoint) => {
                let policy: String = row.try_get("retry_policy")?;
                let kind = policy.parse::<RetryKind>().map_err(|e| sqlx::Error::ColumnDecode {
                    index: "retry_policy".to_string(),
                    source: Box::new(e),
                })?;
                Some(PushConfig {
                    endpoint,
                    max_messages: decode_u32(row, "max_messages")?,
                    retry: RetryPolicy {
                        kind,
                        period_seconds: decode_u32(row, "retry_period_seconds")?,
                    },
                    verification_hash: row.try_get("verification_hash")?,
                    verified: row.try_get("verified")?,
                })
            },
            None => None,
        };

        Ok(Self {
            key,
            topic: row.try_get("topic")?,
            cursor: Cursor {
                offset: decode_u64(row, "committed_offset")?,
                next_offset: decode_u64(row, "next_offset")?,
                pending_ack,
            },
            ack_deadline_seconds: decode_u32(row, "ack_deadline_seconds")?,
            push,
            stats: TrafficStats {
                message_count: decode_u64(row, "msg_num")?,
                byte_count: decode_u64(row, "total_bytes")?,
                latest: row.try_get("latest_consume")?,
                rate: row.try_get("consume_rate")?,
            },
            acl: row.try_get("acl")?,
        })
    }
}

impl<'r> sqlx::FromRow<'r, PgRow> for Topic {
    fn from_row(row: &'r PgRow) -> std::result::Result<Self, sqlx::Error> {
        Ok(Self {
            project_id: row.try_get("project_id")?,
            name: row.try_get("name")?,
            stats: TrafficStats {
                message_count: decode_u64(row, "msg_num")?,
                byte_count: decode_u64(row, "total_bytes")?,
                latest: row.try_get("latest_publish")?,
                rate: row.try_get("publish_rate")?,
            },
            acl: row.try_get("acl")?,
        })
    }
}
