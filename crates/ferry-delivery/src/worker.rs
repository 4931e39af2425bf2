//! Per-subscription push delivery loop.
//!
//! Each push subscription is driven by one `PushWorker` running the cycle
//! `Idle -> Consuming -> Delivering -> (Acked | AwaitingRetry) -> Idle`
//! until its cancellation token fires. Offsets only move after every message
//! of a batch was accepted by the endpoint, and every cursor write is a
//! compare-and-set on `next_offset`, so a stale or overlapping worker can
//! never commit on top of newer state.

use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use ferry_broker::{BrokerError, Record};
use ferry_core::{
    CoreError, Cursor, OffsetUpdate, PendingAck, PushConfig, Subscription, SubscriptionKey,
};
use serde::Serialize;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    client::PushEnvelope,
    context::DeliveryContext,
    error::{DeliveryError, ErrorCategory, Result},
    retry::{RetryContext, RetryDecision},
};

/// Where a worker currently is in its delivery cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerPhase {
    /// No batch in flight.
    Idle,
    /// Reading the next batch from the broker.
    Consuming,
    /// Sending a batch to the endpoint.
    Delivering,
    /// Committing a fully delivered batch.
    Acked,
    /// Waiting to re-deliver a failed batch.
    AwaitingRetry,
    /// Loop has exited.
    Stopped,
}

impl std::fmt::Display for WorkerPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Consuming => "consuming",
            Self::Delivering => "delivering",
            Self::Acked => "acked",
            Self::AwaitingRetry => "awaiting_retry",
            Self::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// Most recent failure observed for a subscription.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Fault {
    /// Error message.
    pub message: String,
    /// Error category.
    pub category: String,
    /// When the failure happened.
    pub at: DateTime<Utc>,
}

impl Fault {
    /// Captures an error at the given time.
    pub fn new(error: &DeliveryError, at: DateTime<Utc>) -> Self {
        Self { message: error.to_string(), category: ErrorCategory::from(error).to_string(), at }
    }
}

/// Observable state of a push subscription's worker.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkerStatus {
    /// Whether a worker is currently running.
    pub active: bool,
    /// Whether the endpoint passed verification.
    pub verified: bool,
    /// Current cycle phase.
    pub phase: WorkerPhase,
    /// Committed offset as last seen by the worker.
    pub offset: u64,
    /// Next offset as last seen by the worker.
    pub next_offset: u64,
    /// Messages acknowledged by this worker since it started.
    pub delivered_messages: u64,
    /// Most recent failure.
    pub last_fault: Option<Fault>,
}

impl WorkerStatus {
    /// Status of a subscription whose worker has not started.
    pub fn inactive(subscription: &Subscription) -> Self {
        Self {
            active: false,
            verified: subscription.push.as_ref().is_some_and(|p| p.verified),
            phase: WorkerPhase::Stopped,
            offset: subscription.cursor.offset,
            next_offset: subscription.cursor.next_offset,
            delivered_messages: 0,
            last_fault: None,
        }
    }
}

/// Checks that a subscription can be driven by a push worker.
///
/// # Errors
///
/// Returns `DeliveryError::InvalidSubscription` when the subscription has no
/// push configuration, the endpoint is not an absolute http(s) URL, or the
/// batch size is zero.
pub fn validate_push(subscription: &Subscription) -> Result<&PushConfig> {
    let push = subscription.push.as_ref().ok_or_else(|| {
        DeliveryError::invalid_subscription(format!("{} is not a push subscription", subscription.key))
    })?;

    let url = reqwest::Url::parse(&push.endpoint).map_err(|e| {
        DeliveryError::invalid_subscription(format!(
            "{}: invalid push endpoint {}: {e}",
            subscription.key, push.endpoint
        ))
    })?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(DeliveryError::invalid_subscription(format!(
            "{}: unsupported endpoint scheme {}",
            subscription.key,
            url.scheme()
        )));
    }
    if push.max_messages == 0 {
        return Err(DeliveryError::invalid_subscription(format!(
            "{}: max_messages must be at least 1",
            subscription.key
        )));
    }

    Ok(push)
}

/// A consumed batch awaiting delivery.
#[derive(Debug, Clone)]
struct Batch {
    records: Vec<Record>,
    pending: PendingAck,
    attempts: u32,
}

impl Batch {
    fn first_offset(&self) -> u64 {
        self.records.first().map_or(self.pending.end_offset, |r| r.offset)
    }

    fn byte_count(&self) -> u64 {
        self.records.iter().map(|r| r.message.size()).sum()
    }
}

#[derive(Debug)]
enum State {
    Idle,
    Consuming,
    Delivering(Batch),
    Acked(Batch),
    AwaitingRetry(Batch, DeliveryError),
    Stopped(Option<Batch>),
}

impl State {
    fn phase(&self) -> WorkerPhase {
        match self {
            Self::Idle => WorkerPhase::Idle,
            Self::Consuming => WorkerPhase::Consuming,
            Self::Delivering(_) => WorkerPhase::Delivering,
            Self::Acked(_) => WorkerPhase::Acked,
            Self::AwaitingRetry(..) => WorkerPhase::AwaitingRetry,
            Self::Stopped(_) => WorkerPhase::Stopped,
        }
    }

    /// Converts any state into `Stopped` once cancellation was observed.
    ///
    /// A fully delivered batch is still committed first.
    fn on_cancel(self) -> Self {
        match self {
            Self::Acked(batch) => Self::Acked(batch),
            Self::Delivering(batch) | Self::AwaitingRetry(batch, _) => Self::Stopped(Some(batch)),
            Self::Stopped(batch) => Self::Stopped(batch),
            Self::Idle | Self::Consuming => Self::Stopped(None),
        }
    }
}

enum CursorWrite {
    Applied,
    Reloaded,
    Failed,
}

/// Delivery loop for a single push subscription.
pub struct PushWorker {
    key: SubscriptionKey,
    topic: String,
    push: PushConfig,
    ack_deadline: Duration,
    cursor: Cursor,
    context: DeliveryContext,
    token: CancellationToken,
    status: Arc<RwLock<WorkerStatus>>,
    consecutive_failures: u32,
}

impl PushWorker {
    /// Creates a worker for a push subscription.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::InvalidSubscription` if the subscription
    /// fails [`validate_push`].
    pub fn new(
        subscription: Subscription,
        context: DeliveryContext,
        token: CancellationToken,
        status: Arc<RwLock<WorkerStatus>>,
    ) -> Result<Self> {
        let push = validate_push(&subscription)?.clone();

        Ok(Self {
            topic: subscription.broker_topic(),
            ack_deadline: subscription.ack_deadline(),
            key: subscription.key,
            cursor: subscription.cursor,
            push,
            context,
            token,
            status,
            consecutive_failures: 0,
        })
    }

    /// Runs the delivery loop until cancelled.
    ///
    /// # Errors
    ///
    /// Returns an error only when the subscription disappears or stops being
    /// a valid push subscription. Broker, storage and endpoint failures are
    /// absorbed by the loop.
    pub async fn run(mut self) -> Result<()> {
        info!(subscription = %self.key, endpoint = %self.push.endpoint, "push worker starting");
        {
            let mut status = self.status.write().await;
            status.active = true;
            status.verified = self.push.verified;
            status.offset = self.cursor.offset;
            status.next_offset = self.cursor.next_offset;
        }

        let mut state = State::Idle;
        let result = loop {
            if self.token.is_cancelled() {
                state = state.on_cancel();
            }
            self.status.write().await.phase = state.phase();

            let next = match state {
                State::Idle => self.idle().await,
                State::Consuming => self.consume().await,
                State::Delivering(batch) => Ok(self.deliver(batch).await),
                State::Acked(batch) => self.ack(batch).await,
                State::AwaitingRetry(batch, error) => Ok(self.await_retry(batch, error).await),
                State::Stopped(batch) => {
                    self.release_on_stop(batch).await;
                    break Ok(());
                },
            };

            state = match next {
                Ok(next) => next,
                Err(error) => break Err(error),
            };
        };

        {
            let mut status = self.status.write().await;
            status.active = false;
            status.phase = WorkerPhase::Stopped;
            if let Err(error) = &result {
                status.last_fault = Some(Fault::new(error, self.context.clock.now_utc()));
            }
        }
        info!(subscription = %self.key, offset = self.cursor.offset, "push worker stopped");
        result
    }

    async fn idle(&mut self) -> Result<State> {
        if self.push.verified {
            return Ok(State::Consuming);
        }

        let challenge = self
            .context
            .sender
            .send_verification(self.push.endpoint.clone(), self.push.verification_hash.clone())
            .await;

        match challenge {
            Ok(status) => match self.context.store.mark_verified(self.key.clone()).await {
                Ok(()) => {
                    info!(subscription = %self.key, status, "push endpoint verified");
                    self.push.verified = true;
                    self.status.write().await.verified = true;
                    Ok(State::Consuming)
                },
                Err(CoreError::NotFound(resource)) => Err(DeliveryError::not_found(resource)),
                Err(e) => {
                    self.back_off(&DeliveryError::from(e)).await;
                    Ok(State::Idle)
                },
            },
            Err(error) => {
                warn!(subscription = %self.key, error = %error, "endpoint verification failed");
                self.record_fault(&error).await;
                self.pause(self.context.config.verification_interval).await;
                Ok(State::Idle)
            },
        }
    }

    async fn consume(&mut self) -> Result<State> {
        if let Some(pending) = &self.cursor.pending_ack {
            if !pending.is_expired(self.ack_deadline, self.context.clock.now_utc()) {
                debug!(
                    subscription = %self.key,
                    end_offset = pending.end_offset,
                    "batch reserved by another consumer, waiting for it to settle"
                );
                self.pause(self.context.config.poll_interval).await;
                self.reload().await?;
                return Ok(State::Idle);
            }
        }

        let max_messages = usize::try_from(self.push.max_messages).unwrap_or(usize::MAX);
        let consumed = self
            .context
            .broker
            .consume(self.topic.clone(), self.cursor.next_offset, max_messages, true)
            .await;

        match consumed {
            Ok(records) if records.is_empty() => {
                self.consecutive_failures = 0;
                self.pause(self.context.config.poll_interval).await;
                Ok(State::Idle)
            },
            Ok(records) => {
                self.consecutive_failures = 0;
                let end_offset = records.last().map_or(self.cursor.next_offset, |r| r.offset + 1);
                let pending = PendingAck::new(end_offset, self.context.clock.now_utc());

                debug!(
                    subscription = %self.key,
                    offset = self.cursor.next_offset,
                    count = records.len(),
                    "consumed batch"
                );

                match self.write_cursor(OffsetUpdate::reserve(&self.cursor, pending.clone())).await? {
                    CursorWrite::Applied => {
                        Ok(State::Delivering(Batch { records, pending, attempts: 0 }))
                    },
                    CursorWrite::Reloaded | CursorWrite::Failed => Ok(State::Idle),
                }
            },
            Err(BrokerError::OffsetOutOfRange { requested, min, .. }) if requested < min => {
                warn!(
                    subscription = %self.key,
                    requested,
                    min_offset = min,
                    lost = min - requested,
                    "offset fell behind retention, resyncing to oldest available message"
                );
                self.write_cursor(OffsetUpdate::resync(&self.cursor, min)).await?;
                Ok(State::Idle)
            },
            Err(BrokerError::OffsetOutOfRange { requested, max, .. }) => {
                debug!(subscription = %self.key, requested, max_offset = max, "no new messages");
                self.pause(self.context.config.poll_interval).await;
                Ok(State::Idle)
            },
            Err(e) => {
                self.back_off(&DeliveryError::from(e)).await;
                Ok(State::Idle)
            },
        }
    }

    async fn deliver(&mut self, mut batch: Batch) -> State {
        batch.attempts += 1;
        let subscription = self.key.to_string();

        for record in &batch.records {
            if self.token.is_cancelled() {
                return State::Stopped(Some(batch));
            }

            let envelope =
                PushEnvelope { message: record.message.clone(), subscription: subscription.clone() };
            match self.context.sender.send_message(self.push.endpoint.clone(), envelope).await {
                Ok(status) => {
                    debug!(subscription = %self.key, offset = record.offset, status, "message delivered");
                },
                Err(error) => {
                    warn!(
                        subscription = %self.key,
                        offset = record.offset,
                        attempt = batch.attempts,
                        error = %error,
                        "delivery failed"
                    );
                    return State::AwaitingRetry(batch, error);
                },
            }
        }

        State::Acked(batch)
    }

    async fn ack(&mut self, batch: Batch) -> Result<State> {
        let end_offset = batch.pending.end_offset;
        let count = batch.records.len() as u64;

        match self.write_cursor(OffsetUpdate::advance(&self.cursor, end_offset, None)).await? {
            CursorWrite::Applied => {},
            CursorWrite::Reloaded => return Ok(State::Idle),
            CursorWrite::Failed if self.token.is_cancelled() => return Ok(State::Stopped(Some(batch))),
            CursorWrite::Failed => return Ok(State::Acked(batch)),
        }

        info!(
            subscription = %self.key,
            from = batch.first_offset(),
            offset = end_offset,
            count,
            "batch acknowledged"
        );
        self.status.write().await.delivered_messages += count;

        let now = self.context.clock.now_utc();
        if let Err(e) =
            self.context.store.increment_stats(self.key.clone(), count, batch.byte_count(), now).await
        {
            warn!(subscription = %self.key, error = %e, "failed to record consume statistics");
        }

        Ok(State::Idle)
    }

    async fn await_retry(&mut self, batch: Batch, error: DeliveryError) -> State {
        self.record_fault(&error).await;

        let now = self.context.clock.now_utc();
        let decision = RetryContext {
            policy: self.push.retry,
            ack_deadline: self.ack_deadline,
            batch_started_at: batch.pending.since,
            failed_at: now,
            error,
        }
        .decide();

        match decision {
            RetryDecision::Retry { next_attempt_at } => {
                let wait = (next_attempt_at - now).to_std().unwrap_or_default();
                debug!(
                    subscription = %self.key,
                    offset = batch.first_offset(),
                    wait_ms = wait.as_millis(),
                    "retrying batch"
                );
                self.pause(wait).await;
                State::Delivering(batch)
            },
            RetryDecision::Abandon { reason } => {
                warn!(
                    subscription = %self.key,
                    offset = batch.first_offset(),
                    attempts = batch.attempts,
                    reason = %reason,
                    "abandoning batch, offset unchanged"
                );
                if let Err(fatal) = self.write_cursor(OffsetUpdate::release(&self.cursor)).await {
                    error!(subscription = %self.key, error = %fatal, "failed to release batch");
                }
                self.pause(self.context.config.poll_interval).await;
                State::Idle
            },
        }
    }

    /// Clears a pending batch on shutdown. Single attempt; the committed
    /// offset is untouched either way.
    async fn release_on_stop(&mut self, batch: Option<Batch>) {
        let Some(batch) = batch else {
            return;
        };
        debug!(
            subscription = %self.key,
            offset = batch.first_offset(),
            "stopping with undelivered batch, offset unchanged"
        );

        let update = OffsetUpdate::release(&self.cursor);
        match self.context.store.update_offsets(self.key.clone(), update.clone()).await {
            Ok(()) => self.apply_local(update).await,
            Err(e) => warn!(subscription = %self.key, error = %e, "failed to release pending batch"),
        }
    }

    /// Writes a cursor update and mirrors it locally.
    ///
    /// A lost compare-and-set reloads the subscription; transient storage
    /// failures back off. Only a vanished or no longer valid subscription is
    /// returned as an error.
    async fn write_cursor(&mut self, update: OffsetUpdate) -> Result<CursorWrite> {
        match self.context.store.update_offsets(self.key.clone(), update.clone()).await {
            Ok(()) => {
                self.apply_local(update).await;
                Ok(CursorWrite::Applied)
            },
            Err(CoreError::Conflict(message)) => {
                warn!(subscription = %self.key, conflict = %message, "stale cursor, reloading");
                self.reload().await?;
                Ok(CursorWrite::Reloaded)
            },
            Err(CoreError::NotFound(resource)) => Err(DeliveryError::not_found(resource)),
            Err(e) => {
                self.back_off(&DeliveryError::from(e)).await;
                Ok(CursorWrite::Failed)
            },
        }
    }

    async fn apply_local(&mut self, update: OffsetUpdate) {
        self.cursor = Cursor {
            offset: update.offset,
            next_offset: update.next_offset,
            pending_ack: update.pending_ack,
        };
        let mut status = self.status.write().await;
        status.offset = self.cursor.offset;
        status.next_offset = self.cursor.next_offset;
    }

    async fn reload(&mut self) -> Result<()> {
        let subscription = match self.context.store.load_subscription(self.key.clone()).await {
            Ok(subscription) => subscription,
            Err(CoreError::NotFound(resource)) => return Err(DeliveryError::not_found(resource)),
            Err(e) => {
                self.back_off(&DeliveryError::from(e)).await;
                return Ok(());
            },
        };

        self.push = validate_push(&subscription)?.clone();
        self.topic = subscription.broker_topic();
        self.ack_deadline = subscription.ack_deadline();
        self.cursor = subscription.cursor;

        let mut status = self.status.write().await;
        status.verified = self.push.verified;
        status.offset = self.cursor.offset;
        status.next_offset = self.cursor.next_offset;
        Ok(())
    }

    async fn back_off(&mut self, error: &DeliveryError) {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        let delay = self.context.config.backoff.delay_for(self.consecutive_failures);

        warn!(
            subscription = %self.key,
            error = %error,
            failures = self.consecutive_failures,
            delay_ms = delay.as_millis(),
            "transient failure, backing off"
        );
        self.record_fault(error).await;
        self.pause(delay).await;
    }

    async fn record_fault(&self, error: &DeliveryError) {
        let fault = Fault::new(error, self.context.clock.now_utc());
        self.status.write().await.last_fault = Some(fault);
    }

    async fn pause(&self, duration: Duration) {
        tokio::select! {
            () = self.context.clock.sleep(duration) => {}
            () = self.token.cancelled() => {}
        }
    }
}
