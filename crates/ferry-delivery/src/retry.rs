//! Retry decisions for failed push batches and backoff for infrastructure
//! failures.
//!
//! Push retries follow the subscription's own policy: a linear period bounded
//! by the ack deadline measured from the first delivery attempt of the batch.
//! Broker and storage outages use exponential backoff with jitter so a fleet
//! of workers does not hammer a recovering dependency in lockstep.

use std::time::Duration;

use chrono::{DateTime, Utc};
use ferry_core::RetryPolicy;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::DeliveryError;

/// Shortest interval between two attempts of the same batch.
pub const MIN_RETRY_PERIOD: Duration = Duration::from_secs(1);

/// Exponential backoff used while the broker or storage is unavailable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackoffPolicy {
    /// Delay after the first consecutive failure.
    pub base_delay: Duration,

    /// Upper bound for any delay.
    pub max_delay: Duration,

    /// Jitter percentage (0.0 to 1.0) to add randomness.
    pub jitter_factor: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            jitter_factor: 0.25,
        }
    }
}

impl BackoffPolicy {
    /// Delay before the next attempt after `consecutive_failures` failures
    /// (1-based).
    pub fn delay_for(&self, consecutive_failures: u32) -> Duration {
        let exponent = consecutive_failures.saturating_sub(1).min(20);
        let multiplier = 2_u32.saturating_pow(exponent);
        let capped = std::cmp::min(self.base_delay.saturating_mul(multiplier), self.max_delay);

        std::cmp::min(apply_jitter(capped, self.jitter_factor), self.max_delay)
    }
}

/// Outcome of a retry decision for a failed batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Re-deliver the same batch at the given time.
    Retry {
        /// When the next delivery attempt should start
        next_attempt_at: DateTime<Utc>,
    },
    /// Drop the batch without advancing the offset.
    Abandon {
        /// Why the batch is not retried
        reason: String,
    },
}

/// Everything needed to decide what happens to a failed batch.
#[derive(Debug, Clone)]
pub struct RetryContext {
    /// Subscription retry policy.
    pub policy: RetryPolicy,
    /// Subscription ack deadline.
    pub ack_deadline: Duration,
    /// When the batch was first handed to the endpoint.
    pub batch_started_at: DateTime<Utc>,
    /// When the latest attempt failed.
    pub failed_at: DateTime<Utc>,
    /// Error that caused the failure.
    pub error: DeliveryError,
}

impl RetryContext {
    /// Decides whether to retry the batch.
    ///
    /// A retry happens only when the policy is linear, the error is
    /// retryable, and the next attempt would still start inside the ack
    /// deadline.
    pub fn decide(&self) -> RetryDecision {
        if !self.policy.allows_retry() {
            return RetryDecision::Abandon { reason: "retry disabled".to_string() };
        }

        if !self.error.is_retryable() {
            return RetryDecision::Abandon {
                reason: format!("non-retryable error: {}", self.error),
            };
        }

        let period = self.policy.period().max(MIN_RETRY_PERIOD);
        let (Ok(period), Ok(deadline)) =
            (chrono::Duration::from_std(period), chrono::Duration::from_std(self.ack_deadline))
        else {
            return RetryDecision::Abandon { reason: "retry window out of range".to_string() };
        };

        let elapsed = self.failed_at - self.batch_started_at;
        if elapsed + period > deadline {
            return RetryDecision::Abandon {
                reason: format!("ack deadline of {}s exceeded", deadline.num_seconds()),
            };
        }

        RetryDecision::Retry { next_attempt_at: self.failed_at + period }
    }
}

/// Applies ±`jitter_factor` randomization to a duration.
fn apply_jitter(duration: Duration, jitter_factor: f64) -> Duration {
    if jitter_factor <= 0.0 {
        return duration;
    }

    let clamped_jitter = jitter_factor.clamp(0.0, 1.0);

    let mut rng = rand::rng();
    let jitter_range = duration.as_secs_f64() * clamped_jitter;
    let jitter_offset = rng.random_range(-jitter_range..=jitter_range);
    let jittered_secs = duration.as_secs_f64() + jitter_offset;

    Duration::from_secs_f64(jittered_secs.max(0.0))
}
