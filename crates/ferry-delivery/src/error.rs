//! Error types for push delivery, pull consumption and worker supervision.
//!
//! Errors carry enough context to be recorded as a subscription fault and
//! are categorized so the worker can decide between retrying the batch,
//! backing off, reloading state, or stopping.

use std::fmt;

use ferry_broker::BrokerError;
use ferry_core::CoreError;
use thiserror::Error;

/// Result type alias for delivery operations.
pub type Result<T> = std::result::Result<T, DeliveryError>;

/// Error conditions across the delivery engine.
#[derive(Debug, Clone, Error)]
pub enum DeliveryError {
    /// Push endpoint could not be reached.
    #[error("endpoint unreachable: {message}")]
    EndpointUnreachable {
        /// Error message describing the network failure
        message: String,
    },

    /// HTTP request timeout exceeded.
    #[error("request timeout after {timeout_seconds}s")]
    Timeout {
        /// Number of seconds before the request timed out
        timeout_seconds: u64,
    },

    /// Endpoint answered with a non-2xx status.
    #[error("endpoint rejected delivery: HTTP {status_code}")]
    EndpointRejected {
        /// HTTP status code
        status_code: u16,
        /// Response body content
        body: String,
    },

    /// Endpoint did not accept the verification challenge.
    #[error("endpoint verification failed: {reason}")]
    VerificationFailed {
        /// Why the handshake failed
        reason: String,
    },

    /// Broker operation failed.
    #[error("broker error: {source}")]
    Broker {
        /// Underlying broker failure
        source: BrokerError,
    },

    /// Subscription storage could not be reached.
    #[error("storage unavailable: {message}")]
    StorageUnavailable {
        /// Storage error message
        message: String,
    },

    /// A cursor write lost a compare-and-set race.
    #[error("stale offset write: {message}")]
    StaleWrite {
        /// Description of the conflicting state
        message: String,
    },

    /// Referenced subscription or topic does not exist.
    #[error("not found: {resource}")]
    NotFound {
        /// What was looked up
        resource: String,
    },

    /// Subscription is malformed or used with the wrong delivery mode.
    #[error("invalid subscription: {message}")]
    InvalidSubscription {
        /// What is wrong with it
        message: String,
    },

    /// A pull was issued while an earlier batch awaits acknowledgment.
    #[error("subscription {subscription} has a batch awaiting acknowledgment")]
    AckPending {
        /// Subscription path
        subscription: String,
    },

    /// Acknowledgment arrived with nothing pending or after the deadline.
    #[error("acknowledgment deadline exceeded for {subscription}")]
    AckTimeout {
        /// Subscription path
        subscription: String,
    },

    /// Acknowledgment ID is malformed or outside the pending batch.
    #[error("invalid ack id: {ack_id}")]
    InvalidAckId {
        /// The rejected ID
        ack_id: String,
    },

    /// Principal is not on the resource's access control list.
    #[error("{principal} is not authorized for {resource}")]
    Unauthorized {
        /// Caller identity
        principal: String,
        /// Guarded resource
        resource: String,
    },

    /// Invalid engine configuration.
    #[error("invalid configuration: {message}")]
    ConfigurationError {
        /// Configuration error message
        message: String,
    },

    /// Worker shutdown requested.
    #[error("worker shutdown requested")]
    ShutdownRequested,

    /// Worker task panicked.
    #[error("worker for {subscription} panicked: {message}")]
    WorkerPanic {
        /// Subscription path
        subscription: String,
        /// Panic payload, if it was a string
        message: String,
    },

    /// Workers did not stop within the shutdown timeout.
    #[error("{pending} workers still running after shutdown timeout")]
    ShutdownTimeout {
        /// Number of workers that had not exited
        pending: usize,
    },

    /// Unexpected internal error.
    #[error("internal delivery error: {message}")]
    InternalError {
        /// Internal error message
        message: String,
    },
}

impl DeliveryError {
    /// Creates an unreachable-endpoint error.
    pub fn unreachable(message: impl Into<String>) -> Self {
        Self::EndpointUnreachable { message: message.into() }
    }

    /// Creates a timeout error.
    pub fn timeout(timeout_seconds: u64) -> Self {
        Self::Timeout { timeout_seconds }
    }

    /// Creates a rejected-delivery error from an HTTP response.
    pub fn endpoint_rejected(status_code: u16, body: impl Into<String>) -> Self {
        Self::EndpointRejected { status_code, body: body.into() }
    }

    /// Creates a verification failure.
    pub fn verification_failed(reason: impl Into<String>) -> Self {
        Self::VerificationFailed { reason: reason.into() }
    }

    /// Creates a storage error.
    pub fn storage(message: impl Into<String>) -> Self {
        Self::StorageUnavailable { message: message.into() }
    }

    /// Creates a not-found error.
    pub fn not_found(resource: impl Into<String>) -> Self {
        Self::NotFound { resource: resource.into() }
    }

    /// Creates an invalid-subscription error.
    pub fn invalid_subscription(message: impl Into<String>) -> Self {
        Self::InvalidSubscription { message: message.into() }
    }

    /// Creates a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::ConfigurationError { message: message.into() }
    }

    /// Creates an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::InternalError { message: message.into() }
    }

    /// Determines if this error represents a temporary failure.
    ///
    /// Endpoint failures of any kind are retryable under the subscription's
    /// retry policy. Broker outages, storage outages and lost
    /// compare-and-set races clear on their own. Everything else needs an
    /// operator or a different request.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::EndpointUnreachable { .. }
            | Self::Timeout { .. }
            | Self::EndpointRejected { .. }
            | Self::VerificationFailed { .. }
            | Self::StorageUnavailable { .. }
            | Self::StaleWrite { .. } => true,

            Self::Broker { source } => source.is_transient(),

            Self::NotFound { .. }
            | Self::InvalidSubscription { .. }
            | Self::AckPending { .. }
            | Self::AckTimeout { .. }
            | Self::InvalidAckId { .. }
            | Self::Unauthorized { .. }
            | Self::ConfigurationError { .. }
            | Self::ShutdownRequested
            | Self::WorkerPanic { .. }
            | Self::ShutdownTimeout { .. }
            | Self::InternalError { .. } => false,
        }
    }
}

impl From<CoreError> for DeliveryError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::Database(message) => Self::StorageUnavailable { message },
            CoreError::NotFound(resource) => Self::NotFound { resource },
            CoreError::Conflict(message) => Self::StaleWrite { message },
            CoreError::InvalidInput(message) => Self::InvalidSubscription { message },
        }
    }
}

impl From<BrokerError> for DeliveryError {
    fn from(source: BrokerError) -> Self {
        Self::Broker { source }
    }
}

/// Category of delivery error, recorded with subscription faults.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Endpoint unreachable or timed out.
    Network,
    /// Endpoint answered with a failure status.
    Endpoint,
    /// Verification handshake failed.
    Verification,
    /// Broker failures.
    Broker,
    /// Storage failures and stale writes.
    Storage,
    /// Malformed subscriptions and pull/ack misuse.
    Subscription,
    /// ACL rejections.
    Authorization,
    /// Configuration problems.
    Configuration,
    /// Internal system errors, panics and shutdown.
    Internal,
}

impl From<&DeliveryError> for ErrorCategory {
    fn from(error: &DeliveryError) -> Self {
        match error {
            DeliveryError::EndpointUnreachable { .. } | DeliveryError::Timeout { .. } => {
                Self::Network
            },
            DeliveryError::EndpointRejected { .. } => Self::Endpoint,
            DeliveryError::VerificationFailed { .. } => Self::Verification,
            DeliveryError::Broker { .. } => Self::Broker,
            DeliveryError::StorageUnavailable { .. } | DeliveryError::StaleWrite { .. } => {
                Self::Storage
            },
            DeliveryError::NotFound { .. }
            | DeliveryError::InvalidSubscription { .. }
            | DeliveryError::AckPending { .. }
            | DeliveryError::AckTimeout { .. }
            | DeliveryError::InvalidAckId { .. } => Self::Subscription,
            DeliveryError::Unauthorized { .. } => Self::Authorization,
            DeliveryError::ConfigurationError { .. } => Self::Configuration,
            DeliveryError::ShutdownRequested
            | DeliveryError::WorkerPanic { .. }
            | DeliveryError::ShutdownTimeout { .. }
            | DeliveryError::InternalError { .. } => Self::Internal,
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Network => write!(f, "network"),
            Self::Endpoint => write!(f, "endpoint"),
            Self::Verification => write!(f, "verification"),
            Self::Broker => write!(f, "broker"),
            Self::Storage => write!(f, "storage"),
            Self::Subscription => write!(f, "subscription"),
            Self::Authorization => write!(f, "authorization"),
            Self::Configuration => write!(f, "configuration"),
            Self::Internal => write!(f, "internal"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_errors_identified_correctly() {
        assert!(DeliveryError::unreachable("connection refused").is_retryable());
        assert!(DeliveryError::timeout(30).is_retryable());
        assert!(DeliveryError::endpoint_rejected(500, "oops").is_retryable());
        assert!(DeliveryError::endpoint_rejected(404, "gone").is_retryable());
        assert!(DeliveryError::storage("connection lost").is_retryable());
        assert!(DeliveryError::from(BrokerError::unavailable("down")).is_retryable());

        assert!(!DeliveryError::from(BrokerError::TopicNotFound("t".into())).is_retryable());
        assert!(!DeliveryError::not_found("sub").is_retryable());
        assert!(!DeliveryError::configuration("bad").is_retryable());
        assert!(!DeliveryError::ShutdownRequested.is_retryable());
    }

    #[test]
    fn core_errors_map_to_delivery_errors() {
        assert!(matches!(
            DeliveryError::from(CoreError::Conflict("x".into())),
            DeliveryError::StaleWrite { .. }
        ));
        assert!(matches!(
            DeliveryError::from(CoreError::Database("x".into())),
            DeliveryError::StorageUnavailable { .. }
        ));
        assert!(matches!(
            DeliveryError::from(CoreError::NotFound("x".into())),
            DeliveryError::NotFound { .. }
        ));
    }

    #[test]
    fn error_categories_mapped_correctly() {
        assert_eq!(ErrorCategory::from(&DeliveryError::timeout(5)), ErrorCategory::Network);
        assert_eq!(
            ErrorCategory::from(&DeliveryError::endpoint_rejected(503, "")),
            ErrorCategory::Endpoint
        );
        assert_eq!(
            ErrorCategory::from(&DeliveryError::from(BrokerError::unavailable("down"))),
            ErrorCategory::Broker
        );
        assert_eq!(ErrorCategory::Verification.to_string(), "verification");
    }

    #[test]
    fn error_display_format() {
        assert_eq!(DeliveryError::timeout(30).to_string(), "request timeout after 30s");
        assert_eq!(
            DeliveryError::endpoint_rejected(500, "").to_string(),
            "endpoint rejected delivery: HTTP 500"
        );
    }
}
