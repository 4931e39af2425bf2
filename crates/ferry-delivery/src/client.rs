//! HTTP sender for push delivery and endpoint verification.
//!
//! A delivery is a `POST` of a JSON envelope holding one message; any 2xx
//! status is success. Verification posts the subscription's verification
//! hash as a plain-text body under the same rule. The sender holds no
//! per-subscription state and is shared by every worker.

use std::{future::Future, pin::Pin, time::Duration};

use ferry_core::Message;
use reqwest::Response;
use serde::{Deserialize, Serialize};
use tracing::{info_span, Instrument};

use crate::error::{DeliveryError, Result};

const MAX_ERROR_BODY_SIZE: usize = 1024;

/// Configuration for the push HTTP client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Timeout for each HTTP request.
    pub timeout: Duration,
    /// User agent string for requests.
    pub user_agent: String,
    /// Maximum number of redirects to follow.
    pub max_redirects: u32,
    /// Whether to verify TLS certificates.
    pub verify_tls: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: "Ferry-Push/1.0".to_string(),
            max_redirects: 3,
            verify_tls: true,
        }
    }
}

/// JSON body of a push delivery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushEnvelope {
    /// The delivered message.
    pub message: Message,
    /// Path of the subscription the message was delivered for.
    pub subscription: String,
}

/// Transport used by workers to reach push endpoints.
///
/// Both methods resolve to the response status on 2xx and to a categorized
/// `DeliveryError` otherwise.
pub trait PushSender: Send + Sync + 'static {
    /// Delivers one message to `endpoint`.
    fn send_message(
        &self,
        endpoint: String,
        envelope: PushEnvelope,
    ) -> Pin<Box<dyn Future<Output = Result<u16>> + Send + '_>>;

    /// Sends the verification challenge to `endpoint`.
    fn send_verification(
        &self,
        endpoint: String,
        verification_hash: String,
    ) -> Pin<Box<dyn Future<Output = Result<u16>> + Send + '_>>;
}

/// Production sender backed by a pooled `reqwest` client.
#[derive(Debug, Clone)]
pub struct HttpSender {
    client: reqwest::Client,
    config: ClientConfig,
}

impl HttpSender {
    /// Creates a new sender with the given configuration.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::ConfigurationError` if the HTTP client cannot
    /// be built from the provided settings.
    pub fn new(config: ClientConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .user_agent(&config.user_agent)
            .redirect(reqwest::redirect::Policy::limited(config.max_redirects as usize))
            .danger_accept_invalid_certs(!config.verify_tls)
            .build()
            .map_err(|e| {
                DeliveryError::configuration(format!("failed to build HTTP client: {e}"))
            })?;

        Ok(Self { client, config })
    }

    /// Creates a new sender with default configuration.
    pub fn with_defaults() -> Result<Self> {
        Self::new(ClientConfig::default())
    }

    async fn post(&self, request: reqwest::RequestBuilder) -> Result<u16> {
        let start_time = std::time::Instant::now();

        let response = match request.send().await {
            Ok(response) => response,
            Err(e) => {
                tracing::warn!(
                    duration_ms = start_time.elapsed().as_millis(),
                    error = %e,
                    "push request failed"
                );
                if e.is_timeout() {
                    return Err(DeliveryError::timeout(self.config.timeout.as_secs()));
                }
                return Err(DeliveryError::unreachable(e.to_string()));
            },
        };

        let status_code = response.status().as_u16();
        tracing::debug!(
            status = status_code,
            duration_ms = start_time.elapsed().as_millis(),
            "received response"
        );

        if response.status().is_success() {
            return Ok(status_code);
        }

        let body = read_error_body(response).await;
        tracing::warn!(status = status_code, "endpoint rejected request");
        Err(DeliveryError::endpoint_rejected(status_code, body))
    }
}

impl PushSender for HttpSender {
    fn send_message(
        &self,
        endpoint: String,
        envelope: PushEnvelope,
    ) -> Pin<Box<dyn Future<Output = Result<u16>> + Send + '_>> {
        let span = info_span!(
            "push_delivery",
            subscription = %envelope.subscription,
            message_id = %envelope.message.message_id,
            url = %endpoint
        );

        Box::pin(
            async move {
                let request = self.client.post(&endpoint).json(&envelope);
                self.post(request).await
            }
            .instrument(span),
        )
    }

    fn send_verification(
        &self,
        endpoint: String,
        verification_hash: String,
    ) -> Pin<Box<dyn Future<Output = Result<u16>> + Send + '_>> {
        let span = info_span!("push_verification", url = %endpoint);

        Box::pin(
            async move {
                let request = self
                    .client
                    .post(&endpoint)
                    .header("content-type", "text/plain")
                    .body(verification_hash);

                self.post(request).await.map_err(|e| match e {
                    DeliveryError::EndpointRejected { status_code, .. } => {
                        DeliveryError::verification_failed(format!("HTTP {status_code}"))
                    },
                    other => DeliveryError::verification_failed(other.to_string()),
                })
            }
            .instrument(span),
        )
    }
}

async fn read_error_body(response: Response) -> String {
    match response.bytes().await {
        Ok(bytes) if bytes.len() > MAX_ERROR_BODY_SIZE => {
            format!("{}... (truncated)", String::from_utf8_lossy(&bytes[..MAX_ERROR_BODY_SIZE]))
        },
        Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
        Err(e) => format!("[failed to read response body: {e}]"),
    }
}

pub mod mock {
    //! Scripted sender for exercising workers without a network.

    use std::{collections::VecDeque, future::Future, pin::Pin, sync::Arc};

    use tokio::sync::Mutex;

    use super::{PushEnvelope, PushSender};
    use crate::error::{DeliveryError, Result};

    /// Result the scripted sender produces for one call.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum Outcome {
        /// Endpoint answers with this status.
        Status(u16),
        /// Endpoint cannot be reached.
        Unreachable,
    }

    impl Outcome {
        fn into_result(self, verification: bool) -> Result<u16> {
            match self {
                Self::Status(code) if (200..300).contains(&code) => Ok(code),
                Self::Status(code) if verification => {
                    Err(DeliveryError::verification_failed(format!("HTTP {code}")))
                },
                Self::Status(code) => Err(DeliveryError::endpoint_rejected(code, "")),
                Self::Unreachable if verification => {
                    Err(DeliveryError::verification_failed("connection refused"))
                },
                Self::Unreachable => Err(DeliveryError::unreachable("connection refused")),
            }
        }
    }

    /// A delivery the sender observed.
    #[derive(Debug, Clone)]
    pub struct RecordedDelivery {
        /// Target endpoint.
        pub endpoint: String,
        /// Delivered envelope.
        pub envelope: PushEnvelope,
        /// Outcome returned to the caller.
        pub outcome: Outcome,
    }

    #[derive(Debug)]
    struct Script {
        queued: VecDeque<Outcome>,
        fallback: Outcome,
    }

    impl Script {
        fn next(&mut self) -> Outcome {
            self.queued.pop_front().unwrap_or(self.fallback)
        }
    }

    /// Sender replaying scripted outcomes and recording every call.
    ///
    /// Queued outcomes are consumed first; afterwards the fallback applies.
    /// Both default to `200`.
    #[derive(Debug, Clone)]
    pub struct ScriptedSender {
        deliveries: Arc<Mutex<Script>>,
        verifications: Arc<Mutex<Script>>,
        delivered: Arc<Mutex<Vec<RecordedDelivery>>>,
        challenges: Arc<Mutex<Vec<(String, String)>>>,
    }

    impl ScriptedSender {
        /// Creates a sender that accepts everything.
        pub fn new() -> Self {
            let accept = || Script { queued: VecDeque::new(), fallback: Outcome::Status(200) };
            Self {
                deliveries: Arc::new(Mutex::new(accept())),
                verifications: Arc::new(Mutex::new(accept())),
                delivered: Arc::new(Mutex::new(Vec::new())),
                challenges: Arc::new(Mutex::new(Vec::new())),
            }
        }

        /// Queues outcomes for upcoming deliveries.
        pub async fn queue(&self, outcomes: impl IntoIterator<Item = Outcome>) {
            self.deliveries.lock().await.queued.extend(outcomes);
        }

        /// Sets the outcome used once the delivery queue is empty.
        pub async fn set_fallback(&self, outcome: Outcome) {
            self.deliveries.lock().await.fallback = outcome;
        }

        /// Queues outcomes for upcoming verification attempts.
        pub async fn queue_verification(&self, outcomes: impl IntoIterator<Item = Outcome>) {
            self.verifications.lock().await.queued.extend(outcomes);
        }

        /// Sets the verification outcome used once its queue is empty.
        pub async fn set_verification_fallback(&self, outcome: Outcome) {
            self.verifications.lock().await.fallback = outcome;
        }

        /// Every delivery attempted so far, in order.
        pub async fn deliveries(&self) -> Vec<RecordedDelivery> {
            self.delivered.lock().await.clone()
        }

        /// Message IDs of delivery attempts, in order.
        pub async fn attempted_ids(&self) -> Vec<String> {
            self.delivered
                .lock()
                .await
                .iter()
                .map(|d| d.envelope.message.message_id.clone())
                .collect()
        }

        /// Message IDs of successful deliveries, in order.
        pub async fn delivered_ids(&self) -> Vec<String> {
            self.delivered
                .lock()
                .await
                .iter()
                .filter(|d| matches!(d.outcome, Outcome::Status(200..=299)))
                .map(|d| d.envelope.message.message_id.clone())
                .collect()
        }

        /// Verification challenges sent so far as `(endpoint, hash)`.
        pub async fn verifications(&self) -> Vec<(String, String)> {
            self.challenges.lock().await.clone()
        }
    }

    impl Default for ScriptedSender {
        fn default() -> Self {
            Self::new()
        }
    }

    impl PushSender for ScriptedSender {
        fn send_message(
            &self,
            endpoint: String,
            envelope: PushEnvelope,
        ) -> Pin<Box<dyn Future<Output = Result<u16>> + Send + '_>> {
            Box::pin(async move {
                let outcome = self.deliveries.lock().await.next();
                self.delivered.lock().await.push(RecordedDelivery { endpoint, envelope, outcome });
                outcome.into_result(false)
            })
        }

        fn send_verification(
            &self,
            endpoint: String,
            verification_hash: String,
        ) -> Pin<Box<dyn Future<Output = Result<u16>> + Send + '_>> {
            Box::pin(async move {
                let outcome = self.verifications.lock().await.next();
                self.challenges.lock().await.push((endpoint, verification_hash));
                outcome.into_result(true)
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use wiremock::{matchers, Mock, MockServer, ResponseTemplate};

    use super::*;

    fn envelope() -> PushEnvelope {
        let mut message = Message::new(&b"payload"[..], BTreeMap::new());
        message.message_id = "0".to_string();
        PushEnvelope { message, subscription: "projects/p/subscriptions/s".to_string() }
    }

    #[tokio::test]
    async fn successful_delivery() {
        let mock_server = MockServer::start().await;

        Mock::given(matchers::method("POST"))
            .and(matchers::path("/push"))
            .respond_with(ResponseTemplate::new(204))
            .mount(&mock_server)
            .await;

        let sender = HttpSender::with_defaults().unwrap();
        let status = sender.send_message(format!("{}/push", mock_server.uri()), envelope()).await;

        assert_eq!(status.unwrap(), 204);
    }

    #[tokio::test]
    async fn server_error_is_rejection() {
        let mock_server = MockServer::start().await;

        Mock::given(matchers::method("POST"))
            .respond_with(ResponseTemplate::new(500).set_body_string("Internal Server Error"))
            .mount(&mock_server)
            .await;

        let sender = HttpSender::with_defaults().unwrap();
        let err = sender.send_message(mock_server.uri(), envelope()).await.unwrap_err();

        match err {
            DeliveryError::EndpointRejected { status_code, body } => {
                assert_eq!(status_code, 500);
                assert_eq!(body, "Internal Server Error");
            },
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn unreachable_endpoint_is_network_error() {
        let sender = HttpSender::with_defaults().unwrap();
        let err = sender.send_message("http://127.0.0.1:1/push".into(), envelope()).await;

        assert!(matches!(err, Err(DeliveryError::EndpointUnreachable { .. })));
    }

    #[tokio::test]
    async fn slow_endpoint_times_out() {
        let mock_server = MockServer::start().await;

        Mock::given(matchers::method("POST"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(2)))
            .mount(&mock_server)
            .await;

        let config = ClientConfig { timeout: Duration::from_millis(100), ..Default::default() };
        let sender = HttpSender::new(config).unwrap();
        let err = sender.send_message(mock_server.uri(), envelope()).await.unwrap_err();

        assert!(matches!(err, DeliveryError::Timeout { .. }));
    }

    #[tokio::test]
    async fn verification_posts_hash() {
        let mock_server = MockServer::start().await;

        Mock::given(matchers::method("POST"))
            .and(matchers::body_string("abc123"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&mock_server)
            .await;

        let sender = HttpSender::with_defaults().unwrap();
        let status = sender.send_verification(mock_server.uri(), "abc123".into()).await.unwrap();

        assert_eq!(status, 200);
    }

    #[tokio::test]
    async fn failed_verification_reported() {
        let mock_server = MockServer::start().await;

        Mock::given(matchers::method("POST"))
            .respond_with(ResponseTemplate::new(403))
            .mount(&mock_server)
            .await;

        let sender = HttpSender::with_defaults().unwrap();
        let err = sender.send_verification(mock_server.uri(), "abc".into()).await.unwrap_err();

        assert!(matches!(err, DeliveryError::VerificationFailed { .. }));
    }

    #[tokio::test]
    async fn long_error_bodies_truncated() {
        let mock_server = MockServer::start().await;

        Mock::given(matchers::method("POST"))
            .respond_with(ResponseTemplate::new(502).set_body_string("x".repeat(4096)))
            .mount(&mock_server)
            .await;

        let sender = HttpSender::with_defaults().unwrap();
        let err = sender.send_message(mock_server.uri(), envelope()).await.unwrap_err();

        let DeliveryError::EndpointRejected { body, .. } = err else {
            panic!("expected rejection");
        };
        assert!(body.ends_with("... (truncated)"));
        assert!(body.len() < 2048);
    }
}
