//! Supervision of push workers.
//!
//! The manager owns one registration per known push subscription. Each
//! running worker is wrapped in a supervisor task that records how the
//! worker ended, so a panicking or failing worker marks only its own
//! subscription inactive and never disturbs its siblings or the manager.

use std::{collections::BTreeMap, sync::Arc, time::Duration};

use ferry_core::{CoreError, Subscription, SubscriptionKey};
use tokio::{
    sync::{Mutex, RwLock},
    task::{AbortHandle, JoinHandle},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    context::DeliveryContext,
    error::{DeliveryError, Result},
    worker::{validate_push, Fault, PushWorker, WorkerStatus},
};

struct Runner {
    token: CancellationToken,
    worker: AbortHandle,
    supervisor: JoinHandle<()>,
}

struct Registration {
    subscription: Subscription,
    status: Arc<RwLock<WorkerStatus>>,
    runner: Option<Runner>,
    quarantined: bool,
}

/// Registry and supervisor of per-subscription push workers.
pub struct DeliveryManager {
    context: DeliveryContext,
    token: CancellationToken,
    registry: Mutex<BTreeMap<SubscriptionKey, Registration>>,
}

impl DeliveryManager {
    /// Creates an empty manager.
    pub fn new(context: DeliveryContext) -> Self {
        Self { context, token: CancellationToken::new(), registry: Mutex::new(BTreeMap::new()) }
    }

    /// Registers every push subscription found in storage.
    ///
    /// Malformed subscriptions and subscriptions whose topic is missing are
    /// registered as inactive with a recorded fault and are not started.
    /// Already registered subscriptions are left alone. Returns the number
    /// of newly registered subscriptions that can be started.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::StorageUnavailable` if the subscriptions or
    /// their topics cannot be read.
    pub async fn load_push_subs(&self) -> Result<usize> {
        let subscriptions = self.context.store.load_push_subscriptions().await.map_err(|e| {
            error!(error = %e, "failed to load push subscriptions");
            DeliveryError::from(e)
        })?;

        let mut registry = self.registry.lock().await;
        let mut loaded = 0;
        let mut skipped = 0;

        for subscription in subscriptions {
            if registry.contains_key(&subscription.key) {
                continue;
            }

            let problem = self.check(&subscription).await?;
            let mut status = WorkerStatus::inactive(&subscription);
            let quarantined = problem.is_some();

            if let Some(problem) = problem {
                warn!(
                    subscription = %subscription.key,
                    error = %problem,
                    "skipping malformed push subscription"
                );
                status.last_fault = Some(Fault::new(&problem, self.context.clock.now_utc()));
                skipped += 1;
            } else {
                loaded += 1;
            }

            registry.insert(
                subscription.key.clone(),
                Registration {
                    subscription,
                    status: Arc::new(RwLock::new(status)),
                    runner: None,
                    quarantined,
                },
            );
        }

        info!(loaded, skipped, "push subscriptions loaded");
        Ok(loaded)
    }

    /// Starts a worker for every registered subscription that is not
    /// running and not quarantined. Returns without waiting on the workers.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::ShutdownRequested` after shutdown.
    pub async fn start_all(&self) -> Result<usize> {
        self.ensure_running()?;

        let mut registry = self.registry.lock().await;
        let mut started = 0;

        for registration in registry.values_mut() {
            if registration.runner.is_some() || registration.quarantined {
                continue;
            }
            match self.spawn(registration).await {
                Ok(()) => started += 1,
                Err(e) => warn!(
                    subscription = %registration.subscription.key,
                    error = %e,
                    "failed to start push worker"
                ),
            }
        }

        info!(started, "push workers started");
        Ok(started)
    }

    /// Registers and starts a worker for a new or changed subscription.
    ///
    /// A worker already serving the same subscription is stopped first. The
    /// registry is not locked while waiting for it, so other subscriptions
    /// stay manageable.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::InvalidSubscription` for malformed push
    /// subscriptions, `DeliveryError::NotFound` if the topic does not exist,
    /// and `DeliveryError::ShutdownRequested` after shutdown.
    pub async fn add(&self, subscription: Subscription) -> Result<()> {
        self.ensure_running()?;
        if let Some(problem) = self.check(&subscription).await? {
            return Err(problem);
        }

        let key = subscription.key.clone();
        let previous = self.registry.lock().await.remove(&key);
        if let Some(previous) = previous {
            self.stop(&key, previous.runner).await;
        }

        let mut registration = Registration {
            status: Arc::new(RwLock::new(WorkerStatus::inactive(&subscription))),
            subscription,
            runner: None,
            quarantined: false,
        };
        self.spawn(&mut registration).await?;
        info!(subscription = %key, "push subscription added");

        let displaced = self.registry.lock().await.insert(key.clone(), registration);
        if let Some(displaced) = displaced {
            self.stop(&key, displaced.runner).await;
        }
        Ok(())
    }

    /// Stops and deregisters a subscription's worker.
    ///
    /// Any in-flight batch is left unacknowledged.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::NotFound` if the subscription is not registered.
    pub async fn remove(&self, key: &SubscriptionKey) -> Result<()> {
        let registration = self
            .registry
            .lock()
            .await
            .remove(key)
            .ok_or_else(|| DeliveryError::not_found(key.to_string()))?;

        self.stop(key, registration.runner).await;
        info!(subscription = %key, "push subscription removed");
        Ok(())
    }

    /// Runs the verification handshake now and restarts the worker with the
    /// result.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::VerificationFailed` if the endpoint rejects the
    /// challenge, and any error [`Self::reload`] returns.
    pub async fn verify(&self, key: &SubscriptionKey) -> Result<()> {
        let subscription = self.context.store.load_subscription(key.clone()).await?;
        let push = validate_push(&subscription)?;

        if !push.verified {
            let challenge = self
                .context
                .sender
                .send_verification(push.endpoint.clone(), push.verification_hash.clone())
                .await;

            if let Err(e) = challenge {
                let status = self.registry.lock().await.get(key).map(|r| r.status.clone());
                if let Some(status) = status {
                    status.write().await.last_fault =
                        Some(Fault::new(&e, self.context.clock.now_utc()));
                }
                return Err(e);
            }
            self.context.store.mark_verified(key.clone()).await?;
            info!(subscription = %key, "push endpoint verified on demand");
        }

        self.reload(key).await
    }

    /// Re-reads a subscription from storage and restarts its worker.
    ///
    /// Clears a quarantine and the recorded fault. A subscription deleted
    /// from storage is deregistered.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::NotFound` if the subscription no longer exists
    /// and whatever [`Self::add`] returns for the reloaded state.
    pub async fn reload(&self, key: &SubscriptionKey) -> Result<()> {
        match self.context.store.load_subscription(key.clone()).await {
            Ok(subscription) => self.add(subscription).await,
            Err(CoreError::NotFound(resource)) => {
                let registration = self.registry.lock().await.remove(key);
                if let Some(registration) = registration {
                    self.stop(key, registration.runner).await;
                }
                Err(DeliveryError::not_found(resource))
            },
            Err(e) => Err(e.into()),
        }
    }

    /// Current status of one subscription's worker.
    pub async fn status(&self, key: &SubscriptionKey) -> Option<WorkerStatus> {
        let registry = self.registry.lock().await;
        let registration = registry.get(key)?;
        let status = registration.status.read().await.clone();
        Some(status)
    }

    /// Status of every registered subscription, ordered by key.
    pub async fn statuses(&self) -> Vec<(SubscriptionKey, WorkerStatus)> {
        let registry = self.registry.lock().await;
        let mut statuses = Vec::with_capacity(registry.len());
        for (key, registration) in registry.iter() {
            statuses.push((key.clone(), registration.status.read().await.clone()));
        }
        statuses
    }

    /// Cancels every worker and waits for them to exit.
    ///
    /// Workers commit a fully delivered batch before exiting; partially
    /// delivered batches are left unacknowledged.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::ShutdownTimeout` with the number of workers
    /// that had not exited when `timeout` elapsed.
    pub async fn shutdown(&self, timeout: Duration) -> Result<()> {
        let (workers, supervisors): (Vec<AbortHandle>, Vec<JoinHandle<()>>) = {
            let mut registry = self.registry.lock().await;
            registry
                .values_mut()
                .filter_map(|registration| registration.runner.take())
                .map(|runner| (runner.worker, runner.supervisor))
                .unzip()
        };

        info!(
            worker_count = supervisors.len(),
            timeout_seconds = timeout.as_secs(),
            "initiating graceful worker shutdown"
        );
        self.token.cancel();

        let total = supervisors.len();
        let mut remaining = supervisors;
        let join_all = async {
            while let Some(handle) = remaining.last_mut() {
                if let Err(join_error) = handle.await {
                    error!(error = %join_error, "worker supervisor failed during shutdown");
                }
                remaining.pop();
            }
        };

        if tokio::time::timeout(timeout, join_all).await.is_err() {
            let pending = remaining.iter().filter(|h| !h.is_finished()).count();
            error!(
                pending,
                total,
                timeout_seconds = timeout.as_secs(),
                "worker shutdown timed out, some workers may still be running"
            );
            for worker in &workers {
                worker.abort();
            }
            for handle in &remaining {
                handle.abort();
            }
            return Err(DeliveryError::ShutdownTimeout { pending });
        }

        info!(total, "delivery manager shutdown completed");
        Ok(())
    }

    fn ensure_running(&self) -> Result<()> {
        if self.token.is_cancelled() {
            return Err(DeliveryError::ShutdownRequested);
        }
        Ok(())
    }

    /// Returns the reason a subscription cannot be served, if any.
    async fn check(&self, subscription: &Subscription) -> Result<Option<DeliveryError>> {
        if let Err(e) = validate_push(subscription) {
            return Ok(Some(e));
        }

        match self
            .context
            .store
            .load_topic(subscription.key.project_id, subscription.topic.clone())
            .await
        {
            Ok(_) => Ok(None),
            Err(CoreError::NotFound(_)) => Ok(Some(DeliveryError::not_found(format!(
                "topic {} of {}",
                subscription.topic, subscription.key
            )))),
            Err(e) => Err(e.into()),
        }
    }

    async fn spawn(&self, registration: &mut Registration) -> Result<()> {
        let token = self.token.child_token();
        let key = registration.subscription.key.clone();
        let status = registration.status.clone();

        let worker = PushWorker::new(
            registration.subscription.clone(),
            self.context.clone(),
            token.clone(),
            status.clone(),
        )?;

        {
            let mut status = status.write().await;
            status.active = true;
            status.last_fault = None;
        }

        let handle = tokio::spawn(worker.run());
        let worker = handle.abort_handle();
        let clock = self.context.clock.clone();
        let supervisor = tokio::spawn(async move {
            let failure = match handle.await {
                Ok(Ok(())) => None,
                Ok(Err(e)) => {
                    error!(subscription = %key, error = %e, "push worker terminated with error");
                    Some(e)
                },
                Err(join_error) => {
                    let message = panic_message(join_error);
                    error!(subscription = %key, panic = %message, "push worker panicked");
                    Some(DeliveryError::WorkerPanic { subscription: key.to_string(), message })
                },
            };

            let mut status = status.write().await;
            status.active = false;
            if let Some(failure) = failure {
                status.last_fault = Some(Fault::new(&failure, clock.now_utc()));
            }
        });

        registration.quarantined = false;
        registration.runner = Some(Runner { token, worker, supervisor });
        Ok(())
    }

    async fn stop(&self, key: &SubscriptionKey, runner: Option<Runner>) {
        let Some(runner) = runner else {
            return;
        };
        runner.token.cancel();

        let timeout = self.context.config.shutdown_timeout;
        match tokio::time::timeout(timeout, runner.supervisor).await {
            Ok(Ok(())) => debug!(subscription = %key, "push worker stopped"),
            Ok(Err(join_error)) => {
                error!(subscription = %key, error = %join_error, "worker supervisor failed");
            },
            Err(_) => {
                warn!(
                    subscription = %key,
                    timeout_seconds = timeout.as_secs(),
                    "push worker did not stop in time, aborting it"
                );
                runner.worker.abort();
            },
        }
    }
}

impl Drop for DeliveryManager {
    fn drop(&mut self) {
        if self.token.is_cancelled() {
            return;
        }
        let active = self
            .registry
            .get_mut()
            .values()
            .filter(|r| r.runner.as_ref().is_some_and(|runner| !runner.supervisor.is_finished()))
            .count();

        if active > 0 {
            warn!(
                active_workers = active,
                "DeliveryManager dropped with running workers, cancelling them; call shutdown() for a clean stop"
            );
        }
        self.token.cancel();
    }
}

fn panic_message(join_error: tokio::task::JoinError) -> String {
    if !join_error.is_panic() {
        return join_error.to_string();
    }
    let payload = join_error.into_panic();
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
