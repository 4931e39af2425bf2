//! Storage abstraction for subscription state.
//!
//! The delivery engine only needs a handful of operations from the catalog:
//! load subscriptions, write cursors with compare-and-set, bump statistics,
//! record verification, and read ACLs. Production wraps the Postgres
//! repositories in `ferry_core::storage`; tests use the in-memory mock.

use std::{future::Future, pin::Pin, sync::Arc};

use chrono::{DateTime, Utc};
use ferry_core::{
    error::{CoreError, Result},
    storage::Storage,
    AclResource, OffsetUpdate, ProjectId, Subscription, SubscriptionKey, Topic,
};

/// Storage operations required by workers, the manager, and the pull path.
pub trait SubscriptionStore: Send + Sync + 'static {
    /// Loads one subscription.
    ///
    /// Fails with `CoreError::NotFound` if it does not exist.
    fn load_subscription(
        &self,
        key: SubscriptionKey,
    ) -> Pin<Box<dyn Future<Output = Result<Subscription>> + Send + '_>>;

    /// Loads every subscription with a push endpoint.
    fn load_push_subscriptions(
        &self,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<Subscription>>> + Send + '_>>;

    /// Writes a cursor update, conditional on the stored `next_offset`.
    ///
    /// Fails with `CoreError::Conflict` when the expectation no longer holds.
    fn update_offsets(
        &self,
        key: SubscriptionKey,
        update: OffsetUpdate,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;

    /// Adds a consumed batch to the subscription's statistics.
    fn increment_stats(
        &self,
        key: SubscriptionKey,
        message_count: u64,
        byte_count: u64,
        at: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;

    /// Marks the subscription's push endpoint as verified.
    fn mark_verified(
        &self,
        key: SubscriptionKey,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;

    /// Loads a topic.
    ///
    /// Fails with `CoreError::NotFound` if it does not exist.
    fn load_topic(
        &self,
        project_id: ProjectId,
        name: String,
    ) -> Pin<Box<dyn Future<Output = Result<Topic>> + Send + '_>>;

    /// Adds a published batch to the topic's statistics.
    fn increment_topic_stats(
        &self,
        project_id: ProjectId,
        name: String,
        message_count: u64,
        byte_count: u64,
        at: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;

    /// Loads the identities authorized on a topic or subscription.
    fn load_acl(
        &self,
        resource: AclResource,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<String>>> + Send + '_>>;
}

/// Production store backed by the Postgres repositories.
pub struct PostgresSubscriptionStore {
    storage: Arc<Storage>,
}

impl PostgresSubscriptionStore {
    /// Creates a new PostgreSQL store adapter.
    pub fn new(storage: Arc<Storage>) -> Self {
        Self { storage }
    }
}

impl SubscriptionStore for PostgresSubscriptionStore {
    fn load_subscription(
        &self,
        key: SubscriptionKey,
    ) -> Pin<Box<dyn Future<Output = Result<Subscription>> + Send + '_>> {
        let storage = self.storage.clone();
        Box::pin(async move {
            storage
                .subscriptions
                .find(&key)
                .await?
                .ok_or_else(|| CoreError::NotFound(format!("subscription {key}")))
        })
    }

    fn load_push_subscriptions(
        &self,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<Subscription>>> + Send + '_>> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.subscriptions.list_push().await })
    }

    fn update_offsets(
        &self,
        key: SubscriptionKey,
        update: OffsetUpdate,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.subscriptions.update_offsets(&key, &update).await })
    }

    fn increment_stats(
        &self,
        key: SubscriptionKey,
        message_count: u64,
        byte_count: u64,
        at: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        let storage = self.storage.clone();
        Box::pin(async move {
            storage.subscriptions.increment_stats(&key, message_count, byte_count, at).await
        })
    }

    fn mark_verified(
        &self,
        key: SubscriptionKey,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.subscriptions.mark_verified(&key).await })
    }

    fn load_topic(
        &self,
        project_id: ProjectId,
        name: String,
    ) -> Pin<Box<dyn Future<Output = Result<Topic>> + Send + '_>> {
        let storage = self.storage.clone();
        Box::pin(async move {
            storage
                .topics
                .find(project_id, &name)
                .await?
                .ok_or_else(|| CoreError::NotFound(format!("topic {project_id}/{name}")))
        })
    }

    fn increment_topic_stats(
        &self,
        project_id: ProjectId,
        name: String,
        message_count: u64,
        byte_count: u64,
        at: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        let storage = self.storage.clone();
        Box::pin(async move {
            storage.topics.increment_stats(project_id, &name, message_count, byte_count, at).await
        })
    }

    fn load_acl(
        &self,
        resource: AclResource,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<String>>> + Send + '_>> {
        let storage = self.storage.clone();
        Box::pin(async move {
            match &resource {
                AclResource::Topic { project_id, name } => storage
                    .topics
                    .find(*project_id, name)
                    .await?
                    .map(|topic| topic.acl)
                    .ok_or_else(|| CoreError::NotFound(resource.to_string())),
                AclResource::Subscription(key) => storage
                    .subscriptions
                    .find(key)
                    .await?
                    .map(|subscription| subscription.acl)
                    .ok_or_else(|| CoreError::NotFound(resource.to_string())),
            }
        })
    }
}

pub mod mock {
    //! In-memory subscription store for testing.
    //!
    //! Applies the same compare-and-set rules as the Postgres adapter,
    //! records every accepted cursor write, and supports one-shot error
    //! injection per operation.

    use std::{collections::HashMap, future::Future, pin::Pin, sync::Arc};

    use chrono::{DateTime, Utc};
    use ferry_core::{
        error::{CoreError, Result},
        AclResource, Cursor, OffsetUpdate, ProjectId, Subscription, SubscriptionKey, Topic,
    };
    use tokio::sync::RwLock;

    use super::SubscriptionStore;

    /// Mock store holding subscriptions and topics in memory.
    #[derive(Clone, Default)]
    pub struct MockSubscriptionStore {
        subscriptions: Arc<RwLock<HashMap<SubscriptionKey, Subscription>>>,
        topics: Arc<RwLock<HashMap<(ProjectId, String), Topic>>>,
        offset_history: Arc<RwLock<Vec<(SubscriptionKey, OffsetUpdate)>>>,
        list_error: Arc<RwLock<Option<String>>>,
        load_error: Arc<RwLock<Option<String>>>,
        update_error: Arc<RwLock<Option<String>>>,
    }

    impl MockSubscriptionStore {
        /// Creates an empty store.
        pub fn new() -> Self {
            Self::default()
        }

        /// Inserts or replaces a subscription.
        pub async fn add_subscription(&self, subscription: Subscription) {
            self.subscriptions.write().await.insert(subscription.key.clone(), subscription);
        }

        /// Inserts or replaces a topic.
        pub async fn add_topic(&self, topic: Topic) {
            self.topics.write().await.insert((topic.project_id, topic.name.clone()), topic);
        }

        /// Removes a subscription.
        pub async fn remove_subscription(&self, key: &SubscriptionKey) {
            self.subscriptions.write().await.remove(key);
        }

        /// Returns the stored copy of a subscription.
        pub async fn subscription(&self, key: &SubscriptionKey) -> Option<Subscription> {
            self.subscriptions.read().await.get(key).cloned()
        }

        /// Returns the stored copy of a topic.
        pub async fn topic(&self, project_id: ProjectId, name: &str) -> Option<Topic> {
            self.topics.read().await.get(&(project_id, name.to_string())).cloned()
        }

        /// Overwrites a cursor, bypassing compare-and-set. Simulates a
        /// concurrent writer.
        pub async fn set_cursor(&self, key: &SubscriptionKey, cursor: Cursor) {
            if let Some(subscription) = self.subscriptions.write().await.get_mut(key) {
                subscription.cursor = cursor;
            }
        }

        /// Every accepted cursor update for `key`, oldest first.
        pub async fn offset_updates(&self, key: &SubscriptionKey) -> Vec<OffsetUpdate> {
            self.offset_history
                .read()
                .await
                .iter()
                .filter(|(k, _)| k == key)
                .map(|(_, update)| update.clone())
                .collect()
        }

        /// Fails the next `load_push_subscriptions` call.
        pub async fn inject_list_error(&self, error: impl Into<String>) {
            *self.list_error.write().await = Some(error.into());
        }

        /// Fails the next `load_subscription` call.
        pub async fn inject_load_error(&self, error: impl Into<String>) {
            *self.load_error.write().await = Some(error.into());
        }

        /// Fails the next `update_offsets` call.
        pub async fn inject_update_error(&self, error: impl Into<String>) {
            *self.update_error.write().await = Some(error.into());
        }
    }

    impl SubscriptionStore for MockSubscriptionStore {
        fn load_subscription(
            &self,
            key: SubscriptionKey,
        ) -> Pin<Box<dyn Future<Output = Result<Subscription>> + Send + '_>> {
            Box::pin(async move {
                if let Some(error) = self.load_error.write().await.take() {
                    return Err(CoreError::Database(error));
                }
                self.subscription(&key)
                    .await
                    .ok_or_else(|| CoreError::NotFound(format!("subscription {key}")))
            })
        }

        fn load_push_subscriptions(
            &self,
        ) -> Pin<Box<dyn Future<Output = Result<Vec<Subscription>>> + Send + '_>> {
            Box::pin(async move {
                if let Some(error) = self.list_error.write().await.take() {
                    return Err(CoreError::Database(error));
                }
                let mut subscriptions: Vec<_> = self
                    .subscriptions
                    .read()
                    .await
                    .values()
                    .filter(|s| s.push.is_some())
                    .cloned()
                    .collect();
                subscriptions.sort_by(|a, b| a.key.cmp(&b.key));
                Ok(subscriptions)
            })
        }

        fn update_offsets(
            &self,
            key: SubscriptionKey,
            update: OffsetUpdate,
        ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
            Box::pin(async move {
                if let Some(error) = self.update_error.write().await.take() {
                    return Err(CoreError::Database(error));
                }
                let mut subscriptions = self.subscriptions.write().await;
                let subscription = subscriptions
                    .get_mut(&key)
                    .ok_or_else(|| CoreError::NotFound(format!("subscription {key}")))?;
                subscription.apply(&update)?;
                self.offset_history.write().await.push((key, update));
                Ok(())
            })
        }

        fn increment_stats(
            &self,
            key: SubscriptionKey,
            message_count: u64,
            byte_count: u64,
            at: DateTime<Utc>,
        ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
            Box::pin(async move {
                let mut subscriptions = self.subscriptions.write().await;
                let subscription = subscriptions
                    .get_mut(&key)
                    .ok_or_else(|| CoreError::NotFound(format!("subscription {key}")))?;
                subscription.stats.record(message_count, byte_count, at);
                Ok(())
            })
        }

        fn mark_verified(
            &self,
            key: SubscriptionKey,
        ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
            Box::pin(async move {
                let mut subscriptions = self.subscriptions.write().await;
                let push = subscriptions
                    .get_mut(&key)
                    .and_then(|s| s.push.as_mut())
                    .ok_or_else(|| CoreError::NotFound(format!("push subscription {key}")))?;
                push.verified = true;
                Ok(())
            })
        }

        fn load_topic(
            &self,
            project_id: ProjectId,
            name: String,
        ) -> Pin<Box<dyn Future<Output = Result<Topic>> + Send + '_>> {
            Box::pin(async move {
                self.topic(project_id, &name)
                    .await
                    .ok_or_else(|| CoreError::NotFound(format!("topic {project_id}/{name}")))
            })
        }

        fn increment_topic_stats(
            &self,
            project_id: ProjectId,
            name: String,
            message_count: u64,
            byte_count: u64,
            at: DateTime<Utc>,
        ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
            Box::pin(async move {
                let mut topics = self.topics.write().await;
                let topic = topics
                    .get_mut(&(project_id, name.clone()))
                    .ok_or_else(|| CoreError::NotFound(format!("topic {project_id}/{name}")))?;
                topic.stats.record(message_count, byte_count, at);
                Ok(())
            })
        }

        fn load_acl(
            &self,
            resource: AclResource,
        ) -> Pin<Box<dyn Future<Output = Result<Vec<String>>> + Send + '_>> {
            Box::pin(async move {
                let acl = match &resource {
                    AclResource::Topic { project_id, name } => {
                        self.topic(*project_id, name).await.map(|t| t.acl)
                    },
                    AclResource::Subscription(key) => {
                        self.subscription(key).await.map(|s| s.acl)
                    },
                };
                acl.ok_or_else(|| CoreError::NotFound(resource.to_string()))
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use ferry_core::{Cursor, PendingAck, PushConfig, RetryPolicy};

    use super::{mock::MockSubscriptionStore, *};

    fn subscription() -> Subscription {
        Subscription::push(
            SubscriptionKey::new(ProjectId::new(), "sub"),
            "topic",
            PushConfig::new("http://localhost/push", 3, RetryPolicy::disabled()),
        )
    }

    #[tokio::test]
    async fn mock_applies_compare_and_set() {
        let store = MockSubscriptionStore::new();
        let sub = subscription();
        let key = sub.key.clone();
        store.add_subscription(sub).await;

        let stale = Cursor::at(0);
        store.update_offsets(key.clone(), OffsetUpdate::advance(&stale, 3, None)).await.unwrap();
        let err = store
            .update_offsets(key.clone(), OffsetUpdate::advance(&stale, 2, None))
            .await
            .unwrap_err();

        assert!(matches!(err, CoreError::Conflict(_)));
        assert_eq!(store.subscription(&key).await.unwrap().cursor, Cursor::at(3));
        assert_eq!(store.offset_updates(&key).await.len(), 1);
    }

    #[tokio::test]
    async fn injected_errors_are_one_shot() {
        let store = MockSubscriptionStore::new();
        let sub = subscription();
        let key = sub.key.clone();
        store.add_subscription(sub).await;

        store.inject_update_error("connection reset").await;
        let pending = PendingAck::new(1, Utc::now());
        let update = OffsetUpdate::reserve(&Cursor::at(0), pending);

        assert!(store.update_offsets(key.clone(), update.clone()).await.is_err());
        assert!(store.update_offsets(key, update).await.is_ok());
    }

    #[tokio::test]
    async fn mock_lists_only_push_subscriptions() {
        let store = MockSubscriptionStore::new();
        store.add_subscription(subscription()).await;
        store
            .add_subscription(Subscription::pull(SubscriptionKey::new(ProjectId::new(), "p"), "t"))
            .await;

        let push = store.load_push_subscriptions().await.unwrap();
        assert_eq!(push.len(), 1);
        assert!(push[0].push.is_some());
    }

    #[tokio::test]
    async fn missing_acl_resource_not_found() {
        let store = MockSubscriptionStore::new();
        let resource = AclResource::Topic { project_id: ProjectId::new(), name: "t".into() };

        let err = store.load_acl(resource).await.unwrap_err();
        assert!(matches!(err, CoreError::NotFound(_)));
    }
}
