//! Catalog repository tests against a live Postgres.
//!
//! Skipped unless `DATABASE_URL` points at a database the test may write to.
//! Every test works in a fresh project so runs do not interfere.

use anyhow::Result;
use chrono::Utc;
use ferry_core::{
    storage::Storage, CoreError, Cursor, OffsetUpdate, PendingAck, ProjectId, PushConfig,
    RetryPolicy, Subscription, SubscriptionKey, Topic,
};

async fn storage() -> Result<Option<Storage>> {
    let Ok(url) = std::env::var("DATABASE_URL") else {
        eprintln!("DATABASE_URL not set, skipping");
        return Ok(None);
    };
    let pool = sqlx::PgPool::connect(&url).await?;
    let storage = Storage::new(pool);
    storage.initialize().await?;
    Ok(Some(storage))
}

#[tokio::test]
async fn subscription_round_trips_through_catalog() -> Result<()> {
    let Some(storage) = storage().await? else { return Ok(()) };
    let project = ProjectId::new();
    storage.topics.create(&Topic::new(project, "orders")).await?;

    let key = SubscriptionKey::new(project, "push");
    let push = PushConfig::new("https://push.example.com/hook", 5, RetryPolicy::linear(3));
    let subscription = Subscription::push(key.clone(), "orders", push);
    storage.subscriptions.create(&subscription).await?;

    let found = storage.subscriptions.find(&key).await?.expect("subscription stored");
    assert_eq!(found.topic, "orders");
    assert_eq!(found.cursor, Cursor::at(0));
    let found_push = found.push.expect("push config stored");
    assert_eq!(found_push.max_messages, 5);
    assert_eq!(found_push.retry, RetryPolicy::linear(3));
    assert!(!found_push.verified);

    storage.subscriptions.mark_verified(&key).await?;
    let listed = storage.subscriptions.list_push().await?;
    assert!(listed.iter().any(|s| s.key == key && s.push.as_ref().is_some_and(|p| p.verified)));

    let err = storage.subscriptions.create(&subscription).await.unwrap_err();
    assert!(matches!(err, CoreError::Conflict(_)));

    assert!(storage.subscriptions.delete(&key).await?);
    assert!(storage.subscriptions.find(&key).await?.is_none());
    Ok(())
}

#[tokio::test]
async fn offset_writes_are_compare_and_set() -> Result<()> {
    let Some(storage) = storage().await? else { return Ok(()) };
    let key = SubscriptionKey::new(ProjectId::new(), "pull");
    storage.subscriptions.create(&Subscription::pull(key.clone(), "orders")).await?;

    let start = Cursor::at(0);
    let reserve = OffsetUpdate::reserve(&start, PendingAck::new(3, Utc::now()));
    storage.subscriptions.update_offsets(&key, &reserve).await?;

    let stored = storage.subscriptions.find(&key).await?.expect("subscription stored");
    assert_eq!(stored.cursor.pending_ack.as_ref().map(|p| p.end_offset), Some(3));

    let ack = OffsetUpdate::advance(&stored.cursor, 3, None);
    storage.subscriptions.update_offsets(&key, &ack).await?;
    assert_eq!(storage.subscriptions.find(&key).await?.expect("stored").cursor, Cursor::at(3));

    let stale = OffsetUpdate::advance(&start, 2, None);
    let err = storage.subscriptions.update_offsets(&key, &stale).await.unwrap_err();
    assert!(matches!(err, CoreError::Conflict(_)));

    let missing = SubscriptionKey::new(ProjectId::new(), "ghost");
    let err = storage.subscriptions.update_offsets(&missing, &ack).await.unwrap_err();
    assert!(matches!(err, CoreError::NotFound(_)));
    Ok(())
}

#[tokio::test]
async fn traffic_stats_accumulate() -> Result<()> {
    let Some(storage) = storage().await? else { return Ok(()) };
    let project = ProjectId::new();
    storage.topics.create(&Topic::new(project, "orders")).await?;

    let now = Utc::now();
    storage.topics.increment_stats(project, "orders", 2, 10, now).await?;
    storage
        .topics
        .increment_stats(project, "orders", 4, 20, now + chrono::Duration::seconds(2))
        .await?;

    let topic = storage.topics.find(project, "orders").await?.expect("topic stored");
    assert_eq!(topic.stats.message_count, 6);
    assert_eq!(topic.stats.byte_count, 30);
    assert!((topic.stats.rate - 2.0).abs() < 1e-3);

    let err = storage.topics.increment_stats(project, "ghost", 1, 1, now).await.unwrap_err();
    assert!(matches!(err, CoreError::NotFound(_)));
    Ok(())
}
