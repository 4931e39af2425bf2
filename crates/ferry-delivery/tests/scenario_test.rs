//! End-to-end delivery scenarios: a topic with five messages consumed by a
//! push subscription with batches of three.

mod common;

use std::{sync::Arc, time::Duration};

use anyhow::Result;
use common::{wait_until, TestEnv};
use ferry_core::{Cursor, RealClock, RetryPolicy};
use ferry_delivery::{
    client::mock::Outcome, DeliveryConfig, DeliveryContext, DeliveryManager, HttpSender,
    PushEnvelope,
};
use wiremock::{matchers, Mock, MockServer, ResponseTemplate};

#[tokio::test]
async fn healthy_endpoint_receives_two_batches_in_order() -> Result<()> {
    let server = MockServer::start().await;
    Mock::given(matchers::method("POST"))
        .and(matchers::path("/push"))
        .respond_with(ResponseTemplate::new(200))
        .expect(5)
        .mount(&server)
        .await;

    let env = TestEnv::new();
    env.topic("t", 5).await?;
    let mut subscription = env.push_subscription("s", "t", 3, RetryPolicy::disabled()).await;
    if let Some(push) = subscription.push.as_mut() {
        push.endpoint = format!("{}/push", server.uri());
    }
    env.store.add_subscription(subscription.clone()).await;

    let config = DeliveryConfig { poll_interval: Duration::from_millis(10), ..env.config.clone() };
    let context = DeliveryContext::new(
        env.broker.clone(),
        Arc::new(env.store.clone()),
        Arc::new(HttpSender::new(config.client_config.clone())?),
        Arc::new(RealClock::new()),
        config,
    );
    let manager = DeliveryManager::new(context);
    manager.load_push_subs().await?;
    manager.start_all().await?;

    let (store, key) = (&env.store, &subscription.key);
    wait_until("both batches were acknowledged", || async move {
        store.subscription(key).await.is_some_and(|s| s.cursor.offset == 5)
    })
    .await?;
    manager.shutdown(Duration::from_secs(5)).await?;

    let updates = env.store.offset_updates(key).await;
    let cursors: Vec<_> = updates
        .iter()
        .map(|u| (u.offset, u.next_offset, u.pending_ack.as_ref().map(|p| p.end_offset)))
        .collect();
    assert_eq!(cursors, [(0, 0, Some(3)), (3, 3, None), (3, 3, Some(5)), (5, 5, None)]);

    let delivered: Vec<String> = server
        .received_requests()
        .await
        .unwrap_or_default()
        .iter()
        .map(|request| request.body_json::<PushEnvelope>())
        .collect::<std::result::Result<Vec<_>, _>>()?
        .into_iter()
        .map(|envelope| String::from_utf8_lossy(&envelope.message.data).into_owned())
        .collect();
    assert_eq!(delivered, ["m0", "m1", "m2", "m3", "m4"]);

    let stored = env.stored(key).await?;
    assert_eq!(stored.stats.message_count, 5);
    assert_eq!(stored.stats.byte_count, 10);
    Ok(())
}

#[tokio::test]
async fn failing_second_batch_is_retried_then_abandoned() -> Result<()> {
    let env = TestEnv::new();
    env.topic("t", 5).await?;
    let subscription = env.push_subscription("s", "t", 3, RetryPolicy::linear(2)).await;
    env.sender.queue([Outcome::Status(200); 3]).await;
    env.sender.set_fallback(Outcome::Status(500)).await;

    let manager = DeliveryManager::new(env.context());
    manager.add(subscription.clone()).await?;

    let (store, key) = (&env.store, &subscription.key);
    wait_until("the second batch was abandoned", || async move {
        store
            .offset_updates(key)
            .await
            .iter()
            .skip(2)
            .any(|u| u.pending_ack.is_none())
    })
    .await?;

    let updates = env.store.offset_updates(key).await;
    assert_eq!((updates[1].offset, updates[1].next_offset), (3, 3));
    for update in &updates[2..] {
        assert_eq!((update.offset, update.next_offset), (3, 3), "offset moved while failing");
    }

    let attempted = env.sender.attempted_ids().await;
    assert_eq!(attempted[..3], ["0", "1", "2"]);
    assert!(attempted[3..].iter().all(|id| id == "3"), "batch continued past a failure");
    assert!(
        attempted.iter().filter(|id| *id == "3").count() >= 6,
        "expected one attempt every 2s within the 10s ack deadline"
    );

    env.sender.set_fallback(Outcome::Status(200)).await;
    wait_until("the recovered endpoint received the rest", || async move {
        store.subscription(key).await.is_some_and(|s| s.cursor == Cursor::at(5))
    })
    .await?;

    let delivered = env.sender.delivered_ids().await;
    assert_eq!(delivered, ["0", "1", "2", "3", "4"]);

    manager.shutdown(Duration::from_secs(5)).await?;
    Ok(())
}
