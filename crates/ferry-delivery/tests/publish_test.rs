//! Publishing and ACL checks.

mod common;

use std::{collections::BTreeMap, time::Duration};

use anyhow::Result;
use common::TestEnv;
use ferry_broker::Broker;
use ferry_core::{AclResource, Clock, Message, Principal, Topic};
use ferry_delivery::{AccessControl, DeliveryError, Publisher};

fn messages(payloads: &[&str]) -> Vec<Message> {
    payloads.iter().map(|p| Message::new(p.as_bytes().to_vec(), BTreeMap::new())).collect()
}

#[tokio::test]
async fn publish_returns_ids_in_order_and_counts_traffic() -> Result<()> {
    let env = TestEnv::new();
    let topic = env.topic("orders", 0).await?;
    let publisher = Publisher::new(env.context());

    let ids = publisher.publish(env.project, "orders", messages(&["a", "bb", "ccc"])).await?;
    assert_eq!(ids, ["0", "1", "2"]);

    let stored = env.store.topic(env.project, "orders").await.expect("topic stored");
    assert_eq!(stored.stats.message_count, 3);
    assert_eq!(stored.stats.byte_count, 6);

    let records = env.broker.consume(topic.broker_name(), 0, 10, true).await?;
    assert!(records.iter().all(|r| r.message.publish_time == env.clock.now_utc()));
    Ok(())
}

#[tokio::test]
async fn publish_rate_reflects_elapsed_time() -> Result<()> {
    let env = TestEnv::new();
    env.topic("orders", 0).await?;
    let publisher = Publisher::new(env.context());

    publisher.publish(env.project, "orders", messages(&["a"])).await?;
    env.clock.advance(Duration::from_secs(2));
    publisher.publish(env.project, "orders", messages(&["b", "c", "d", "e"])).await?;

    let stored = env.store.topic(env.project, "orders").await.expect("topic stored");
    assert_eq!(stored.stats.message_count, 5);
    assert!((stored.stats.rate - 2.0).abs() < f64::EPSILON);
    Ok(())
}

#[tokio::test]
async fn publish_to_unknown_topic_fails() -> Result<()> {
    let env = TestEnv::new();
    let publisher = Publisher::new(env.context());

    let err = publisher.publish(env.project, "ghost", messages(&["a"])).await.unwrap_err();
    assert!(matches!(err, DeliveryError::NotFound { .. }));
    Ok(())
}

#[tokio::test]
async fn publish_during_outage_is_transient() -> Result<()> {
    let env = TestEnv::new();
    env.topic("orders", 0).await?;
    env.broker.set_outage(true);
    let publisher = Publisher::new(env.context());

    let err = publisher.publish(env.project, "orders", messages(&["a"])).await.unwrap_err();
    assert!(err.is_retryable());

    let stored = env.store.topic(env.project, "orders").await.expect("topic stored");
    assert_eq!(stored.stats.message_count, 0);
    Ok(())
}

#[tokio::test]
async fn acl_admits_listed_principals_only() -> Result<()> {
    let env = TestEnv::new();
    let mut topic = Topic::new(env.project, "orders");
    topic.acl = vec!["CN=billing,O=Example".to_string()];
    env.store.add_topic(topic).await;

    let mut subscription = env.pull_subscription("s", "orders").await;
    subscription.acl = vec!["CN=reports,O=Example".to_string()];
    env.store.add_subscription(subscription.clone()).await;

    let access = AccessControl::new(env.context());
    let billing = Principal("CN=billing,O=Example".to_string());
    let reports = Principal("CN=reports,O=Example".to_string());
    let topic_resource = AclResource::Topic { project_id: env.project, name: "orders".into() };
    let sub_resource = AclResource::Subscription(subscription.key.clone());

    access.ensure_authorized(&billing, topic_resource.clone()).await?;
    access.ensure_authorized(&reports, sub_resource.clone()).await?;

    let err = access.ensure_authorized(&reports, topic_resource).await.unwrap_err();
    assert!(matches!(err, DeliveryError::Unauthorized { .. }));
    let err = access.ensure_authorized(&billing, sub_resource).await.unwrap_err();
    assert!(matches!(err, DeliveryError::Unauthorized { .. }));
    Ok(())
}

#[tokio::test]
async fn acl_of_missing_resource_not_found() -> Result<()> {
    let env = TestEnv::new();
    let access = AccessControl::new(env.context());
    let anyone = Principal("CN=anyone".to_string());

    let err = access
        .ensure_authorized(&anyone, AclResource::Subscription(env.key("ghost")))
        .await
        .unwrap_err();
    assert!(matches!(err, DeliveryError::NotFound { .. }));
    Ok(())
}
