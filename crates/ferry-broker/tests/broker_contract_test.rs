//! Behavior every broker adapter must share, exercised through the trait
//! object the delivery engine uses.

use std::{collections::BTreeMap, sync::Arc};

use anyhow::Result;
use ferry_broker::{Broker, BrokerError, MemoryBroker};
use ferry_core::{broker_topic_name, Message, ProjectId};

fn topic_name() -> String {
    broker_topic_name(ProjectId::from(uuid::Uuid::new_v4()), "orders")
}

async fn seeded(broker: &Arc<dyn Broker>, topic: &str, count: usize) -> Result<()> {
    broker.create_topic(topic.to_string()).await?;
    for i in 0..count {
        let message = Message::new(format!("m{i}").into_bytes(), BTreeMap::new());
        broker.publish(topic.to_string(), message).await?;
    }
    Ok(())
}

#[tokio::test]
async fn window_tracks_publishes() -> Result<()> {
    let broker: Arc<dyn Broker> = Arc::new(MemoryBroker::new());
    let topic = topic_name();
    seeded(&broker, &topic, 5).await?;

    assert_eq!(broker.min_offset(topic.clone()).await?, 0);
    assert_eq!(broker.max_offset(topic.clone()).await?, 5);
    Ok(())
}

#[tokio::test]
async fn consume_preserves_payload_and_order() -> Result<()> {
    let broker: Arc<dyn Broker> = Arc::new(MemoryBroker::new());
    let topic = topic_name();
    seeded(&broker, &topic, 5).await?;

    let first = broker.consume(topic.clone(), 0, 3, true).await?;
    let rest = broker.consume(topic.clone(), 3, 3, true).await?;

    let payloads: Vec<_> =
        first.iter().chain(rest.iter()).map(|r| r.message.data.to_vec()).collect();
    let expected: Vec<_> = (0..5).map(|i| format!("m{i}").into_bytes()).collect();
    assert_eq!(payloads, expected);
    assert_eq!(rest.len(), 2);
    Ok(())
}

#[tokio::test]
async fn deleted_topic_is_gone() -> Result<()> {
    let broker: Arc<dyn Broker> = Arc::new(MemoryBroker::new());
    let topic = topic_name();
    seeded(&broker, &topic, 1).await?;

    broker.delete_topic(topic.clone()).await?;

    let err = broker.consume(topic.clone(), 0, 1, true).await.unwrap_err();
    assert_eq!(err, BrokerError::TopicNotFound(topic));
    Ok(())
}

#[tokio::test]
async fn retention_moves_min_but_keeps_max() -> Result<()> {
    let memory = Arc::new(MemoryBroker::new());
    let broker: Arc<dyn Broker> = memory.clone();
    let topic = topic_name();
    seeded(&broker, &topic, 4).await?;

    memory.truncate_before(&topic, 10).await?;

    assert_eq!(broker.min_offset(topic.clone()).await?, 4);
    assert_eq!(broker.max_offset(topic.clone()).await?, 4);
    assert!(broker.consume(topic, 4, 10, true).await?.is_empty());
    Ok(())
}
