//! Integration tests for catalog models: subscription paths, cursors,
//! traffic statistics and the message wire format.

use std::{collections::BTreeMap, time::Duration};

use chrono::{TimeZone, Utc};
use ferry_core::{
    broker_topic_name, CoreError, Cursor, Message, OffsetUpdate, PendingAck, ProjectId,
    PushConfig, RetryKind, RetryPolicy, Subscription, SubscriptionKey, TrafficStats,
};
use proptest::prelude::*;
use serde_json::json;
use uuid::Uuid;

fn project() -> ProjectId {
    ProjectId(Uuid::parse_str("7d444840-9dc0-11d1-b245-5ffdce74fad2").unwrap())
}

#[test]
fn subscription_path_format() {
    let key = SubscriptionKey::new(project(), "orders-audit");
    assert_eq!(
        key.to_string(),
        "projects/7d444840-9dc0-11d1-b245-5ffdce74fad2/subscriptions/orders-audit"
    );
    assert_eq!(key.to_string().parse::<SubscriptionKey>().unwrap(), key);
}

#[test]
fn malformed_subscription_paths_rejected() {
    for path in [
        "",
        "projects/not-a-uuid/subscriptions/s",
        "projects/7d444840-9dc0-11d1-b245-5ffdce74fad2/topics/s",
        "projects/7d444840-9dc0-11d1-b245-5ffdce74fad2/subscriptions/",
        "projects/7d444840-9dc0-11d1-b245-5ffdce74fad2/subscriptions/a/b",
    ] {
        let err = path.parse::<SubscriptionKey>().unwrap_err();
        assert!(matches!(err, CoreError::InvalidInput(_)), "{path}");
    }
}

#[test]
fn broker_stream_is_project_qualified() {
    let subscription = Subscription::pull(SubscriptionKey::new(project(), "s"), "orders");
    assert_eq!(subscription.broker_topic(), broker_topic_name(project(), "orders"));
    assert_eq!(subscription.broker_topic(), "7d444840-9dc0-11d1-b245-5ffdce74fad2.orders");
}

#[test]
fn new_push_subscription_is_unverified_with_default_deadline() {
    let push = PushConfig::new("https://example.com/push", 10, RetryPolicy::linear(2));
    let subscription = Subscription::push(SubscriptionKey::new(project(), "s"), "t", push);

    let push = subscription.push.as_ref().unwrap();
    assert!(!push.verified);
    assert_eq!(push.verification_hash.len(), 32);
    assert_eq!(subscription.ack_deadline(), Duration::from_secs(10));
    assert_eq!(subscription.cursor, Cursor::default());
}

#[test]
fn retry_kind_parses_stored_names() {
    assert_eq!("linear".parse::<RetryKind>().unwrap(), RetryKind::Linear);
    assert_eq!("none".parse::<RetryKind>().unwrap(), RetryKind::Disabled);
    assert_eq!("".parse::<RetryKind>().unwrap(), RetryKind::Disabled);
    assert!("exponential".parse::<RetryKind>().is_err());
    assert!(!RetryPolicy::disabled().allows_retry());
}

#[test]
fn pending_ack_expires_strictly_after_deadline() {
    let since = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
    let pending = PendingAck::new(3, since);
    let deadline = Duration::from_secs(10);

    assert!(!pending.is_expired(deadline, since + chrono::Duration::seconds(10)));
    assert!(pending.is_expired(deadline, since + chrono::Duration::seconds(11)));
}

#[test]
fn cursor_cannot_move_backwards() {
    let mut subscription = Subscription::pull(SubscriptionKey::new(project(), "s"), "t");
    subscription.cursor = Cursor::at(5);

    let backwards = OffsetUpdate::advance(&subscription.cursor, 3, None);
    assert!(matches!(subscription.apply(&backwards), Err(CoreError::InvalidInput(_))));
    assert_eq!(subscription.cursor, Cursor::at(5));
}

#[test]
fn resync_never_lowers_offsets() {
    let cursor = Cursor::at(8);
    let update = OffsetUpdate::resync(&cursor, 3);
    assert_eq!((update.offset, update.next_offset), (8, 8));

    let update = OffsetUpdate::resync(&Cursor::at(1), 3);
    assert_eq!((update.offset, update.next_offset, update.pending_ack), (3, 3, None));
}

#[test]
fn traffic_rate_uses_time_since_previous_batch() {
    let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
    let mut stats = TrafficStats::default();

    stats.record(10, 100, start);
    assert_eq!(stats.rate, 0.0);

    stats.record(6, 60, start + chrono::Duration::seconds(3));
    assert_eq!(stats.message_count, 16);
    assert_eq!(stats.byte_count, 160);
    assert!((stats.rate - 2.0).abs() < f64::EPSILON);

    stats.record(1, 1, start);
    assert!((stats.rate - 2.0).abs() < f64::EPSILON, "stale timestamps keep the rate");
    assert_eq!(stats.latest, Some(start + chrono::Duration::seconds(3)));
}

#[test]
fn message_wire_format() {
    let mut attributes = BTreeMap::new();
    attributes.insert("origin".to_string(), "billing".to_string());
    let mut message = Message::new(b"hello".to_vec(), attributes);
    message.message_id = "42".to_string();
    message.publish_time = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();

    let value = serde_json::to_value(&message).unwrap();
    assert_eq!(
        value,
        json!({
            "messageId": "42",
            "attributes": { "origin": "billing" },
            "data": "aGVsbG8=",
            "publishTime": "2024-01-01T00:00:00Z",
        })
    );
    assert_eq!(message.size(), 5);
}

proptest! {
    #[test]
    fn any_valid_subscription_name_survives_parsing(name in "[a-zA-Z][a-zA-Z0-9._-]{0,40}") {
        let key = SubscriptionKey::new(ProjectId::new(), name);
        prop_assert_eq!(key.to_string().parse::<SubscriptionKey>().unwrap(), key);
    }

    #[test]
    fn traffic_totals_are_sums(batches in prop::collection::vec((0u64..1000, 0u64..100_000), 0..30)) {
        let start = Utc::now();
        let mut stats = TrafficStats::default();
        for (i, (count, bytes)) in batches.iter().enumerate() {
            stats.record(*count, *bytes, start + chrono::Duration::seconds(i as i64));
        }

        prop_assert_eq!(stats.message_count, batches.iter().map(|(c, _)| c).sum::<u64>());
        prop_assert_eq!(stats.byte_count, batches.iter().map(|(_, b)| b).sum::<u64>());
        prop_assert!(stats.rate >= 0.0);
    }
}
