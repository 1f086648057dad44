//! Integration tests for the event notifier and sweeper over the in-memory
//! store's key-event notifications.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)] // Test code can use unwrap/expect/panic

use chrono::Duration;
use serde_json::json;
use session_store_core::principal::PRINCIPAL_NAME_ATTRIBUTE;
use session_store_core::{
    BroadcastEventPublisher, ChannelMessage, KeyValueStore, SessionConfig, SessionEvent,
};
use session_store_runtime::retry::RetryPolicy;
use session_store_runtime::{EventNotifier, ExpirationSweeper, SessionRepository, TaskHandle};
use session_store_testing::{
    InMemoryKeyValueStore, ManualClock, RecordingEventPublisher, SequentialIdGenerator,
    init_tracing, test_epoch,
};
use std::sync::Arc;

const WAIT: std::time::Duration = std::time::Duration::from_secs(2);

// ============================================================================
// Test Fixtures
// ============================================================================

struct Fixture {
    clock: ManualClock,
    store: InMemoryKeyValueStore,
    repository: Arc<SessionRepository<InMemoryKeyValueStore>>,
    events: RecordingEventPublisher,
}

fn fixture(interval_seconds: i64) -> Fixture {
    init_tracing();
    let clock = ManualClock::default();
    let store = InMemoryKeyValueStore::new(clock.shared());
    let repository = SessionRepository::builder(store.clone())
        .config(SessionConfig::default().with_max_inactive_interval_seconds(interval_seconds))
        .clock(clock.shared())
        .id_generator(Arc::new(SequentialIdGenerator::new()))
        .build()
        .unwrap();
    Fixture {
        clock,
        store,
        repository: Arc::new(repository),
        events: RecordingEventPublisher::new(),
    }
}

impl Fixture {
    fn notifier(&self) -> EventNotifier<InMemoryKeyValueStore> {
        EventNotifier::new(Arc::clone(&self.repository), Arc::new(self.events.clone()))
    }

    /// Poll until the notifier holds `count` subscriptions.
    async fn wait_for_subscriptions(&self, count: usize) {
        for _ in 0..200 {
            if self.store.subscription_count() == count {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        panic!(
            "expected {count} subscriptions, found {}",
            self.store.subscription_count()
        );
    }
}

async fn wait_until_finished(handle: &TaskHandle) {
    for _ in 0..200 {
        if handle.is_finished() {
            return;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
}

fn fast_retry(max_retries: usize) -> RetryPolicy {
    RetryPolicy::builder()
        .max_retries(max_retries)
        .initial_delay(std::time::Duration::from_millis(20))
        .max_delay(std::time::Duration::from_millis(100))
        .build()
}

// ============================================================================
// Created / Deleted / Expired
// ============================================================================

#[tokio::test]
async fn test_created_event_on_first_save_only() {
    let f = fixture(1800);
    let handle = f.notifier().start().await.unwrap();

    let mut session = f.repository.create_session().await.unwrap();
    session.set_attribute("cart", json!(["book"])).await.unwrap();
    session.save().await.unwrap();
    session.set_attribute("cart", json!([])).await.unwrap();
    session.save().await.unwrap();

    let events = f.events.wait_for(1, WAIT).await;
    handle.shutdown().await;

    assert_eq!(events.len(), 1);
    let SessionEvent::Created { session: created } = &events[0] else {
        panic!("expected created event, got {:?}", events[0]);
    };
    assert_eq!(created.id(), session.id());
    assert_eq!(created.attribute("cart"), Some(&json!(["book"])));
    assert_eq!(created.creation_time(), test_epoch());
}

#[tokio::test]
async fn test_deleted_event_carries_session() {
    let f = fixture(1800);
    let handle = f.notifier().start().await.unwrap();

    let mut session = f.repository.create_session().await.unwrap();
    session.set_attribute(PRINCIPAL_NAME_ATTRIBUTE, "alice").await.unwrap();
    session.save().await.unwrap();
    let id = session.id().to_string();
    f.events.wait_for(1, WAIT).await;

    f.repository.delete_by_id(&id).await.unwrap();

    let events = f.events.wait_for(2, WAIT).await;
    handle.shutdown().await;

    assert_eq!(events.len(), 2);
    let SessionEvent::Deleted { session: deleted } = &events[1] else {
        panic!("expected deleted event, got {:?}", events[1]);
    };
    assert_eq!(deleted.id(), id);
    assert_eq!(deleted.attribute(PRINCIPAL_NAME_ATTRIBUTE), Some(&json!("alice")));
    assert!(f.repository.find_by_principal_name("alice").await.unwrap().is_empty());
}

#[tokio::test]
async fn test_sweep_fires_expired_event() {
    let f = fixture(60);
    let handle = f.notifier().start().await.unwrap();

    let mut session = f.repository.create_session().await.unwrap();
    session.set_attribute(PRINCIPAL_NAME_ATTRIBUTE, "alice").await.unwrap();
    session.save().await.unwrap();
    let id = session.id().to_string();
    f.events.wait_for(1, WAIT).await;

    // Expiry at +60s files the session in the +120s bucket.
    f.clock.set(test_epoch() + Duration::seconds(120));
    let sweeper = ExpirationSweeper::new(Arc::clone(&f.repository)).unwrap();
    assert_eq!(sweeper.sweep().await, 1);

    let events = f.events.wait_for(2, WAIT).await;
    handle.shutdown().await;

    assert_eq!(events.len(), 2);
    assert!(matches!(&events[1], SessionEvent::Expired { session } if session.id() == id));
    assert!(
        f.store
            .members(&f.repository.keys().principal_key("alice"))
            .is_empty()
    );
}

#[tokio::test]
async fn test_store_reaper_fires_expired_event() {
    let f = fixture(60);
    let handle = f.notifier().start().await.unwrap();

    let mut session = f.repository.create_session().await.unwrap();
    session.save().await.unwrap();
    f.events.wait_for(1, WAIT).await;

    f.clock.advance(Duration::seconds(61));
    assert_eq!(f.store.expire_due_keys(), 1);

    let events = f.events.wait_for(2, WAIT).await;
    handle.shutdown().await;

    assert_eq!(events.len(), 2);
    assert_eq!(events[1].kind(), "expired");
    assert_eq!(events[1].session_id(), session.id());
}

// ============================================================================
// Resilience
// ============================================================================

#[tokio::test]
async fn test_listener_failure_does_not_stop_notifier() {
    let f = fixture(1800);
    let handle = f.notifier().start().await.unwrap();

    f.events.set_failing(true);
    let mut first = f.repository.create_session().await.unwrap();
    first.save().await.unwrap();
    f.events.wait_for(1, WAIT).await;

    f.events.set_failing(false);
    let mut second = f.repository.create_session().await.unwrap();
    second.save().await.unwrap();

    let events = f.events.wait_for(2, WAIT).await;
    assert!(!handle.is_finished());
    handle.shutdown().await;

    assert_eq!(events.len(), 2);
    assert_eq!(events[1].session_id(), second.id());
}

#[tokio::test]
async fn test_unrelated_key_events_are_ignored() {
    let f = fixture(1800);
    let handle = f.notifier().start().await.unwrap();

    f.store.set("unrelated", "x").await.unwrap();
    f.store.delete("unrelated").await.unwrap();
    let mut session = f.repository.create_session().await.unwrap();
    session.save().await.unwrap();

    let events = f.events.wait_for(1, WAIT).await;
    handle.shutdown().await;

    assert_eq!(events.len(), 1);
    assert_eq!(events[0].kind(), "created");
}

#[tokio::test]
async fn test_vanished_record_is_dropped() {
    let f = fixture(1800);
    let notifier = f.notifier();
    let keys = f.repository.keys();

    let message = ChannelMessage {
        channel: keys.deleted_channel(),
        pattern: None,
        payload: keys.expired_key("gone").into_bytes(),
    };
    notifier.handle_message(&message).await;

    assert!(f.events.is_empty());
}

#[tokio::test]
async fn test_undecodable_created_payload_is_dropped() {
    let f = fixture(1800);
    let notifier = f.notifier();
    let keys = f.repository.keys();

    let garbage = ChannelMessage {
        channel: keys.created_channel("s1"),
        pattern: Some(keys.created_channel_pattern()),
        payload: b"not json".to_vec(),
    };
    notifier.handle_message(&garbage).await;

    let incomplete = ChannelMessage {
        channel: keys.created_channel("s1"),
        pattern: Some(keys.created_channel_pattern()),
        payload: br#"{"sessionAttr:a":"1"}"#.to_vec(),
    };
    notifier.handle_message(&incomplete).await;

    assert!(f.events.is_empty());
}

#[tokio::test]
async fn test_subscriptions() {
    let f = fixture(1800);
    let (channels, patterns) = f.notifier().subscriptions();

    assert_eq!(
        channels,
        vec!["__keyevent@0__:del".to_string(), "__keyevent@0__:expired".to_string()]
    );
    assert_eq!(patterns, vec!["spring:session:event:0:created:*".to_string()]);
}

#[tokio::test]
async fn test_broadcast_publisher_delivers_to_subscribers() {
    let f = fixture(1800);
    let publisher = Arc::new(BroadcastEventPublisher::new(16));
    let mut receiver = publisher.subscribe();
    let handle = EventNotifier::new(Arc::clone(&f.repository), publisher)
        .start()
        .await
        .unwrap();

    let mut session = f.repository.create_session().await.unwrap();
    session.save().await.unwrap();

    let event = tokio::time::timeout(WAIT, receiver.recv())
        .await
        .unwrap()
        .unwrap();
    handle.shutdown().await;

    assert_eq!(event.kind(), "created");
    assert_eq!(event.session_id(), session.id());
}

#[tokio::test]
async fn test_sweeper_task_stops_on_shutdown() {
    let f = fixture(1800);
    let sweeper = ExpirationSweeper::new(Arc::clone(&f.repository))
        .unwrap()
        .start();

    assert!(!sweeper.is_finished());
    sweeper.shutdown().await;
}

// ============================================================================
// Resubscription
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_closed_subscription_is_reestablished() {
    let f = fixture(1800);
    let handle = f.notifier().with_retry_policy(fast_retry(5)).start().await.unwrap();
    assert_eq!(f.store.subscription_count(), 1);

    f.store.refuse_subscriptions(true);
    assert_eq!(f.store.close_subscriptions(), 1);
    // A couple of refused attempts before the server comes back.
    tokio::time::sleep(std::time::Duration::from_millis(30)).await;
    f.store.refuse_subscriptions(false);
    f.wait_for_subscriptions(1).await;

    let mut session = f.repository.create_session().await.unwrap();
    session.save().await.unwrap();

    let events = f.events.wait_for(1, WAIT).await;
    assert!(!handle.is_finished());
    handle.shutdown().await;

    assert_eq!(events.len(), 1);
    assert_eq!(events[0].session_id(), session.id());
}

#[tokio::test(start_paused = true)]
async fn test_notifier_stops_when_retries_are_exhausted() {
    let f = fixture(1800);
    let handle = f.notifier().with_retry_policy(fast_retry(0)).start().await.unwrap();

    f.store.refuse_subscriptions(true);
    f.store.close_subscriptions();
    wait_until_finished(&handle).await;

    assert!(handle.is_finished());
    assert_eq!(f.store.subscription_count(), 0);
    handle.shutdown().await;
}
