//! Connection establishment and lifecycle events.

mod common;

use std::time::Duration;

use common::{wait_for, Collector, TestFixture};
use pgbridge::config::{NotifierOptions, UnlistenPolicy};
use pgbridge::{ConnectionState, EngineEvent, Error, Message, NotifierError};
use serde_json::json;

#[tokio::test]
async fn test_connect_listens_to_topics_and_error_channel() {
    let fixture = TestFixture::connected(&["orders", "invoices"]).await;

    assert_eq!(fixture.pubsub.state(), ConnectionState::Connected);
    assert_eq!(
        fixture.pubsub.notifier().listening_channels(),
        vec!["error", "invoices", "orders"]
    );
}

#[tokio::test]
async fn test_refused_first_attempt_connects_in_background() {
    let fixture = TestFixture::new(&["orders"]);
    fixture.broker.set_available(false);

    let broker = fixture.broker.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        broker.set_available(true);
    });

    tokio::time::timeout(Duration::from_secs(2), fixture.pubsub.connect())
        .await
        .expect("connect timed out")
        .expect("connect failed");

    let collector = Collector::new();
    fixture
        .pubsub
        .subscribe("orders", collector.callback())
        .await
        .unwrap();
    assert!(fixture.pubsub.publish("orders", json!({"id": 1})).await);
    assert_eq!(collector.messages(), vec![Message::Payload(json!({"id": 1}))]);
}

#[tokio::test]
async fn test_exotic_first_attempt_failure_rejects() {
    let fixture = TestFixture::new(&["orders"]);
    fixture.broker.fail_next_connect("password authentication failed");

    let err = fixture.pubsub.connect().await.unwrap_err();
    assert!(matches!(err, Error::Connection(NotifierError::Connect(ref reason)) if reason.contains("password")));
    assert_eq!(fixture.pubsub.state(), ConnectionState::Disconnected);
    assert!(!fixture.pubsub.publish("orders", json!(1)).await);

    // The engine stays usable for another attempt.
    fixture.pubsub.connect().await.unwrap();
    assert!(fixture.pubsub.is_connected());
}

#[tokio::test]
async fn test_error_event_before_connecting_rejects() {
    let fixture = TestFixture::with_options(
        &["orders"],
        UnlistenPolicy::Channel,
        NotifierOptions {
            retry_limit: Some(3),
            ..common::fast_retry()
        },
    );
    fixture.broker.set_available(false);

    let err = tokio::time::timeout(Duration::from_secs(2), fixture.pubsub.connect())
        .await
        .expect("connect timed out")
        .unwrap_err();
    assert!(matches!(
        err,
        Error::Connection(NotifierError::RetriesExhausted { attempts: 3 })
    ));
    assert_eq!(fixture.pubsub.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn test_listen_failure_rejects() {
    let fixture = TestFixture::new(&["orders", "audit"]);
    fixture.broker.fail_listen("audit");

    let err = fixture.pubsub.connect().await.unwrap_err();
    assert!(matches!(err, Error::Listen { ref channel, .. } if channel == "audit"));
    assert!(!fixture.pubsub.is_connected());
}

#[tokio::test]
async fn test_connected_event_emitted() {
    let fixture = TestFixture::new(&[]);
    let mut events = fixture.pubsub.events();

    fixture.pubsub.connect().await.unwrap();

    let event = events.recv().await.unwrap();
    assert!(matches!(event, EngineEvent::Connected));
}

#[tokio::test]
async fn test_post_connect_notifier_events_forwarded() {
    let fixture = TestFixture::with_options(
        &["orders"],
        UnlistenPolicy::Channel,
        NotifierOptions {
            paranoid_checking: Some(Duration::from_millis(10)),
            ..common::fast_retry()
        },
    );
    fixture.pubsub.connect().await.unwrap();
    let mut events = fixture.pubsub.events();

    fixture.broker.set_available(false);
    fixture.broker.set_available(true);

    let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
        .await
        .expect("no event")
        .unwrap();
    assert!(matches!(event, EngineEvent::Connected));

    // Listens are restored by the notifier on reconnect.
    let collector = Collector::new();
    fixture
        .pubsub
        .subscribe("orders", collector.callback())
        .await
        .unwrap();
    fixture.pubsub.publish("orders", json!("after reconnect")).await;
    assert!(wait_for(Duration::from_secs(1), || collector.len() == 1).await);
}

#[tokio::test]
async fn test_close_resets_state_and_releases_connection() {
    let fixture = TestFixture::connected(&["orders"]).await;
    assert_eq!(fixture.broker.connection_count(), 1);

    fixture.pubsub.close().await.unwrap();

    assert_eq!(fixture.pubsub.state(), ConnectionState::Disconnected);
    assert_eq!(fixture.broker.connection_count(), 0);
    assert!(fixture.pubsub.notifier().listening_channels().is_empty());
}

#[tokio::test]
async fn test_close_fails_connect_waiting_on_retry() {
    let fixture = TestFixture::new(&["orders"]);
    fixture.broker.set_available(false);

    let (connected, ()) = tokio::join!(
        tokio::time::timeout(Duration::from_millis(500), fixture.pubsub.connect()),
        async {
            tokio::time::sleep(Duration::from_millis(30)).await;
            fixture.pubsub.close().await.unwrap();
            fixture.broker.set_available(true);
        }
    );

    let err = connected.expect("connect still pending after close").unwrap_err();
    assert!(matches!(err, Error::Connection(NotifierError::Closed)));
    assert_eq!(fixture.pubsub.state(), ConnectionState::Disconnected);
    assert!(!fixture.pubsub.notifier().is_connected());

    // A fresh connect works once the broker is back.
    fixture.pubsub.connect().await.unwrap();
    assert!(fixture.pubsub.is_connected());
}
