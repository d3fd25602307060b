//! Test utilities for pgbridge integration tests.
//!
//! Provides:
//! - An engine wired to an in-process broker
//! - Collecting subscriber callbacks
//! - Polling helpers with timeout

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use pgbridge::config::{EngineOptions, NotifierOptions, UnlistenPolicy};
use pgbridge::transport::{MemoryBroker, MemoryNotifier};
use pgbridge::{Message, PubSub};

/// Engine plus the broker it is connected through.
pub struct TestFixture {
    pub broker: MemoryBroker,
    pub pubsub: PubSub<MemoryNotifier>,
}

impl TestFixture {
    /// Engine listening to `topics`, not yet connected.
    pub fn new(topics: &[&str]) -> Self {
        Self::with_options(topics, UnlistenPolicy::Channel, fast_retry())
    }

    pub fn with_options(
        topics: &[&str],
        unlisten_policy: UnlistenPolicy,
        notifier_options: NotifierOptions,
    ) -> Self {
        pgbridge::observability::tracing::init_test_tracing();
        let broker = MemoryBroker::new();
        let pubsub = PubSub::new(
            broker.notifier(notifier_options),
            EngineOptions {
                topics: topics.iter().map(ToString::to_string).collect(),
                unlisten_policy,
                ..EngineOptions::default()
            },
        );
        Self { broker, pubsub }
    }

    /// Engine listening to `topics`, already connected.
    pub async fn connected(topics: &[&str]) -> Self {
        let fixture = Self::new(topics);
        fixture.pubsub.connect().await.expect("connect failed");
        fixture
    }
}

/// Notifier options with a short retry interval.
pub fn fast_retry() -> NotifierOptions {
    NotifierOptions {
        retry_interval: Duration::from_millis(10),
        retry_timeout: Duration::from_secs(5),
        ..NotifierOptions::default()
    }
}

/// A subscriber callback that records every message it receives.
#[derive(Clone, Default)]
pub struct Collector {
    seen: Arc<Mutex<Vec<Message>>>,
}

impl Collector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn callback(&self) -> impl Fn(Message) + Send + Sync + 'static {
        let seen = Arc::clone(&self.seen);
        move |message| seen.lock().push(message)
    }

    pub fn messages(&self) -> Vec<Message> {
        self.seen.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.seen.lock().len()
    }
}

/// Wait for a condition to become true with timeout.
///
/// # Returns
///
/// `true` if condition was met, `false` if timeout expired
pub async fn wait_for<F>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let start = std::time::Instant::now();
    while start.elapsed() < timeout {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}
