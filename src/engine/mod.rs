//! Pub/sub engine over a [`Notifier`].
//!
//! [`PubSub`] owns the notifier, the interest set and the subscription
//! table, and tracks the connection state. Callback subscriptions and
//! pull-style [`Bridge`]s both attach to the notifier's fan-out registry,
//! so every consumer on a channel receives its own copy of each message.

mod connect;
mod subscriptions;

pub use subscriptions::SubscriptionId;

use std::sync::{Arc, Weak};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio_util::sync::CancellationToken;

use crate::bridge::{self, Bridge};
use crate::config::{EngineOptions, UnlistenPolicy};
use crate::error::{Error, Result};
use crate::message::{Message, MessageHandler};
use crate::observability::metrics;
use crate::transport::{Listener, Notifier, NotifierEvent};
use subscriptions::SubscriptionTable;

/// Connection lifecycle of an engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    /// Connected and listening to the whole interest set.
    Connected,
}

/// Events published on the engine event stream.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    Connected,
    /// A failure decoupled from the call that caused it, such as a
    /// rejected publish or a lost connection.
    Error(Arc<Error>),
}

/// One channel or a collection of channels.
pub trait IntoChannels {
    fn into_channels(self) -> Vec<String>;
}

impl IntoChannels for &str {
    fn into_channels(self) -> Vec<String> {
        vec![self.to_string()]
    }
}

impl IntoChannels for String {
    fn into_channels(self) -> Vec<String> {
        vec![self]
    }
}

impl IntoChannels for &String {
    fn into_channels(self) -> Vec<String> {
        vec![self.clone()]
    }
}

impl<S: Into<String>> IntoChannels for Vec<S> {
    fn into_channels(self) -> Vec<String> {
        self.into_iter().map(Into::into).collect()
    }
}

impl<S: Into<String>, const N: usize> IntoChannels for [S; N] {
    fn into_channels(self) -> Vec<String> {
        self.into_iter().map(Into::into).collect()
    }
}

impl<S: Clone + Into<String>> IntoChannels for &[S] {
    fn into_channels(self) -> Vec<String> {
        self.iter().cloned().map(Into::into).collect()
    }
}

/// The publish/subscribe capability set.
#[async_trait]
pub trait PubSubEngine: Send + Sync {
    /// Returns false without sending if the engine is not connected.
    async fn publish(&self, channel: &str, payload: Value) -> bool;

    async fn subscribe(&self, channel: &str, on_message: Listener) -> Result<SubscriptionId>;

    async fn unsubscribe(&self, id: SubscriptionId) -> Result<()>;

    fn async_iterator(&self, channels: Vec<String>) -> Result<Bridge>;

    async fn async_iterator_promised(&self, channels: Vec<String>) -> Result<Bridge>;
}

/// Pub/sub engine bridging a push-based notifier to subscribers.
pub struct PubSub<N: Notifier> {
    notifier: N,
    options: EngineOptions,
    interest_set: Vec<String>,
    handler: MessageHandler,
    state: Mutex<ConnectionState>,
    /// Held for the duration of a connect.
    connecting: tokio::sync::Mutex<()>,
    subscriptions: Mutex<SubscriptionTable>,
    bridges: Mutex<Vec<Weak<bridge::Shared>>>,
    events: broadcast::Sender<EngineEvent>,
    forwarder: Mutex<Option<CancellationToken>>,
}

/// Resets the state to disconnected unless the attempt succeeded.
struct ConnectAttempt<'a> {
    state: &'a Mutex<ConnectionState>,
    succeeded: bool,
}

impl Drop for ConnectAttempt<'_> {
    fn drop(&mut self) {
        *self.state.lock() = if self.succeeded {
            ConnectionState::Connected
        } else {
            ConnectionState::Disconnected
        };
    }
}

impl<N: Notifier> PubSub<N> {
    pub fn new(notifier: N, options: EngineOptions) -> Self {
        let (events, _) = broadcast::channel(options.event_capacity.max(1));
        Self {
            notifier,
            interest_set: options.interest_set(),
            options,
            handler: MessageHandler::default(),
            state: Mutex::new(ConnectionState::Disconnected),
            connecting: tokio::sync::Mutex::new(()),
            subscriptions: Mutex::new(SubscriptionTable::default()),
            bridges: Mutex::new(Vec::new()),
            events,
            forwarder: Mutex::new(None),
        }
    }

    /// Map every payload through `handler` before delivery.
    #[must_use]
    pub fn with_message_handler<F>(mut self, handler: F) -> Self
    where
        F: Fn(Value) -> Value + Send + Sync + 'static,
    {
        self.handler = MessageHandler::new(handler);
        self
    }

    pub fn notifier(&self) -> &N {
        &self.notifier
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.lock()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Declared topics plus the error channel.
    pub fn interest_set(&self) -> &[String] {
        &self.interest_set
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions.lock().len()
    }

    /// Subscribe to engine events.
    pub fn events(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    /// Connect the notifier and listen to the interest set.
    ///
    /// A refused first attempt is not a failure: the notifier retries in
    /// the background and this call waits for it. Fails if the notifier
    /// reports an error first, the first attempt fails for another reason,
    /// or any channel cannot be listened to, or the engine is closed while
    /// waiting. Connecting an already connected engine is a no-op, and a
    /// call made while another connect runs waits for that one first.
    #[tracing::instrument(skip(self))]
    pub async fn connect(&self) -> Result<()> {
        let _connecting = self.connecting.lock().await;
        {
            let mut state = self.state.lock();
            if *state == ConnectionState::Connected {
                tracing::debug!("Already connected");
                return Ok(());
            }
            *state = ConnectionState::Connecting;
        }
        let mut attempt = ConnectAttempt {
            state: &self.state,
            succeeded: false,
        };

        if let Err(err) = connect::establish(&self.notifier, &self.interest_set).await {
            tracing::warn!(error = %err, "Connect failed");
            return Err(err);
        }
        attempt.succeeded = true;
        drop(attempt);

        self.spawn_forwarder();
        let _ = self.events.send(EngineEvent::Connected);
        tracing::info!(topics = ?self.options.topics, "Connected");
        Ok(())
    }

    /// Send `payload` on `channel`.
    ///
    /// Returns false if the engine is not connected. A payload the
    /// notifier rejects is reported as [`EngineEvent::Error`] and still
    /// returns true.
    #[tracing::instrument(skip(self, payload))]
    pub async fn publish(&self, channel: &str, payload: Value) -> bool {
        if !self.is_connected() {
            tracing::warn!(channel, "Attempted to publish before the engine is connected");
            return false;
        }

        match self.notifier.notify(channel, &payload).await {
            Ok(()) => metrics::record_publish(channel, true),
            Err(err) => {
                tracing::warn!(channel, error = %err, "Publish rejected by notifier");
                metrics::record_publish(channel, false);
                let _ = self
                    .events
                    .send(EngineEvent::Error(Arc::new(Error::Notifier(err))));
            }
        }
        true
    }

    /// Invoke `on_message` for every message on `channel`.
    pub async fn subscribe<F>(&self, channel: &str, on_message: F) -> Result<SubscriptionId>
    where
        F: Fn(Message) + Send + Sync + 'static,
    {
        self.register(channel, Arc::new(on_message)).await
    }

    #[tracing::instrument(skip(self, on_message))]
    async fn register(&self, channel: &str, on_message: Listener) -> Result<SubscriptionId> {
        self.notifier
            .listen_to(channel)
            .await
            .map_err(|source| Error::Listen {
                channel: channel.to_string(),
                source,
            })?;

        let handler = self.handler.clone();
        let listener = self.notifier.notifications().on(
            channel,
            Arc::new(move |message| {
                metrics::record_delivery("subscription");
                on_message(handler.apply(message));
            }),
        );
        let id = self.subscriptions.lock().insert(channel.to_string(), listener);

        tracing::debug!(subscription = %id, "Subscribed");
        Ok(id)
    }

    /// Remove the subscription `id`.
    ///
    /// Under [`UnlistenPolicy::Channel`] the channel is unlistened even if
    /// other consumers still use it. Before the engine is connected only
    /// the local record is removed.
    #[tracing::instrument(skip(self), fields(subscription = %id))]
    pub async fn unsubscribe(&self, id: SubscriptionId) -> Result<()> {
        let connected = self.is_connected();
        if !connected {
            tracing::warn!("Attempted to unsubscribe before the engine is connected");
        }

        let subscription = self
            .subscriptions
            .lock()
            .remove(id)
            .ok_or(Error::UnknownSubscription(id))?;
        let notifications = self.notifier.notifications();
        notifications.off(subscription.listener);

        if !connected {
            return Ok(());
        }

        let channel = subscription.channel;
        let unlisten = match self.options.unlisten_policy {
            UnlistenPolicy::Channel => true,
            UnlistenPolicy::LastSubscriber => {
                notifications.listener_count(&channel) == 0 && !self.interest_set.contains(&channel)
            }
        };
        if unlisten {
            self.notifier.unlisten(&channel).await?;
            tracing::debug!(channel, "Unlistened");
        }
        Ok(())
    }

    /// A pull sequence over `channels`.
    ///
    /// Channels are not listened to here; they should belong to the
    /// interest set or to an active subscription.
    pub fn async_iterator(&self, channels: impl IntoChannels) -> Result<Bridge> {
        let channels = channels.into_channels();
        if channels.is_empty() {
            return Err(Error::NoChannels);
        }
        Ok(self.bridge(channels))
    }

    /// Listen to `channels`, then return a pull sequence over them.
    ///
    /// An empty set is accepted; the sequence then ends only when closed.
    pub async fn async_iterator_promised(&self, channels: impl IntoChannels) -> Result<Bridge> {
        let channels = channels.into_channels();
        connect::listen_all(&self.notifier, &channels).await?;
        Ok(self.bridge(channels))
    }

    fn bridge(&self, channels: Vec<String>) -> Bridge {
        let bridge = Bridge::new(self.notifier.notifications(), channels, self.handler.clone());
        let mut bridges = self.bridges.lock();
        bridges.retain(|b| b.strong_count() > 0);
        bridges.push(bridge.downgrade());
        bridge
    }

    /// Close every bridge and subscription, unlisten all channels and
    /// close the notifier.
    #[tracing::instrument(skip(self))]
    pub async fn close(&self) -> Result<()> {
        *self.state.lock() = ConnectionState::Disconnected;
        self.stop_forwarder();

        let bridges = std::mem::take(&mut *self.bridges.lock());
        for shared in bridges.iter().filter_map(Weak::upgrade) {
            shared.terminate();
        }

        let notifications = self.notifier.notifications();
        let subscriptions = self.subscriptions.lock().drain();
        for subscription in subscriptions {
            notifications.off(subscription.listener);
        }

        if let Err(err) = self.notifier.unlisten_all().await {
            tracing::warn!(error = %err, "Failed to unlisten channels on close");
        }
        self.notifier.close().await?;
        tracing::info!("Closed");
        Ok(())
    }

    /// Copy notifier events after connecting onto the engine event stream.
    fn spawn_forwarder(&self) {
        let token = CancellationToken::new();
        if let Some(previous) = self.forwarder.lock().replace(token.clone()) {
            previous.cancel();
        }

        let mut notifier_events = self.notifier.events();
        let events = self.events.clone();
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    () = token.cancelled() => break,
                    event = notifier_events.recv() => event,
                };
                match event {
                    Ok(NotifierEvent::Connected) => {
                        tracing::info!("Notifier reconnected");
                        let _ = events.send(EngineEvent::Connected);
                    }
                    Ok(NotifierEvent::Reconnecting { attempt }) => {
                        tracing::debug!(attempt, "Notifier reconnecting");
                    }
                    Ok(NotifierEvent::Error(err)) => {
                        let err = Error::Notifier((*err).clone());
                        let _ = events.send(EngineEvent::Error(Arc::new(err)));
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "Missed notifier events");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        });
    }

    fn stop_forwarder(&self) {
        if let Some(token) = self.forwarder.lock().take() {
            token.cancel();
        }
    }
}

impl<N: Notifier> Drop for PubSub<N> {
    fn drop(&mut self) {
        self.stop_forwarder();
    }
}

#[async_trait]
impl<N: Notifier> PubSubEngine for PubSub<N> {
    async fn publish(&self, channel: &str, payload: Value) -> bool {
        PubSub::publish(self, channel, payload).await
    }

    async fn subscribe(&self, channel: &str, on_message: Listener) -> Result<SubscriptionId> {
        self.register(channel, on_message).await
    }

    async fn unsubscribe(&self, id: SubscriptionId) -> Result<()> {
        PubSub::unsubscribe(self, id).await
    }

    fn async_iterator(&self, channels: Vec<String>) -> Result<Bridge> {
        PubSub::async_iterator(self, channels)
    }

    async fn async_iterator_promised(&self, channels: Vec<String>) -> Result<Bridge> {
        PubSub::async_iterator_promised(self, channels).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NotifierOptions;
    use crate::transport::{MemoryBroker, MemoryNotifier};
    use serde_json::json;

    fn engine(topics: &[&str]) -> PubSub<MemoryNotifier> {
        let broker = MemoryBroker::new();
        PubSub::new(
            broker.notifier(NotifierOptions::default()),
            EngineOptions {
                topics: topics.iter().map(ToString::to_string).collect(),
                ..EngineOptions::default()
            },
        )
    }

    #[tokio::test]
    async fn test_connect_moves_to_connected() {
        let pubsub = engine(&["orders"]);
        assert_eq!(pubsub.state(), ConnectionState::Disconnected);

        pubsub.connect().await.unwrap();
        assert_eq!(pubsub.state(), ConnectionState::Connected);
        assert_eq!(
            pubsub.notifier().listening_channels(),
            vec!["error", "orders"]
        );

        // Idempotent once connected
        pubsub.connect().await.unwrap();
        assert!(pubsub.is_connected());
    }

    #[tokio::test]
    async fn test_failed_connect_returns_to_disconnected() {
        let broker = MemoryBroker::new();
        broker.fail_listen("orders");
        let pubsub = PubSub::new(
            broker.notifier(NotifierOptions::default()),
            EngineOptions {
                topics: vec!["orders".into()],
                ..EngineOptions::default()
            },
        );

        assert!(matches!(pubsub.connect().await, Err(Error::Listen { .. })));
        assert_eq!(pubsub.state(), ConnectionState::Disconnected);

        // The listen failure was one-shot, so a retry succeeds.
        pubsub.connect().await.unwrap();
        assert!(pubsub.is_connected());
    }

    #[tokio::test]
    async fn test_concurrent_connects_run_one_at_a_time() {
        let broker = MemoryBroker::new();
        broker.fail_listen("orders");
        let pubsub = PubSub::new(
            broker.notifier(NotifierOptions::default()),
            EngineOptions {
                topics: vec!["orders".into()],
                ..EngineOptions::default()
            },
        );

        let (first, second) = tokio::join!(pubsub.connect(), pubsub.connect());

        // The second call starts after the first failed and retries.
        assert!(matches!(first, Err(Error::Listen { .. })));
        assert!(second.is_ok());
        assert_eq!(pubsub.state(), ConnectionState::Connected);
        assert!(pubsub.notifier().is_listening("orders"));
    }

    #[tokio::test]
    async fn test_concurrent_connects_announce_once() {
        let pubsub = engine(&["orders"]);
        let mut events = pubsub.events();

        let (first, second) = tokio::join!(pubsub.connect(), pubsub.connect());
        first.unwrap();
        second.unwrap();

        assert!(matches!(events.try_recv(), Ok(EngineEvent::Connected)));
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_cancelled_connect_returns_to_disconnected() {
        let broker = MemoryBroker::new();
        broker.set_available(false);
        let pubsub = PubSub::new(
            broker.notifier(NotifierOptions::default()),
            EngineOptions::default(),
        );

        let result =
            tokio::time::timeout(std::time::Duration::from_millis(20), pubsub.connect()).await;
        assert!(result.is_err());
        assert_eq!(pubsub.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_publish_before_connect_is_rejected() {
        let pubsub = engine(&["orders"]);
        assert!(!pubsub.publish("orders", json!({"id": 1})).await);
    }

    #[tokio::test]
    async fn test_unknown_subscription() {
        let pubsub = engine(&[]);
        pubsub.connect().await.unwrap();

        let id = pubsub.subscribe("a", |_| {}).await.unwrap();
        pubsub.unsubscribe(id).await.unwrap();
        assert!(matches!(
            pubsub.unsubscribe(id).await,
            Err(Error::UnknownSubscription(missing)) if missing == id
        ));
    }

    #[tokio::test]
    async fn test_close_drops_subscription_records() {
        let broker = MemoryBroker::new();
        let pubsub = PubSub::new(
            broker.notifier(NotifierOptions::default()),
            EngineOptions::default(),
        );
        pubsub.connect().await.unwrap();
        let id = pubsub.subscribe("a", |_| {}).await.unwrap();
        pubsub.close().await.unwrap();

        // close() already dropped the record
        assert_eq!(pubsub.subscription_count(), 0);
        assert!(pubsub.unsubscribe(id).await.is_err());
    }

    #[tokio::test]
    async fn test_async_iterator_requires_channels() {
        let pubsub = engine(&[]);
        let empty: Vec<String> = Vec::new();
        assert!(matches!(pubsub.async_iterator(empty), Err(Error::NoChannels)));
    }

    #[tokio::test]
    async fn test_close_terminates_bridges_and_subscriptions() {
        let pubsub = engine(&["a"]);
        pubsub.connect().await.unwrap();
        let bridge = pubsub.async_iterator(["a"]).unwrap();
        pubsub.subscribe("a", |_| {}).await.unwrap();
        let waiting = bridge.next();

        pubsub.close().await.unwrap();

        assert_eq!(waiting.await, None);
        assert!(!bridge.is_listening());
        assert_eq!(pubsub.subscription_count(), 0);
        assert_eq!(pubsub.notifier().notifications().total_listeners(), 0);
        assert_eq!(pubsub.state(), ConnectionState::Disconnected);
        assert!(!pubsub.notifier().is_connected());
    }

    #[test]
    fn test_into_channels_accepts_one_or_many() {
        assert_eq!("a".into_channels(), vec!["a"]);
        assert_eq!(String::from("a").into_channels(), vec!["a"]);
        assert_eq!(["a", "b"].into_channels(), vec!["a", "b"]);
        assert_eq!(vec![String::from("c")].into_channels(), vec!["c"]);
        let slice: &[&str] = &["d"];
        assert_eq!(slice.into_channels(), vec!["d"]);
    }

    #[tokio::test]
    async fn test_engine_usable_through_trait_object() {
        let pubsub = engine(&["a"]);
        pubsub.connect().await.unwrap();
        let dyn_engine: &dyn PubSubEngine = &pubsub;

        let bridge = dyn_engine.async_iterator(vec!["a".into()]).unwrap();
        assert!(dyn_engine.publish("a", json!("via trait")).await);
        assert_eq!(bridge.next().await, Some(Message::Payload(json!("via trait"))));
    }
}
