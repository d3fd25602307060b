//! In-process LISTEN/NOTIFY broker.
//!
//! [`MemoryBroker`] plays the database server: it tracks which connections
//! listen to which channels and delivers NOTIFY payloads to them.
//! [`MemoryNotifier`] is one connection to it and implements [`Notifier`]
//! with the same observable behaviour as a database-backed notifier:
//! - A refused first connect returns an error and keeps retrying in the
//!   background, reporting the eventual success as an event
//! - Payloads are limited to `max_payload_bytes` once serialized
//! - Listens survive a dropped connection and are restored on reconnect

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use super::{Notifications, Notifier, NotifierEvent};
use crate::config::{NotifierOptions, ParseFn};
use crate::error::NotifierError;
use crate::message::Message;

/// Capacity of each notifier's lifecycle event channel.
const EVENT_CHANNEL_SIZE: usize = 64;

struct Session {
    id: u64,
    connected: AtomicBool,
    listening: Mutex<HashSet<String>>,
    notifications: Arc<Notifications>,
    parse: ParseFn,
}

struct BrokerState {
    available: bool,
    connect_failure: Option<String>,
    failing_listens: HashSet<String>,
    sessions: HashMap<u64, Weak<Session>>,
    next_session: u64,
}

/// Shared in-process notification server.
#[derive(Clone)]
pub struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl MemoryBroker {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(BrokerState {
                available: true,
                connect_failure: None,
                failing_listens: HashSet::new(),
                sessions: HashMap::new(),
                next_session: 0,
            })),
        }
    }

    /// Open a new connection handle to this broker.
    pub fn notifier(&self, options: NotifierOptions) -> MemoryNotifier {
        MemoryNotifier::new(self.clone(), options)
    }

    /// Take the server up or down.
    ///
    /// Going down drops every open connection; connections keep their
    /// listen sets so a reconnect restores them.
    pub fn set_available(&self, available: bool) {
        let mut state = self.state.lock();
        state.available = available;
        if !available {
            for session in state.sessions.drain().filter_map(|(_, s)| s.upgrade()) {
                session.connected.store(false, Ordering::SeqCst);
            }
            tracing::debug!("In-process broker went down");
        }
    }

    pub fn is_available(&self) -> bool {
        self.state.lock().available
    }

    /// Make the next connection attempt fail with `reason`.
    pub fn fail_next_connect(&self, reason: impl Into<String>) {
        self.state.lock().connect_failure = Some(reason.into());
    }

    /// Make the next LISTEN on `channel` fail.
    pub fn fail_listen(&self, channel: impl Into<String>) {
        self.state.lock().failing_listens.insert(channel.into());
    }

    /// Number of open connections.
    pub fn connection_count(&self) -> usize {
        let mut state = self.state.lock();
        state.sessions.retain(|_, s| s.strong_count() > 0);
        state.sessions.len()
    }

    fn next_session_id(&self) -> u64 {
        let mut state = self.state.lock();
        state.next_session += 1;
        state.next_session
    }

    fn attach(&self, session: &Arc<Session>) -> Result<(), NotifierError> {
        let mut state = self.state.lock();
        if let Some(reason) = state.connect_failure.take() {
            return Err(NotifierError::Connect(reason));
        }
        if !state.available {
            return Err(NotifierError::ConnectionRefused);
        }
        state.sessions.insert(session.id, Arc::downgrade(session));
        session.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn detach(&self, session: &Session) {
        self.state.lock().sessions.remove(&session.id);
        session.connected.store(false, Ordering::SeqCst);
    }

    fn take_listen_failure(&self, channel: &str) -> bool {
        self.state.lock().failing_listens.remove(channel)
    }

    /// Deliver `text` to every connection listening on `channel`.
    fn deliver(&self, channel: &str, text: &str) -> usize {
        let targets: Vec<Arc<Session>> = {
            let mut state = self.state.lock();
            state.sessions.retain(|_, s| s.strong_count() > 0);
            state
                .sessions
                .values()
                .filter_map(Weak::upgrade)
                .filter(|s| {
                    s.connected.load(Ordering::SeqCst) && s.listening.lock().contains(channel)
                })
                .collect()
        };

        for session in &targets {
            let message = match (session.parse)(text) {
                Ok(value) => Message::Payload(value),
                Err(err) => {
                    tracing::warn!(channel, error = %err, "Failed to parse notification");
                    Message::from(err)
                }
            };
            session.notifications.emit(channel, &message);
        }
        targets.len()
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

/// Reconnect and health-check loop of one connection.
struct Background {
    broker: MemoryBroker,
    session: Arc<Session>,
    events: broadcast::Sender<NotifierEvent>,
    options: NotifierOptions,
}

impl Background {
    async fn run(self, token: CancellationToken, mut reconnect: bool) {
        loop {
            if reconnect {
                if !self.reconnect(&token).await {
                    return;
                }
                reconnect = false;
            }

            let Some(interval) = self.options.paranoid_checking else {
                return;
            };
            tokio::select! {
                () = token.cancelled() => return,
                () = tokio::time::sleep(interval) => {}
            }
            if !self.session.connected.load(Ordering::SeqCst) {
                tracing::warn!(session = self.session.id, "Connection lost, reconnecting");
                reconnect = true;
            }
        }
    }

    /// Returns true once reconnected.
    async fn reconnect(&self, token: &CancellationToken) -> bool {
        let started = Instant::now();
        let mut attempt = 0;
        loop {
            attempt += 1;
            tokio::select! {
                () = token.cancelled() => return false,
                () = tokio::time::sleep(self.options.retry_interval) => {}
            }
            let _ = self.events.send(NotifierEvent::Reconnecting { attempt });

            match self.broker.attach(&self.session) {
                Ok(()) => {
                    tracing::info!(session = self.session.id, attempt, "Reconnected");
                    let _ = self.events.send(NotifierEvent::Connected);
                    return true;
                }
                Err(err) if err.is_connection_refused() => {
                    let exhausted = self
                        .options
                        .retry_limit
                        .is_some_and(|limit| attempt >= limit)
                        || started.elapsed() >= self.options.retry_timeout;
                    if exhausted {
                        tracing::warn!(session = self.session.id, attempt, "Giving up reconnecting");
                        let err = NotifierError::RetriesExhausted { attempts: attempt };
                        let _ = self.events.send(NotifierEvent::Error(Arc::new(err)));
                        return false;
                    }
                    tracing::debug!(session = self.session.id, attempt, "Reconnect refused");
                }
                Err(err) => {
                    tracing::warn!(session = self.session.id, error = %err, "Reconnect failed");
                    let _ = self.events.send(NotifierEvent::Error(Arc::new(err)));
                    return false;
                }
            }
        }
    }
}

/// One connection to a [`MemoryBroker`].
pub struct MemoryNotifier {
    broker: MemoryBroker,
    session: Arc<Session>,
    options: NotifierOptions,
    events: broadcast::Sender<NotifierEvent>,
    background: Mutex<Option<CancellationToken>>,
}

impl MemoryNotifier {
    pub fn new(broker: MemoryBroker, options: NotifierOptions) -> Self {
        let session = Arc::new(Session {
            id: broker.next_session_id(),
            connected: AtomicBool::new(false),
            listening: Mutex::new(HashSet::new()),
            notifications: Arc::new(Notifications::new()),
            parse: options.parse,
        });
        let (events, _) = broadcast::channel(EVENT_CHANNEL_SIZE);
        Self {
            broker,
            session,
            options,
            events,
            background: Mutex::new(None),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.session.connected.load(Ordering::SeqCst)
    }

    pub fn is_listening(&self, channel: &str) -> bool {
        self.session.listening.lock().contains(channel)
    }

    /// Channels this connection listens to, sorted.
    pub fn listening_channels(&self) -> Vec<String> {
        let mut channels: Vec<String> = self.session.listening.lock().iter().cloned().collect();
        channels.sort();
        channels
    }

    fn ensure_connected(&self) -> Result<(), NotifierError> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(NotifierError::NotConnected)
        }
    }

    fn start_background(&self, reconnect: bool) {
        let token = CancellationToken::new();
        if let Some(previous) = self.background.lock().replace(token.clone()) {
            previous.cancel();
        }
        let task = Background {
            broker: self.broker.clone(),
            session: Arc::clone(&self.session),
            events: self.events.clone(),
            options: self.options.clone(),
        };
        tokio::spawn(task.run(token, reconnect));
    }

    /// Returns true if a background task was running.
    fn stop_background(&self) -> bool {
        match self.background.lock().take() {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }
}

#[async_trait]
impl Notifier for MemoryNotifier {
    async fn connect(&self) -> Result<(), NotifierError> {
        let _ = self.stop_background();
        tracing::debug!(
            session = self.session.id,
            native = self.options.native,
            "Connecting to in-process broker"
        );

        match self.broker.attach(&self.session) {
            Ok(()) => {
                let _ = self.events.send(NotifierEvent::Connected);
                if self.options.paranoid_checking.is_some() {
                    self.start_background(false);
                }
                Ok(())
            }
            Err(NotifierError::ConnectionRefused) => {
                self.start_background(true);
                Err(NotifierError::ConnectionRefused)
            }
            Err(err) => Err(err),
        }
    }

    async fn close(&self) -> Result<(), NotifierError> {
        // A stopped reconnect loop will never report an outcome, so anyone
        // waiting on one is told the connection is gone.
        let abandoned_retry = self.stop_background() && !self.is_connected();
        self.broker.detach(&self.session);
        self.session.listening.lock().clear();
        if abandoned_retry {
            tracing::debug!(session = self.session.id, "Closed while reconnecting");
            let _ = self
                .events
                .send(NotifierEvent::Error(Arc::new(NotifierError::Closed)));
        }
        Ok(())
    }

    async fn listen_to(&self, channel: &str) -> Result<(), NotifierError> {
        self.ensure_connected()?;
        if self.broker.take_listen_failure(channel) {
            return Err(NotifierError::Listen {
                channel: channel.to_string(),
                reason: "permission denied".to_string(),
            });
        }
        self.session.listening.lock().insert(channel.to_string());
        Ok(())
    }

    async fn unlisten(&self, channel: &str) -> Result<(), NotifierError> {
        self.ensure_connected()?;
        self.session.listening.lock().remove(channel);
        Ok(())
    }

    async fn unlisten_all(&self) -> Result<(), NotifierError> {
        self.ensure_connected()?;
        self.session.listening.lock().clear();
        Ok(())
    }

    async fn notify(&self, channel: &str, payload: &Value) -> Result<(), NotifierError> {
        self.ensure_connected()?;
        let text = (self.options.serialize)(payload)?;
        if text.len() > self.options.max_payload_bytes {
            return Err(NotifierError::PayloadTooLarge {
                channel: channel.to_string(),
                size: text.len(),
                limit: self.options.max_payload_bytes,
            });
        }
        let receivers = self.broker.deliver(channel, &text);
        tracing::trace!(channel, receivers, "Notification delivered");
        Ok(())
    }

    fn events(&self) -> broadcast::Receiver<NotifierEvent> {
        self.events.subscribe()
    }

    fn notifications(&self) -> Arc<Notifications> {
        Arc::clone(&self.session.notifications)
    }
}

impl Drop for MemoryNotifier {
    fn drop(&mut self) {
        let _ = self.stop_background();
    }
}
