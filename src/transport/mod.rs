//! Notifier transport contract.
//!
//! Provides:
//! - The [`Notifier`] trait the engine drives (connect, LISTEN, NOTIFY)
//! - The fan-out registry every consumer attaches its listeners to
//! - An in-process broker implementing the contract

pub mod memory;
pub mod notify;

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::broadcast;

use crate::error::NotifierError;

pub use memory::{MemoryBroker, MemoryNotifier};
pub use notify::{Listener, ListenerId, Notifications};

/// Lifecycle events emitted by a notifier.
#[derive(Debug, Clone)]
pub enum NotifierEvent {
    /// The connection is established (initially or after a retry).
    Connected,
    /// A background reconnection attempt is starting.
    Reconnecting { attempt: u32 },
    /// The connection failed and will not recover on its own.
    Error(Arc<NotifierError>),
}

/// A push-based notification transport with named channels.
///
/// `connect` may fail on its first attempt and still connect later in the
/// background; that later success is reported only through
/// [`NotifierEvent::Connected`].
#[async_trait]
pub trait Notifier: Send + Sync + 'static {
    async fn connect(&self) -> Result<(), NotifierError>;

    async fn close(&self) -> Result<(), NotifierError>;

    /// Start receiving notifications for `channel`. Idempotent.
    async fn listen_to(&self, channel: &str) -> Result<(), NotifierError>;

    async fn unlisten(&self, channel: &str) -> Result<(), NotifierError>;

    async fn unlisten_all(&self) -> Result<(), NotifierError>;

    /// Send `payload` to every connection listening on `channel`.
    async fn notify(&self, channel: &str, payload: &Value) -> Result<(), NotifierError>;

    /// Subscribe to lifecycle events.
    fn events(&self) -> broadcast::Receiver<NotifierEvent>;

    /// The registry incoming notifications are fanned out through.
    fn notifications(&self) -> Arc<Notifications>;
}
