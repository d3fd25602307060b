//! Error types for the notifier transport and the pub/sub engine.

use thiserror::Error;

use crate::engine::SubscriptionId;

/// Errors raised by a [`Notifier`](crate::transport::Notifier) implementation.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum NotifierError {
    /// The server refused the connection. Transports retry this in the background.
    #[error("connect ECONNREFUSED")]
    ConnectionRefused,

    /// Connecting failed for a non-transient reason.
    #[error("connection failed: {0}")]
    Connect(String),

    /// The operation requires an established connection.
    #[error("notifier is not connected")]
    NotConnected,

    /// The serialized payload exceeds the transport's per-message limit.
    #[error("payload string too long: {size} bytes on channel '{channel}' (max {limit} bytes)")]
    PayloadTooLarge {
        channel: String,
        size: usize,
        limit: usize,
    },

    /// A LISTEN or UNLISTEN registration failed.
    #[error("listen on channel '{channel}' failed: {reason}")]
    Listen { channel: String, reason: String },

    /// An incoming payload could not be parsed.
    #[error("failed to parse payload: {0}")]
    Parse(String),

    /// An outgoing payload could not be serialized.
    #[error("failed to serialize payload: {0}")]
    Serialize(String),

    /// Background reconnection gave up.
    #[error("reconnection failed after {attempts} attempt(s)")]
    RetriesExhausted { attempts: u32 },

    /// The notifier was closed.
    #[error("notifier closed")]
    Closed,
}

impl NotifierError {
    /// Whether this failure is transient and retried by the transport itself.
    pub fn is_connection_refused(&self) -> bool {
        matches!(self, Self::ConnectionRefused)
    }
}

/// Errors surfaced by the pub/sub engine.
#[derive(Debug, Error)]
pub enum Error {
    /// `connect()` failed before the engine reached the connected state.
    #[error("connection failed: {0}")]
    Connection(#[source] NotifierError),

    /// Registering a channel with the transport failed.
    #[error("failed to listen on channel '{channel}'")]
    Listen {
        channel: String,
        #[source]
        source: NotifierError,
    },

    /// A transport operation failed after connecting.
    #[error(transparent)]
    Notifier(#[from] NotifierError),

    /// No subscription is recorded under this handle.
    #[error("unknown subscription {0}")]
    UnknownSubscription(SubscriptionId),

    /// A pull sequence needs at least one channel.
    #[error("at least one channel is required")]
    NoChannels,

    /// The transport's event stream closed while waiting on it.
    #[error("notifier event stream closed")]
    EventStreamClosed,

    /// An error injected into a pull sequence by its consumer.
    #[error("{0}")]
    Bridge(String),
}

/// Result alias for engine operations.
pub type Result<T> = std::result::Result<T, Error>;
