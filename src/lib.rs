//! pgbridge: push-based channel notifications bridged to pull-style
//! subscriptions.
//!
//! A notifier (LISTEN/NOTIFY-style broker) pushes messages on named
//! channels. The [`PubSub`] engine exposes them through callback
//! subscriptions and through [`Bridge`]s, ordered pull sequences that can
//! be awaited one message at a time or consumed as a `Stream`.
//!
//! # Architecture
//!
//! - **Fan-out**: every consumer on a channel gets its own copy of a message
//! - **Connection race**: a refused first connect waits for the notifier's
//!   background retry instead of failing
//! - **Teardown**: closing or dropping a bridge resolves its waiting pulls
//!   and removes its listeners
//!
//! # Modules
//!
//! - [`bridge`]: Push-to-pull adapter
//! - [`config`]: Engine, notifier and CLI configuration
//! - [`engine`]: Publish/subscribe engine and capability trait
//! - [`error`]: Error types
//! - [`message`]: Delivered messages and the transform pipeline
//! - [`observability`]: Metrics and tracing setup
//! - [`transport`]: Notifier contract and in-process broker
//!
//! # Example
//!
//! ```
//! use pgbridge::config::{EngineOptions, NotifierOptions};
//! use pgbridge::transport::MemoryBroker;
//! use pgbridge::{Message, PubSub};
//! use serde_json::json;
//!
//! # tokio_test::block_on(async {
//! let broker = MemoryBroker::new();
//! let pubsub = PubSub::new(
//!     broker.notifier(NotifierOptions::default()),
//!     EngineOptions { topics: vec!["orders".into()], ..EngineOptions::default() },
//! );
//! pubsub.connect().await.unwrap();
//!
//! let orders = pubsub.async_iterator(["orders"]).unwrap();
//! assert!(pubsub.publish("orders", json!({"id": 1})).await);
//! assert_eq!(orders.next().await, Some(Message::Payload(json!({"id": 1}))));
//! # });
//! ```

// Lint configuration
#![warn(clippy::all)]
#![allow(
    clippy::module_name_repetitions, // engine::EngineEvent is fine
    clippy::must_use_candidate,      // Not all functions need #[must_use]
    clippy::missing_errors_doc,      // Error docs can be verbose
    clippy::missing_panics_doc       // Panic docs can be verbose
)]

pub mod bridge;
pub mod config;
pub mod engine;
pub mod error;
pub mod message;
pub mod observability;
pub mod transport;

pub use bridge::{Bridge, Pull};
pub use engine::{
    ConnectionState, EngineEvent, IntoChannels, PubSub, PubSubEngine, SubscriptionId,
};
pub use error::{Error, NotifierError, Result};
pub use message::{Message, MessageHandler};
