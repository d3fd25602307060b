//! Messages delivered to subscribers and the shared transform pipeline.

use std::fmt;
use std::sync::Arc;

use serde_json::Value;

use crate::error::NotifierError;

/// A value delivered on a channel.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// A domain payload.
    Payload(Value),
    /// A transport-level failure delivered in-band.
    Error(Arc<NotifierError>),
}

impl Message {
    /// The payload, if this is not an error.
    pub fn payload(&self) -> Option<&Value> {
        match self {
            Self::Payload(value) => Some(value),
            Self::Error(_) => None,
        }
    }

    /// Consume the message, returning the payload or the transport error.
    pub fn into_result(self) -> Result<Value, Arc<NotifierError>> {
        match self {
            Self::Payload(value) => Ok(value),
            Self::Error(err) => Err(err),
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error(_))
    }
}

impl From<Value> for Message {
    fn from(value: Value) -> Self {
        Self::Payload(value)
    }
}

impl From<NotifierError> for Message {
    fn from(err: NotifierError) -> Self {
        Self::Error(Arc::new(err))
    }
}

/// Mapping applied to every payload before it reaches a consumer.
///
/// Errors bypass the mapping so consumers can tell transport failures
/// apart from domain messages. The default is the identity.
#[derive(Clone)]
pub struct MessageHandler {
    map: Option<Arc<dyn Fn(Value) -> Value + Send + Sync>>,
}

impl MessageHandler {
    pub fn new<F>(map: F) -> Self
    where
        F: Fn(Value) -> Value + Send + Sync + 'static,
    {
        Self {
            map: Some(Arc::new(map)),
        }
    }

    pub fn identity() -> Self {
        Self { map: None }
    }

    /// Apply the mapping to a message.
    pub fn apply(&self, message: Message) -> Message {
        match (message, &self.map) {
            (Message::Payload(value), Some(map)) => Message::Payload(map(value)),
            (message, _) => message,
        }
    }
}

impl Default for MessageHandler {
    fn default() -> Self {
        Self::identity()
    }
}

impl fmt::Debug for MessageHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageHandler")
            .field("identity", &self.map.is_none())
            .finish()
    }
}
