//! Fan-out listener registry shared by a notifier and its consumers.
//!
//! Every listener registered on a channel receives its own copy of each
//! message emitted on that channel. Listeners are invoked outside the
//! registry lock, so a listener may add or remove listeners while running.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::message::Message;

/// Callback invoked for every message on a channel.
pub type Listener = Arc<dyn Fn(Message) + Send + Sync>;

/// Identifies one registration in a [`Notifications`] registry.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub struct ListenerId(u64);

impl fmt::Display for ListenerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Default)]
struct Registry {
    next_id: u64,
    by_channel: HashMap<String, Vec<(ListenerId, Listener)>>,
    channel_of: HashMap<ListenerId, String>,
}

/// Per-channel fan-out of notifications.
#[derive(Default)]
pub struct Notifications {
    registry: Mutex<Registry>,
}

impl Notifications {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener on `channel`.
    ///
    /// Listeners on one channel fire in registration order.
    pub fn on(&self, channel: impl Into<String>, listener: Listener) -> ListenerId {
        let channel = channel.into();
        let mut registry = self.registry.lock();
        registry.next_id += 1;
        let id = ListenerId(registry.next_id);
        registry
            .by_channel
            .entry(channel.clone())
            .or_default()
            .push((id, listener));
        registry.channel_of.insert(id, channel);
        id
    }

    /// Remove a listener. Returns false if it was not registered.
    pub fn off(&self, id: ListenerId) -> bool {
        let mut registry = self.registry.lock();
        let Some(channel) = registry.channel_of.remove(&id) else {
            return false;
        };
        if let Some(listeners) = registry.by_channel.get_mut(&channel) {
            listeners.retain(|(existing, _)| *existing != id);
            if listeners.is_empty() {
                registry.by_channel.remove(&channel);
            }
        }
        true
    }

    /// Deliver `message` to every listener on `channel`.
    ///
    /// # Returns
    ///
    /// The number of listeners invoked.
    pub fn emit(&self, channel: &str, message: &Message) -> usize {
        let listeners: Vec<Listener> = {
            let registry = self.registry.lock();
            match registry.by_channel.get(channel) {
                Some(listeners) => listeners.iter().map(|(_, l)| Arc::clone(l)).collect(),
                None => return 0,
            }
        };

        for listener in &listeners {
            listener(message.clone());
        }
        listeners.len()
    }

    /// Number of listeners registered on `channel`.
    #[must_use]
    pub fn listener_count(&self, channel: &str) -> usize {
        self.registry
            .lock()
            .by_channel
            .get(channel)
            .map_or(0, Vec::len)
    }

    /// Number of listeners across all channels.
    #[must_use]
    pub fn total_listeners(&self) -> usize {
        self.registry.lock().channel_of.len()
    }
}

impl fmt::Debug for Notifications {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Notifications")
            .field("listeners", &self.total_listeners())
            .finish()
    }
}
