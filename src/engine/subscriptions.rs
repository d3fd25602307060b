//! Subscription table owned by one engine.
//!
//! Maps handles to the channel and fan-out listener they registered.
//! Handles are allocated from a per-engine counter and never reused.

use std::collections::HashMap;
use std::fmt;

use crate::transport::ListenerId;

/// Opaque handle returned by `subscribe`.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub struct SubscriptionId(u64);

impl SubscriptionId {
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Subscription {
    pub channel: String,
    pub listener: ListenerId,
}

#[derive(Debug, Default)]
pub(crate) struct SubscriptionTable {
    last_id: u64,
    entries: HashMap<SubscriptionId, Subscription>,
}

impl SubscriptionTable {
    pub fn insert(&mut self, channel: String, listener: ListenerId) -> SubscriptionId {
        self.last_id += 1;
        let id = SubscriptionId(self.last_id);
        self.entries.insert(id, Subscription { channel, listener });
        id
    }

    pub fn remove(&mut self, id: SubscriptionId) -> Option<Subscription> {
        self.entries.remove(&id)
    }

    /// Remove every record. The handle counter keeps counting.
    pub fn drain(&mut self) -> Vec<Subscription> {
        self.entries.drain().map(|(_, s)| s).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}
