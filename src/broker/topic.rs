use std::collections::HashSet;

use crate::channel::ChannelType;

pub type SubscriberId = String;

/// A known channel and the sockets currently subscribed to it.
#[derive(Debug)]
pub struct Topic {
    pub name: String,
    pub kind: ChannelType,
    pub subscribers: HashSet<SubscriberId>,
}

impl Topic {
    pub fn new(name: &str, kind: ChannelType) -> Self {
        Self {
            name: name.to_string(),
            kind,
            subscribers: HashSet::new(),
        }
    }

    /// Adds the subscriber's ID; subscribing twice has no effect.
    pub fn subscribe(&mut self, id: SubscriberId) {
        self.subscribers.insert(id);
    }

    /// Returns false if `id` was not subscribed.
    pub fn unsubscribe(&mut self, id: &SubscriberId) -> bool {
        self.subscribers.remove(id)
    }
}
