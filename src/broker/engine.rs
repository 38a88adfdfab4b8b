//! Broker engine
//!
//! In-memory registries shared by every worker:
//! - channels known to this server and their subscriber sets
//! - open sockets, clients and peer servers alike
//! - greetings received from peer servers
//!
//! Each registry sits behind its own `RwLock`, so looking up a channel never
//! waits on a subscription change or a socket registration. Nothing here
//! touches the network directly: broadcasting only queues frames on the
//! subscribers' write loops.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::broker::topic::{SubscriberId, Topic};
use crate::channel::{ChannelType, ROOT};
use crate::client::Client;
use crate::message::Message;
use crate::transport::message::{self, ChannelMessage, Method, ServerGreeting};
use crate::utils::{PopError, Result};

#[derive(Debug, Default)]
pub struct Broker {
    topics: RwLock<HashMap<String, Topic>>,
    clients: RwLock<HashMap<SubscriberId, Client>>,
    greetings: RwLock<HashMap<SubscriberId, ServerGreeting>>,
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

impl Broker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_client(&self, client: Client) {
        write(&self.clients).insert(client.id.clone(), client);
    }

    pub fn remove_client(&self, client_id: &SubscriberId) {
        write(&self.clients).remove(client_id);
        write(&self.greetings).remove(client_id);
    }

    pub fn client(&self, client_id: &str) -> Option<Client> {
        read(&self.clients).get(client_id).cloned()
    }

    // ---- channels ----

    pub fn add_channel(&self, path: &str, kind: ChannelType) {
        write(&self.topics)
            .entry(path.to_string())
            .or_insert_with(|| Topic::new(path, kind));
    }

    pub fn has_channel(&self, path: &str) -> bool {
        read(&self.topics).contains_key(path)
    }

    pub fn channel_type(&self, path: &str) -> Option<ChannelType> {
        read(&self.topics).get(path).map(|topic| topic.kind)
    }

    // ---- subscriptions ----

    /// Subscribes a socket to a known channel. Repeating a subscription is a
    /// no-op; `/root` cannot be subscribed to.
    pub fn subscribe(&self, channel: &str, subscriber: SubscriberId) -> Result<()> {
        if channel == ROOT {
            return Err(PopError::invalid_action("cannot subscribe to root channel"));
        }
        let mut topics = write(&self.topics);
        let topic = topics
            .get_mut(channel)
            .ok_or_else(|| PopError::invalid_resource(format!("channel {channel} does not exist")))?;
        topic.subscribe(subscriber.clone());
        tracing::info!(socket = %subscriber, channel, "subscribed");
        Ok(())
    }

    /// Unsubscribes a socket. Unsubscribing a socket that is not subscribed
    /// is an error.
    pub fn unsubscribe(&self, channel: &str, subscriber: &SubscriberId) -> Result<()> {
        if channel == ROOT {
            return Err(PopError::invalid_action("cannot unsubscribe from root channel"));
        }
        let mut topics = write(&self.topics);
        let topic = topics
            .get_mut(channel)
            .ok_or_else(|| PopError::invalid_resource(format!("channel {channel} does not exist")))?;
        if !topic.unsubscribe(subscriber) {
            return Err(PopError::access_denied(format!(
                "socket {subscriber} is not subscribed to {channel}"
            )));
        }
        tracing::info!(socket = %subscriber, channel, "unsubscribed");
        Ok(())
    }

    pub fn subscribers(&self, channel: &str) -> Vec<SubscriberId> {
        read(&self.topics)
            .get(channel)
            .map(|topic| topic.subscribers.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Sends a `broadcast` frame for `message` to every socket subscribed to
    /// `channel`. Returns how many sockets it was queued for.
    pub fn broadcast(&self, channel: &str, message: &Message) -> usize {
        let method = Method::Broadcast(ChannelMessage {
            channel: channel.to_string(),
            message: message.clone(),
        });
        let text = match message::query(None, &method) {
            Ok(text) => text,
            Err(e) => {
                tracing::error!(channel, error = %e, "failed to serialize broadcast");
                return 0;
            }
        };

        let subscribers = self.subscribers(channel);
        let clients = read(&self.clients);
        let mut delivered = 0;
        for sub_id in &subscribers {
            match clients.get(sub_id) {
                Some(client) => {
                    if client.send(text.clone()) {
                        delivered += 1;
                    }
                }
                None => tracing::warn!(socket = %sub_id, "no socket registered for subscriber"),
            }
        }
        delivered
    }

    /// Removes a socket and unsubscribes it from every channel.
    pub fn cleanup_client(&self, client_id: &SubscriberId) {
        self.remove_client(client_id);

        let mut topics = write(&self.topics);
        for topic in topics.values_mut() {
            if topic.unsubscribe(client_id) {
                tracing::debug!(socket = %client_id, channel = %topic.name, "dropped subscription");
            }
        }
        tracing::info!(socket = %client_id, "cleaned up socket");
    }

    // ---- peers ----

    /// Open sockets to other servers.
    pub fn peers(&self) -> Vec<Client> {
        read(&self.clients)
            .values()
            .filter(|client| client.is_server())
            .cloned()
            .collect()
    }

    /// Remembers a peer's greeting. Returns false if it had already greeted.
    pub fn record_peer(&self, socket_id: &str, greeting: ServerGreeting) -> bool {
        write(&self.greetings)
            .insert(socket_id.to_string(), greeting)
            .is_none()
    }

    pub fn is_greeted(&self, socket_id: &str) -> bool {
        read(&self.greetings).contains_key(socket_id)
    }

    /// Server addresses of every greeted peer.
    pub fn known_peers(&self) -> Vec<String> {
        let mut addresses: Vec<String> = read(&self.greetings)
            .values()
            .map(|greeting| greeting.server_address.clone())
            .collect();
        addresses.sort();
        addresses.dedup();
        addresses
    }
}
