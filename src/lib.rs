//! # PopMesh
//!
//! `popmesh` is a decentralized publish/subscribe hub. Clients publish signed,
//! content-addressed messages on a tree of channels rooted at `/root`; every
//! server validates them, applies the channel's business rules, fans them out
//! to subscribers and replicates them to its peers by rumor gossip and
//! heartbeat anti-entropy.
//!
//! ## Core Modules
//!
//! - `broker`: channel registry, subscriptions, open sockets and greeted peers.
//! - `channel`: the message validator, the dispatcher and per-channel handlers.
//! - `client`: the handle kept for every open socket.
//! - `config`: layered settings loading.
//! - `gossip`: rumor mongering, heartbeat repair and the replay loop.
//! - `hub`: the service object tying everything together.
//! - `message`: signed messages, crypto and typed payloads.
//! - `persistence`: the sled-backed store.
//! - `transport`: JSON-RPC frames and the WebSocket listeners.
//! - `utils`: error handling and logging.

pub mod broker;
pub mod channel;
pub mod client;
pub mod config;
pub mod gossip;
pub mod hub;
pub mod message;
pub mod persistence;
pub mod transport;
pub mod utils;

#[cfg(test)]
mod testing;
