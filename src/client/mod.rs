//! The `client` module defines the handle the hub keeps for every open
//! socket, whether a client or a peer server.
//!
//! `Client` wraps the socket's unique identifier and the channel feeding its
//! write loop, and knows how to frame results and errors.

pub mod pubsub_client;
pub use pubsub_client::{Client, SocketKind};
