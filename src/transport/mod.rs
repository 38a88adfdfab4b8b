//! The `transport` module is responsible for network communication with
//! clients and peer servers, over WebSockets.
//!
//! It defines the JSON-RPC frames exchanged on every socket and runs the two
//! listeners (one for clients, one for servers), the peer dialer and a small
//! catchup client.

pub mod message;
pub mod websocket;
