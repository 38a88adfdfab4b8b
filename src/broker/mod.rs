//! The `broker` module holds the in-memory registries: channels and their
//! subscribers, open sockets, and greeted peer servers. It also fans
//! accepted messages out to subscribers.

pub mod engine;
pub mod topic;

pub use engine::Broker;
