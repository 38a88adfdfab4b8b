//! The `persistence` module keeps everything a server must remember across
//! restarts: messages and per-channel inboxes, the channel registry, topic
//! state, the rumor ledger, parked messages and the server's own key.
//!
//! It uses `sled` as an embedded key-value store. Writes caused by one
//! dispatch are staged in a `Changeset` and committed in a single
//! transaction.

pub mod changeset;
pub mod sled_store;

pub use changeset::{ChannelRecord, Changeset, StagedMessage};
pub use sled_store::{ParkedMessage, Store, StoredMessage};
