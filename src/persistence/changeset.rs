//! Writes staged by a topic handler, applied by `Store::apply` in one
//! transaction.

use serde::{Deserialize, Serialize};

use crate::channel::ChannelType;
use crate::message::Message;
use crate::utils::Result;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelRecord {
    pub kind: ChannelType,
    /// Owning LAO path; `/root` for the root channel itself.
    pub lao: String,
}

#[derive(Debug, Clone)]
pub struct StagedMessage {
    pub channel: String,
    pub message: Message,
    /// Published on this channel by a client, as opposed to derived by a server.
    pub base: bool,
}

#[derive(Debug, Clone)]
pub struct Changeset {
    pub(crate) messages: Vec<StagedMessage>,
    pub(crate) channels: Vec<(String, ChannelRecord)>,
    pub(crate) state: Vec<(String, Vec<u8>)>,
    store_trigger: bool,
}

impl Default for Changeset {
    fn default() -> Self {
        Self::new()
    }
}

impl Changeset {
    pub fn new() -> Self {
        Self {
            messages: Vec::new(),
            channels: Vec::new(),
            state: Vec::new(),
            store_trigger: true,
        }
    }

    pub fn stage_message(&mut self, channel: &str, message: Message, base: bool) {
        self.messages.push(StagedMessage {
            channel: channel.to_string(),
            message,
            base,
        });
    }

    /// Stage the message being dispatched ahead of everything the handler
    /// derived from it.
    pub fn stage_trigger(&mut self, channel: &str, message: Message) {
        self.messages.insert(
            0,
            StagedMessage {
                channel: channel.to_string(),
                message,
                base: true,
            },
        );
    }

    pub fn add_channel(&mut self, path: impl Into<String>, kind: ChannelType, lao: &str) {
        self.channels.push((
            path.into(),
            ChannelRecord {
                kind,
                lao: lao.to_string(),
            },
        ));
    }

    pub fn set_state<T: Serialize>(&mut self, key: impl Into<String>, value: &T) -> Result<()> {
        self.state.push((key.into(), serde_json::to_vec(value)?));
        Ok(())
    }

    /// The handler persisted the triggering message itself (or chose not to).
    pub fn suppress_trigger(&mut self) {
        self.store_trigger = false;
    }

    pub fn stores_trigger(&self) -> bool {
        self.store_trigger
    }

    pub fn messages(&self) -> &[StagedMessage] {
        &self.messages
    }

    pub fn channels(&self) -> &[(String, ChannelRecord)] {
        &self.channels
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty() && self.channels.is_empty() && self.state.is_empty()
    }
}
