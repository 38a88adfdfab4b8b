//! Channel dispatch: validate, run the topic handler, commit, fan out.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::Serialize;
use tokio::sync::mpsc::UnboundedSender;

use crate::broker::Broker;
use crate::channel::validator::{DeliveryMode, Validation, Validator};
use crate::channel::{ChannelType, ROOT, coin, election, lao, lao_of, root, social};
use crate::config::ServerSettings;
use crate::message::data::{self, ActionKind};
use crate::message::{ActionTable, Keypair, Message, MessageData};
use crate::persistence::{Changeset, Store};
use crate::utils::{ErrorKind, PopError, Result};

/// A client message this server just applied; input of the rumor queue.
#[derive(Debug, Clone, PartialEq)]
pub struct Accepted {
    pub channel: String,
    pub message: Message,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Applied,
    AlreadyKnown,
}

/// Read-only view handed to topic handlers.
pub struct HandlerContext<'a> {
    pub store: &'a Store,
    pub broker: &'a Broker,
    pub keys: &'a Keypair,
    pub settings: &'a ServerSettings,
}

impl HandlerContext<'_> {
    /// A message signed by this server carrying `payload`.
    pub fn derive<T: Serialize>(&self, kind: ActionKind, payload: &T) -> Result<Message> {
        let raw = data::encode_data(kind, payload)?;
        Ok(Message::new(self.keys, &raw))
    }
}

/// Business rules of one channel type.
///
/// A handler checks the message against the current state and returns the
/// writes it implies. The triggering message itself is stored by the
/// dispatcher unless the handler calls `Changeset::suppress_trigger`.
pub trait ChannelHandler: Send + Sync {
    fn handle(
        &self,
        ctx: &HandlerContext<'_>,
        channel: &str,
        message: &Message,
        data: MessageData,
    ) -> Result<Changeset>;
}

pub(crate) fn unsupported(channel: ChannelType, data: &MessageData) -> PopError {
    PopError::invalid_message_field(format!(
        "failed to handle {} on a {channel} channel, invalid object#action",
        data.kind()
    ))
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct Dispatcher {
    store: Store,
    broker: Arc<Broker>,
    validator: Validator,
    table: ActionTable,
    handlers: HashMap<ChannelType, Box<dyn ChannelHandler>>,
    keys: Keypair,
    settings: ServerSettings,
    accepted: UnboundedSender<Accepted>,
    /// One lock per LAO (`/root` for the root channel).
    lao_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl Dispatcher {
    /// A dispatcher with a handler registered for every channel type.
    pub fn new(
        store: Store,
        broker: Arc<Broker>,
        keys: Keypair,
        settings: ServerSettings,
        accepted: UnboundedSender<Accepted>,
    ) -> Self {
        let mut dispatcher = Self {
            validator: Validator::new(store.clone()),
            store,
            broker,
            table: ActionTable::standard(),
            handlers: HashMap::new(),
            keys,
            settings,
            accepted,
            lao_locks: Mutex::new(HashMap::new()),
        };
        dispatcher.register(ChannelType::Root, Box::new(root::RootHandler));
        dispatcher.register(ChannelType::Lao, Box::new(lao::LaoHandler));
        dispatcher.register(ChannelType::Election, Box::new(election::ElectionHandler));
        dispatcher.register(ChannelType::Chirp, Box::new(social::ChirpHandler));
        dispatcher.register(ChannelType::Posts, Box::new(social::PostsHandler));
        dispatcher.register(ChannelType::Reaction, Box::new(social::ReactionHandler));
        dispatcher.register(ChannelType::Coin, Box::new(coin::CoinHandler));
        dispatcher
    }

    pub fn register(&mut self, kind: ChannelType, handler: Box<dyn ChannelHandler>) {
        self.handlers.insert(kind, handler);
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn server_key(&self) -> String {
        self.keys.public_key()
    }

    fn lao_lock(&self, channel: &str) -> Arc<Mutex<()>> {
        let lao = lao_of(channel).unwrap_or_else(|| ROOT.to_string());
        lock(&self.lao_locks).entry(lao).or_default().clone()
    }

    fn channel_type(&self, channel: &str) -> Result<ChannelType> {
        if let Some(kind) = self.broker.channel_type(channel) {
            return Ok(kind);
        }
        let kind = self.store.get_channel_type(channel)?;
        self.broker.add_channel(channel, kind);
        Ok(kind)
    }

    /// Validate `message`, apply it to `channel` and broadcast everything it
    /// wrote. Either every write of the dispatch is committed or none is.
    ///
    /// Dispatches within one LAO are serialized from validation to commit, so
    /// the state a handler checked is still current when its changeset lands.
    pub fn dispatch(&self, channel: &str, message: &Message, mode: DeliveryMode) -> Result<Outcome> {
        let kind = self.channel_type(channel)?;
        let lao_lock = self.lao_lock(channel);
        let _serialized = lock(&lao_lock);

        if self.validator.validate(message, mode)? == Validation::AlreadyKnown {
            return Ok(Outcome::AlreadyKnown);
        }

        let data = MessageData::parse(&self.table, &message.raw_data()?)?;
        let handler = self
            .handlers
            .get(&kind)
            .ok_or_else(|| PopError::internal(format!("no handler for {kind} channels")))?;

        let ctx = HandlerContext {
            store: &self.store,
            broker: &self.broker,
            keys: &self.keys,
            settings: &self.settings,
        };
        let action = data.kind();
        let mut changeset = handler.handle(&ctx, channel, message, data)?;
        if changeset.stores_trigger() {
            changeset.stage_trigger(channel, message.clone());
        }

        if let Err(err) = self.store.apply(&changeset) {
            // the same message was stored concurrently through another LAO
            if err.kind() == ErrorKind::DuplicateResource
                && self.store.has_message(&message.message_id)?
            {
                return match mode {
                    DeliveryMode::Direct => {
                        Err(PopError::invalid_action("message already received"))
                    }
                    DeliveryMode::Replay => Ok(Outcome::AlreadyKnown),
                };
            }
            return Err(err);
        }

        for (path, record) in changeset.channels() {
            self.broker.add_channel(path, record.kind);
            tracing::info!(channel = %path, kind = %record.kind, "channel created");
        }
        for staged in changeset.messages() {
            self.broker.broadcast(&staged.channel, &staged.message);
        }
        tracing::debug!(channel, %action, message_id = %message.message_id, "message applied");

        if mode == DeliveryMode::Direct {
            let accepted = Accepted {
                channel: channel.to_string(),
                message: message.clone(),
            };
            if self.accepted.send(accepted).is_err() {
                tracing::warn!(channel, "rumor queue closed, message will not be gossiped");
            }
        }
        Ok(Outcome::Applied)
    }
}
