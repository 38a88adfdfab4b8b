//! The idempotency gate every incoming message passes before dispatch.

use crate::message::{Message, crypto};
use crate::persistence::Store;
use crate::utils::{PopError, Result};

/// How a message reached this server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryMode {
    /// Published by a client connected to this server.
    Direct,
    /// Learned from a rumor or a heartbeat repair.
    Replay,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Validation {
    Fresh,
    /// Already stored and delivered by replay: skip without error.
    AlreadyKnown,
}

#[derive(Debug, Clone)]
pub struct Validator {
    store: Store,
}

impl Validator {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    pub fn validate(&self, message: &Message, mode: DeliveryMode) -> Result<Validation> {
        let data = message.raw_data()?;
        crypto::verify(&message.sender, &data, &message.signature)?;

        let expected = Message::compute_id(&message.data, &message.signature);
        if expected != message.message_id {
            return Err(PopError::invalid_action(format!(
                "message_id is {}, should be {expected}",
                message.message_id
            )));
        }

        if !message.witness_signatures.is_empty() {
            let id_bytes = crypto::decode("message_id", &message.message_id)?;
            for witness in &message.witness_signatures {
                crypto::verify(&witness.witness, &id_bytes, &witness.signature)?;
            }
        }

        if self.store.has_message(&message.message_id)? {
            return match mode {
                DeliveryMode::Direct => Err(PopError::invalid_action("message already received")),
                DeliveryMode::Replay => Ok(Validation::AlreadyKnown),
            };
        }
        Ok(Validation::Fresh)
    }
}
