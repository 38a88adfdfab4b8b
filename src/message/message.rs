//! The signed, content-addressed unit of replication.
//!
//! `message_id` is `hash(data, signature)` over the base64url strings, so two
//! servers that receive the same message always agree on its identity. A
//! message is never mutated after creation.

use serde::{Deserialize, Serialize};

use crate::message::crypto::{self, Keypair};
use crate::utils::Result;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WitnessSignature {
    pub witness: String,
    pub signature: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub data: String,
    pub sender: String,
    pub signature: String,
    pub message_id: String,
    #[serde(default)]
    pub witness_signatures: Vec<WitnessSignature>,
}

impl Message {
    /// Sign `data` with `keys` and derive the message id.
    pub fn new(keys: &Keypair, data: &[u8]) -> Self {
        let signature = keys.sign(data);
        let data = crypto::encode(data);
        let message_id = Self::compute_id(&data, &signature);
        Self {
            data,
            sender: keys.public_key(),
            signature,
            message_id,
            witness_signatures: Vec::new(),
        }
    }

    pub fn compute_id(data: &str, signature: &str) -> String {
        crypto::hash(&[data, signature])
    }

    /// The decoded JSON payload.
    pub fn raw_data(&self) -> Result<Vec<u8>> {
        crypto::decode("data", &self.data)
    }
}
