//! Messages, their typed payloads, and the crypto primitives behind them.

pub mod crypto;
pub mod data;
#[allow(clippy::module_inception)]
pub mod message;

pub use crypto::Keypair;
pub use data::{ActionKind, ActionTable, MessageData};
pub use message::{Message, WitnessSignature};

#[cfg(test)]
mod tests;
