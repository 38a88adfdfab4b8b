//! Ed25519 signing, verification and the content hash used for message ids.
//!
//! Keys, signatures and hashes travel as base64url strings (with padding).

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};

use crate::utils::{PopError, Result};

pub fn encode(bytes: &[u8]) -> String {
    URL_SAFE.encode(bytes)
}

pub fn decode(field: &str, value: &str) -> Result<Vec<u8>> {
    URL_SAFE.decode(value).map_err(|e| {
        PopError::invalid_message_field(format!("failed to decode {field}")).with_source(e)
    })
}

/// SHA-256 over each part written as `<byte length><part>`, base64url encoded.
pub fn hash(parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part.len().to_string().as_bytes());
        hasher.update(part.as_bytes());
    }
    encode(&hasher.finalize())
}

/// Decode a base64url Ed25519 public key.
pub fn public_key(value: &str) -> Result<VerifyingKey> {
    let bytes: [u8; 32] = decode("public key", value)?
        .try_into()
        .map_err(|_| PopError::invalid_message_field("public key must be 32 bytes"))?;
    VerifyingKey::from_bytes(&bytes)
        .map_err(|e| PopError::invalid_message_field("invalid public key").with_source(e))
}

/// Verify a base64url signature by `public_key` over `data`.
pub fn verify(public_key_b64: &str, data: &[u8], signature_b64: &str) -> Result<()> {
    let key = public_key(public_key_b64)?;
    let signature_bytes = decode("signature", signature_b64)?;
    let signature = Signature::from_slice(&signature_bytes)
        .map_err(|e| PopError::invalid_message_field("malformed signature").with_source(e))?;
    key.verify(data, &signature)
        .map_err(|e| PopError::invalid_message_field("signature verification failed").with_source(e))
}

/// A local Ed25519 identity: the server's own, or a test participant's.
pub struct Keypair {
    signing_key: SigningKey,
}

impl Clone for Keypair {
    fn clone(&self) -> Self {
        Self {
            signing_key: SigningKey::from_bytes(&self.signing_key.to_bytes()),
        }
    }
}

impl std::fmt::Debug for Keypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Keypair")
            .field("public_key", &self.public_key())
            .finish()
    }
}

impl Keypair {
    pub fn generate() -> Self {
        Self {
            signing_key: SigningKey::generate(&mut OsRng),
        }
    }

    pub fn from_secret_bytes(bytes: &[u8]) -> Result<Self> {
        let secret: [u8; 32] = bytes
            .try_into()
            .map_err(|_| PopError::internal("stored secret key must be 32 bytes"))?;
        Ok(Self {
            signing_key: SigningKey::from_bytes(&secret),
        })
    }

    pub fn secret_bytes(&self) -> [u8; 32] {
        self.signing_key.to_bytes()
    }

    /// Base64url public key; doubles as the server id for rumors.
    pub fn public_key(&self) -> String {
        encode(self.signing_key.verifying_key().as_bytes())
    }

    /// Base64url signature over `data`.
    pub fn sign(&self, data: &[u8]) -> String {
        encode(&self.signing_key.sign(data).to_bytes())
    }
}
