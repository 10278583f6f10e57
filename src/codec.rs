//! Shared-secret codec for every inter-node payload.
//!
//! A token is `base64(nonce || ciphertext)` where the ciphertext is the
//! AES-256-GCM sealed JSON document. The key is the SHA-256 digest of the
//! configured secret, so any node holding the same secret can open tokens
//! from any other node, and a token altered in transit fails to open.

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Key, Nonce,
};
use base64::{engine::general_purpose::STANDARD, Engine};
use rand::RngCore;
use serde::{de::DeserializeOwned, Serialize};
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

use crate::error::CodecError;

const NONCE_LEN: usize = 12;

#[derive(Clone)]
pub struct Codec {
    cipher: Aes256Gcm,
}

impl std::fmt::Debug for Codec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Codec(..)")
    }
}

impl Codec {
    pub fn new(secret: &str) -> Self {
        let mut key = Zeroizing::new([0u8; 32]);
        key.copy_from_slice(&Sha256::digest(secret.as_bytes()));
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key[..]));
        Self { cipher }
    }

    pub fn seal(&self, plaintext: &[u8]) -> Result<String, CodecError> {
        let mut nonce = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce);

        let ciphertext = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|_| CodecError::Encrypt)?;

        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ciphertext);
        Ok(STANDARD.encode(out))
    }

    pub fn open(&self, token: &str) -> Result<Vec<u8>, CodecError> {
        let raw = STANDARD.decode(token.trim())?;
        if raw.len() <= NONCE_LEN {
            return Err(CodecError::Truncated(raw.len()));
        }
        let (nonce, ciphertext) = raw.split_at(NONCE_LEN);
        self.cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| CodecError::Decrypt)
    }

    /// Serialize `value` to JSON and seal it.
    pub fn encode<T: Serialize + ?Sized>(&self, value: &T) -> Result<String, CodecError> {
        let json = serde_json::to_vec(value)?;
        self.seal(&json)
    }

    /// Open a token and parse the JSON document inside.
    pub fn decode<T: DeserializeOwned>(&self, token: &str) -> Result<T, CodecError> {
        let plain = self.open(token)?;
        Ok(serde_json::from_slice(&plain)?)
    }
}

// ─── Tests ───────────────────────────────────────────────────────────
