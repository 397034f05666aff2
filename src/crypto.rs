//! Secret sealing with AES-256-GCM
//!
//! Every ciphertext is bound to its `(tenant_id, secret_key)` slot through the
//! AEAD associated data, so a row copied under another tenant or key fails to
//! open.
//!
//! Envelope layout: `0x01 | nonce (12) | ciphertext | tag (16)`.

#![allow(deprecated)]

use aes_gcm::{
    Aes256Gcm, AeadCore, KeyInit, Nonce,
    aead::{Aead, OsRng, Payload},
};
use thiserror::Error;
use uuid::Uuid;
use zeroize::{Zeroize, ZeroizeOnDrop};

const ENVELOPE_V1: u8 = 0x01;
const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;
const HEADER_LEN: usize = 1 + NONCE_LEN;

pub const KEY_LEN: usize = 32;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("invalid key length: expected 32 bytes, got {0}")]
    InvalidKeyLength(usize),
    #[error("sealing failed for secret '{0}'")]
    SealFailed(String),
    #[error("secret '{0}' could not be opened (wrong key, slot or tampered data)")]
    OpenFailed(String),
    #[error("secret '{secret_key}' is not a sealed envelope ({length} bytes)")]
    NotSealed { secret_key: String, length: usize },
}

/// Where a secret lives; doubles as the associated data of its envelope.
#[derive(Debug, Clone, Copy)]
pub struct SecretSlot<'a> {
    pub tenant_id: Uuid,
    pub secret_key: &'a str,
}

impl<'a> SecretSlot<'a> {
    pub fn new(tenant_id: Uuid, secret_key: &'a str) -> Self {
        Self {
            tenant_id,
            secret_key,
        }
    }

    fn associated_data(&self) -> String {
        format!("{}|{}", self.tenant_id, self.secret_key)
    }
}

/// Master key for the secret store, wiped from memory on drop
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct CryptoKey(Vec<u8>);

impl std::fmt::Debug for CryptoKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("CryptoKey([REDACTED])")
    }
}

impl CryptoKey {
    pub fn new(bytes: Vec<u8>) -> Result<Self, CryptoError> {
        if bytes.len() != KEY_LEN {
            return Err(CryptoError::InvalidKeyLength(bytes.len()));
        }
        Ok(Self(bytes))
    }

    fn cipher(&self) -> Result<Aes256Gcm, CryptoError> {
        Aes256Gcm::new_from_slice(&self.0)
            .map_err(|_| CryptoError::InvalidKeyLength(self.0.len()))
    }

    /// Encrypts `plaintext` for `slot` under a fresh random nonce.
    pub fn seal(&self, slot: SecretSlot<'_>, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let aad = slot.associated_data();
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);

        let sealed = self
            .cipher()?
            .encrypt(
                &nonce,
                Payload {
                    msg: plaintext,
                    aad: aad.as_bytes(),
                },
            )
            .map_err(|_| CryptoError::SealFailed(slot.secret_key.to_string()))?;

        let mut envelope = Vec::with_capacity(HEADER_LEN + sealed.len());
        envelope.push(ENVELOPE_V1);
        envelope.extend_from_slice(nonce.as_slice());
        envelope.extend_from_slice(&sealed);
        Ok(envelope)
    }

    /// Decrypts an envelope produced by [`CryptoKey::seal`] for the same slot.
    pub fn open(&self, slot: SecretSlot<'_>, envelope: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if !is_sealed(envelope) {
            return Err(CryptoError::NotSealed {
                secret_key: slot.secret_key.to_string(),
                length: envelope.len(),
            });
        }

        let (header, sealed) = envelope.split_at(HEADER_LEN);
        let nonce = Nonce::from_slice(&header[1..]);
        let aad = slot.associated_data();

        self.cipher()?
            .decrypt(
                nonce,
                Payload {
                    msg: sealed,
                    aad: aad.as_bytes(),
                },
            )
            .map_err(|_| CryptoError::OpenFailed(slot.secret_key.to_string()))
    }
}

/// True when `bytes` has the version byte and room for a nonce and tag.
pub fn is_sealed(bytes: &[u8]) -> bool {
    bytes.len() >= HEADER_LEN + TAG_LEN && bytes[0] == ENVELOPE_V1
}
