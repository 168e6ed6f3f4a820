// Copyright 2020 Joyent, Inc.

//! This module derives the per-pipeline record cipher from the pre-shared
//! `rpc_key` and seals/opens individual frame payloads with AES-256-GCM.
//! The iteration count is deliberately low: the key exists to match two
//! ends of a pipeline, not to harden a password. Every record is sealed
//! under a fresh random 96-bit nonce that travels as a prefix of the
//! ciphertext, so nonce reuse cannot occur across records or directions.

use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use pbkdf2::pbkdf2_hmac;
use sha2::{Digest, Sha256, Sha512};

use crate::errors::RpcError;

/// Size in bytes of the per-record nonce prefix.
pub const NONCE_SZ: usize = 12;

const KDF_ROUNDS: u32 = 10;

/// The record cipher of one duplex pipeline. Both ends derive the same
/// key from the same `rpc_key`; a record sealed by either end opens on the
/// other.
#[derive(Clone)]
pub struct Cipher {
    aead: Aes256Gcm,
}

impl Cipher {
    /// Derive the record cipher from a pre-shared key. An empty key means
    /// the pipeline runs in the clear and no cipher exists.
    pub fn derive(rpc_key: &str) -> Option<Cipher> {
        if rpc_key.is_empty() {
            return None;
        }
        let salt = Sha512::digest(rpc_key.as_bytes());
        let mut key = [0u8; 32];
        pbkdf2_hmac::<Sha256>(rpc_key.as_bytes(), salt.as_slice(), KDF_ROUNDS, &mut key);
        Some(Cipher {
            aead: Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key)),
        })
    }

    /// Seal one record: `nonce || ciphertext`.
    pub fn seal(&self, plain: &[u8]) -> Result<Vec<u8>, RpcError> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .aead
            .encrypt(&nonce, plain)
            .map_err(|_| RpcError::Crypto(String::from("record encryption failed")))?;
        let mut sealed = Vec::with_capacity(NONCE_SZ + ciphertext.len());
        sealed.extend_from_slice(nonce.as_slice());
        sealed.extend_from_slice(&ciphertext);
        Ok(sealed)
    }

    /// Open one sealed record. Authentication failure means the stream is
    /// not trustworthy; the caller must treat it as fatal.
    pub fn open(&self, sealed: &[u8]) -> Result<Vec<u8>, RpcError> {
        if sealed.len() < NONCE_SZ {
            return Err(RpcError::Crypto(String::from(
                "sealed record shorter than its nonce",
            )));
        }
        let (nonce, ciphertext) = sealed.split_at(NONCE_SZ);
        self.aead
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| RpcError::Crypto(String::from("record authentication failed")))
    }
}
