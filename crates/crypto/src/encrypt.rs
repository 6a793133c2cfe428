//! Build-record sealing and layering
//!
//! Each build record slot is sealed to its hop with ECIES: a fresh X25519
//! ephemeral key, a SHA-256 derived symmetric key, and ChaCha20-Poly1305.
//! The creator additionally wraps deeper slots with each earlier hop's
//! symmetric layer transform (plain ChaCha20, keyed by that hop's reply
//! key, nonce bound to the target slot index). The transform is its own
//! inverse, so the same call both adds and peels a layer.

use chacha20::cipher::{KeyIvInit, StreamCipher};
use chacha20::ChaCha20;
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Nonce};
use thiserror::Error;

use crate::keys::{derive_key, hash, EncryptionKeypair};

/// Bytes a sealed request record adds on top of its plaintext:
/// ephemeral pubkey (32) + AEAD tag (16)
pub const RECORD_SEAL_OVERHEAD: usize = 48;

/// Bytes a sealed reply record adds on top of its plaintext: AEAD tag (16)
pub const REPLY_SEAL_OVERHEAD: usize = 16;

/// Nonce domain for request records
const DOMAIN_REQUEST: u8 = 0;
/// Nonce domain for reply records
const DOMAIN_REPLY: u8 = 1;
/// Nonce domain for router garlic envelopes
const DOMAIN_GARLIC: u8 = 2;

#[derive(Error, Debug)]
pub enum EncryptError {
    #[error("Encryption failed")]
    EncryptionFailed,
    #[error("Decryption failed")]
    DecryptionFailed,
    #[error("Invalid key")]
    InvalidKey,
    #[error("Ciphertext too short")]
    CiphertextTooShort,
}

fn aead_nonce(slot: u8, domain: u8) -> [u8; 12] {
    let mut nonce = [0u8; 12];
    nonce[0] = slot;
    nonce[11] = domain;
    nonce
}

fn layer_nonce(slot: u8) -> [u8; 12] {
    let mut nonce = [0u8; 12];
    nonce[0] = slot;
    nonce
}

/// Seal a build request record to a hop's static key.
///
/// Output layout: `ephemeral_pubkey(32) || ciphertext || tag(16)`.
pub fn seal_record(
    recipient_pubkey: &[u8; 32],
    slot: u8,
    plaintext: &[u8],
) -> Result<Vec<u8>, EncryptError> {
    let ephemeral = EncryptionKeypair::generate();
    let shared = ephemeral.diffie_hellman(recipient_pubkey);
    let key = hash(&shared);

    let cipher = ChaCha20Poly1305::new_from_slice(&key).map_err(|_| EncryptError::InvalidKey)?;
    let ciphertext = cipher
        .encrypt(
            Nonce::from_slice(&aead_nonce(slot, DOMAIN_REQUEST)),
            plaintext,
        )
        .map_err(|_| EncryptError::EncryptionFailed)?;

    let mut out = Vec::with_capacity(32 + ciphertext.len());
    out.extend_from_slice(&ephemeral.public_key_bytes());
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Open a build request record with the hop's static secret
pub fn open_record(
    our_secret: &[u8; 32],
    slot: u8,
    record: &[u8],
) -> Result<Vec<u8>, EncryptError> {
    if record.len() < RECORD_SEAL_OVERHEAD {
        return Err(EncryptError::CiphertextTooShort);
    }
    let ephemeral_pubkey: [u8; 32] = record[..32]
        .try_into()
        .map_err(|_| EncryptError::InvalidKey)?;

    let ours = EncryptionKeypair::from_secret_bytes(our_secret);
    let shared = ours.diffie_hellman(&ephemeral_pubkey);
    let key = hash(&shared);

    let cipher = ChaCha20Poly1305::new_from_slice(&key).map_err(|_| EncryptError::InvalidKey)?;
    cipher
        .decrypt(
            Nonce::from_slice(&aead_nonce(slot, DOMAIN_REQUEST)),
            &record[32..],
        )
        .map_err(|_| EncryptError::DecryptionFailed)
}

/// Seal a build reply record with the reply key carried in the request
pub fn seal_reply(
    reply_key: &[u8; 32],
    slot: u8,
    plaintext: &[u8],
) -> Result<Vec<u8>, EncryptError> {
    let cipher =
        ChaCha20Poly1305::new_from_slice(reply_key).map_err(|_| EncryptError::InvalidKey)?;
    cipher
        .encrypt(
            Nonce::from_slice(&aead_nonce(slot, DOMAIN_REPLY)),
            plaintext,
        )
        .map_err(|_| EncryptError::EncryptionFailed)
}

/// Open a build reply record; MAC failure means the slot was not produced
/// by the hop holding this reply key.
pub fn open_reply(
    reply_key: &[u8; 32],
    slot: u8,
    record: &[u8],
) -> Result<Vec<u8>, EncryptError> {
    if record.len() < REPLY_SEAL_OVERHEAD {
        return Err(EncryptError::CiphertextTooShort);
    }
    let cipher =
        ChaCha20Poly1305::new_from_slice(reply_key).map_err(|_| EncryptError::InvalidKey)?;
    cipher
        .decrypt(Nonce::from_slice(&aead_nonce(slot, DOMAIN_REPLY)), record)
        .map_err(|_| EncryptError::DecryptionFailed)
}

/// Apply a hop's symmetric layer transform to the record in `slot_bytes`
/// occupying slot `slot`. Applying the same transform twice is the
/// identity.
pub fn record_layer_transform(reply_key: &[u8; 32], slot: u8, slot_bytes: &mut [u8]) {
    let mut cipher = ChaCha20::new(reply_key.into(), (&layer_nonce(slot)).into());
    cipher.apply_keystream(slot_bytes);
}

/// Wrap a payload in an ECIES envelope addressed to a router's static key
/// (used to hide a build request from the outbound endpoint when it is not
/// the first hop).
pub fn wrap_for_router(
    recipient_pubkey: &[u8; 32],
    plaintext: &[u8],
) -> Result<Vec<u8>, EncryptError> {
    let ephemeral = EncryptionKeypair::generate();
    let shared = ephemeral.diffie_hellman(recipient_pubkey);
    let key = hash(&shared);

    let cipher = ChaCha20Poly1305::new_from_slice(&key).map_err(|_| EncryptError::InvalidKey)?;
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&aead_nonce(0, DOMAIN_GARLIC)), plaintext)
        .map_err(|_| EncryptError::EncryptionFailed)?;

    let mut out = Vec::with_capacity(32 + ciphertext.len());
    out.extend_from_slice(&ephemeral.public_key_bytes());
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Unwrap a router-addressed ECIES envelope
pub fn unwrap_from_router(our_secret: &[u8; 32], data: &[u8]) -> Result<Vec<u8>, EncryptError> {
    if data.len() < RECORD_SEAL_OVERHEAD {
        return Err(EncryptError::CiphertextTooShort);
    }
    let ephemeral_pubkey: [u8; 32] = data[..32].try_into().map_err(|_| EncryptError::InvalidKey)?;
    let ours = EncryptionKeypair::from_secret_bytes(our_secret);
    let key = hash(&ours.diffie_hellman(&ephemeral_pubkey));

    let cipher = ChaCha20Poly1305::new_from_slice(&key).map_err(|_| EncryptError::InvalidKey)?;
    cipher
        .decrypt(Nonce::from_slice(&aead_nonce(0, DOMAIN_GARLIC)), &data[32..])
        .map_err(|_| EncryptError::DecryptionFailed)
}

/// Derive the garlic reply key for a hop's reply key
pub fn garlic_key(reply_key: &[u8; 32]) -> [u8; 32] {
    derive_key(reply_key, b"garlic-key")
}

/// Derive the garlic reply tag for a hop's reply key
pub fn garlic_tag(reply_key: &[u8; 32]) -> u64 {
    let derived = derive_key(reply_key, b"garlic-tag");
    u64::from_be_bytes(derived[..8].try_into().expect("8-byte prefix"))
}
