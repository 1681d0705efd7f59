//! # AES-256-GCM Sealing
//!
//! Authenticated encryption behind the KMS `encrypt`/`decrypt` operations.
//! The gateway uses it to seal small payloads at rest (cached session
//! bookkeeping, exported secrets); nothing here is on the hot path.
//!
//! ## Wire format
//!
//! `seal()` returns `nonce || ciphertext` as a single buffer. The first 12
//! bytes are a random 96-bit nonce, the rest is the ciphertext with the
//! 16-byte GCM tag appended. `open()` expects exactly that layout.

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use rand::RngCore;
use thiserror::Error;

use crate::config::{AES_KEY_LENGTH, AES_NONCE_LENGTH};

/// Kept vague on purpose: "wrong key" and "tampered ciphertext" look the
/// same from the outside.
#[derive(Debug, Error)]
pub enum EncryptionError {
    #[error("encryption failed")]
    EncryptFailed,

    #[error("decryption failed -- wrong key or corrupted ciphertext")]
    DecryptFailed,

    #[error("ciphertext too short: must be at least {AES_NONCE_LENGTH} bytes")]
    CiphertextTooShort,
}

/// Derive a 256-bit sealing key from secret material and a context string.
pub fn derive_key(context: &str, material: &[u8]) -> [u8; AES_KEY_LENGTH] {
    blake3::derive_key(context, material)
}

/// Encrypt `plaintext` under `key` with a fresh random nonce.
pub fn seal(key: &[u8; AES_KEY_LENGTH], plaintext: &[u8]) -> Result<Vec<u8>, EncryptionError> {
    let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| EncryptionError::EncryptFailed)?;

    let mut nonce_bytes = [0u8; AES_NONCE_LENGTH];
    rand::rngs::OsRng.fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(nonce, plaintext)
        .map_err(|_| EncryptionError::EncryptFailed)?;

    let mut out = Vec::with_capacity(AES_NONCE_LENGTH + ciphertext.len());
    out.extend_from_slice(&nonce_bytes);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Decrypt a buffer produced by [`seal`].
pub fn open(key: &[u8; AES_KEY_LENGTH], data: &[u8]) -> Result<Vec<u8>, EncryptionError> {
    if data.len() < AES_NONCE_LENGTH {
        return Err(EncryptionError::CiphertextTooShort);
    }

    let (nonce_bytes, ciphertext) = data.split_at(AES_NONCE_LENGTH);
    let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| EncryptionError::DecryptFailed)?;

    cipher
        .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
        .map_err(|_| EncryptionError::DecryptFailed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seal_then_open() {
        let key = derive_key("test context", b"secret");
        let sealed = seal(&key, b"route table snapshot").unwrap();
        assert_eq!(open(&key, &sealed).unwrap(), b"route table snapshot");
    }

    #[test]
    fn nonces_are_fresh() {
        let key = [0x42u8; 32];
        let a = seal(&key, b"same").unwrap();
        let b = seal(&key, b"same").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn tampering_is_detected() {
        let key = [0x42u8; 32];
        let mut sealed = seal(&key, b"payload").unwrap();
        let last = sealed.len() - 1;
        sealed[last] ^= 0x01;
        assert!(matches!(
            open(&key, &sealed),
            Err(EncryptionError::DecryptFailed)
        ));
    }

    #[test]
    fn wrong_key_fails() {
        let sealed = seal(&[1u8; 32], b"payload").unwrap();
        assert!(open(&[2u8; 32], &sealed).is_err());
    }

    #[test]
    fn short_input_is_rejected() {
        assert!(matches!(
            open(&[0u8; 32], &[0u8; 4]),
            Err(EncryptionError::CiphertextTooShort)
        ));
    }

    #[test]
    fn derived_keys_are_context_separated() {
        assert_ne!(derive_key("a", b"m"), derive_key("b", b"m"));
    }
}
