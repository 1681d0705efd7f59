//! # Key Management Boundary
//!
//! Everything in the gateway that needs the node's identity key goes through
//! the [`Kms`] trait: handshake proofs, signed invites and join requests,
//! sealing of cached material. The core never touches key bytes directly,
//! so a vault-backed implementation can slot in without changing callers.
//!
//! [`MemoryKms`] keeps the Ed25519 key in process memory and derives its
//! AES-256-GCM sealing key from it with BLAKE3 `derive_key`.
//!
//! Signed payloads are encoded with bincode before signing. Field order in
//! the signed structs is therefore part of the wire contract.

use serde::Serialize;
use std::path::PathBuf;
use thiserror::Error;

use super::encryption::{self, EncryptionError};
use super::keys::{KeyError, NodeKeypair, PeerId, PublicKey, Signature};
use crate::config::{KmsBackend, KMS_ENCRYPTION_CONTEXT};

#[derive(Debug, Error)]
pub enum KmsError {
    #[error("invalid key material: {0}")]
    InvalidKey(#[from] KeyError),

    #[error("failed to read key file {path}: {source}")]
    KeyFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("sealing error: {0}")]
    Encryption(#[from] EncryptionError),

    #[error("payload encoding failed: {0}")]
    Encoding(String),
}

/// Signing, verification and sealing with the node identity.
pub trait Kms: Send + Sync {
    /// Public half of the node identity.
    fn public_key(&self) -> PublicKey;

    /// Our peer id, the fingerprint of [`public_key`](Self::public_key).
    fn peer_id(&self) -> PeerId {
        PeerId::from_public_key(&self.public_key())
    }

    fn sign(&self, data: &[u8]) -> Result<Signature, KmsError>;

    /// Check a signature made by any key, not just ours.
    fn verify_signature(&self, data: &[u8], signature: &Signature, public_key: &PublicKey)
        -> bool;

    fn encrypt(&self, data: &[u8]) -> Result<Vec<u8>, KmsError>;

    fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, KmsError>;
}

/// Canonical byte encoding for signed payloads.
pub fn canonical_bytes<T: Serialize>(payload: &T) -> Result<Vec<u8>, KmsError> {
    bincode::serialize(payload).map_err(|e| KmsError::Encoding(e.to_string()))
}

/// Sign the canonical encoding of `payload`.
pub fn sign_payload<T: Serialize>(kms: &dyn Kms, payload: &T) -> Result<Signature, KmsError> {
    kms.sign(&canonical_bytes(payload)?)
}

/// Verify a signature over the canonical encoding of `payload`.
pub fn verify_payload<T: Serialize>(
    kms: &dyn Kms,
    payload: &T,
    signature: &Signature,
    public_key: &PublicKey,
) -> bool {
    match canonical_bytes(payload) {
        Ok(bytes) => kms.verify_signature(&bytes, signature, public_key),
        Err(_) => false,
    }
}

// ---------------------------------------------------------------------------
// In-memory backend
// ---------------------------------------------------------------------------

/// Process-local KMS.
pub struct MemoryKms {
    keypair: NodeKeypair,
    sealing_key: [u8; 32],
}

impl MemoryKms {
    pub fn new(keypair: NodeKeypair) -> Self {
        let sealing_key = encryption::derive_key(KMS_ENCRYPTION_CONTEXT, &keypair.secret_bytes());
        Self {
            keypair,
            sealing_key,
        }
    }

    /// Fresh random identity.
    pub fn generate() -> Self {
        Self::new(NodeKeypair::generate())
    }

    /// Build from the configured backend. Invalid key material is an error
    /// the caller should treat as fatal.
    pub fn from_backend(backend: &KmsBackend) -> Result<Self, KmsError> {
        match backend {
            KmsBackend::Memory {
                secret_key_hex: None,
            } => Ok(Self::generate()),
            KmsBackend::Memory {
                secret_key_hex: Some(hex),
            } => Ok(Self::new(NodeKeypair::from_hex(hex)?)),
            KmsBackend::KeyFile { path } => {
                let contents =
                    std::fs::read_to_string(path).map_err(|source| KmsError::KeyFile {
                        path: path.clone(),
                        source,
                    })?;
                Ok(Self::new(NodeKeypair::from_hex(&contents)?))
            }
        }
    }
}

impl Kms for MemoryKms {
    fn public_key(&self) -> PublicKey {
        self.keypair.public_key()
    }

    fn sign(&self, data: &[u8]) -> Result<Signature, KmsError> {
        Ok(self.keypair.sign(data))
    }

    fn verify_signature(
        &self,
        data: &[u8],
        signature: &Signature,
        public_key: &PublicKey,
    ) -> bool {
        public_key.verify(data, signature)
    }

    fn encrypt(&self, data: &[u8]) -> Result<Vec<u8>, KmsError> {
        Ok(encryption::seal(&self.sealing_key, data)?)
    }

    fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, KmsError> {
        Ok(encryption::open(&self.sealing_key, ciphertext)?)
    }
}

impl std::fmt::Debug for MemoryKms {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryKms")
            .field("peer_id", &self.peer_id())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Serialize;
    use std::io::Write;

    #[derive(Serialize)]
    struct Hello<'a> {
        network: &'a str,
        counter: u64,
    }

    #[test]
    fn payload_signatures_verify_against_signer_key() {
        let kms = MemoryKms::generate();
        let other = MemoryKms::generate();
        let payload = Hello {
            network: "alpha",
            counter: 3,
        };
        let sig = sign_payload(&kms, &payload).unwrap();

        assert!(verify_payload(&other, &payload, &sig, &kms.public_key()));
        assert!(!verify_payload(&other, &payload, &sig, &other.public_key()));

        let tampered = Hello {
            network: "alpha",
            counter: 4,
        };
        assert!(!verify_payload(&other, &tampered, &sig, &kms.public_key()));
    }

    #[test]
    fn encrypt_decrypt_roundtrip() {
        let kms = MemoryKms::generate();
        let sealed = kms.encrypt(b"session bookkeeping").unwrap();
        assert_eq!(kms.decrypt(&sealed).unwrap(), b"session bookkeeping");
        assert!(MemoryKms::generate().decrypt(&sealed).is_err());
    }

    #[test]
    fn backend_with_explicit_key_is_deterministic() {
        let hex = NodeKeypair::from_seed(&[9u8; 32]).to_hex();
        let backend = KmsBackend::Memory {
            secret_key_hex: Some(hex.clone()),
        };
        let a = MemoryKms::from_backend(&backend).unwrap();
        let b = MemoryKms::from_backend(&backend).unwrap();
        assert_eq!(a.peer_id(), b.peer_id());
    }

    #[test]
    fn invalid_key_material_is_an_error() {
        let backend = KmsBackend::Memory {
            secret_key_hex: Some("not hex".into()),
        };
        assert!(matches!(
            MemoryKms::from_backend(&backend),
            Err(KmsError::InvalidKey(_))
        ));
    }

    #[test]
    fn key_file_backend() {
        let keypair = NodeKeypair::generate();
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "{}", keypair.to_hex()).unwrap();

        let kms = MemoryKms::from_backend(&KmsBackend::KeyFile {
            path: file.path().to_path_buf(),
        })
        .unwrap();
        assert_eq!(kms.peer_id(), keypair.peer_id());

        let missing = KmsBackend::KeyFile {
            path: PathBuf::from("/definitely/not/here.key"),
        };
        assert!(matches!(
            MemoryKms::from_backend(&missing),
            Err(KmsError::KeyFile { .. })
        ));
    }
}
