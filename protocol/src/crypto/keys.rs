//! # Node Identity Keys
//!
//! Ed25519 keypairs, public keys, signatures and the peer fingerprint derived
//! from a public key.
//!
//! Every gateway node owns exactly one identity keypair. Its public key is
//! what other nodes pin in their `PeerRecord`; its fingerprint is the peer id
//! that appears in every log line, URL and session handshake.
//!
//! ## Security considerations
//!
//! - Private keys are zeroized on drop (ed25519-dalek does this for us).
//! - Key generation uses `OsRng`.
//! - Key bytes are never logged. Only fingerprints are.

use ed25519_dalek::{Signature as DalekSignature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::config::{PEER_ID_LENGTH, PUBLIC_KEY_LENGTH, SIGNATURE_LENGTH};

/// Errors that can occur during key operations. Deliberately vague about
/// the failing bytes.
#[derive(Debug, Error)]
pub enum KeyError {
    #[error("invalid secret key bytes")]
    InvalidSecretKey,

    #[error("invalid public key bytes")]
    InvalidPublicKey,

    #[error("invalid peer id: {0}")]
    InvalidPeerId(String),
}

// ---------------------------------------------------------------------------
// Keypair
// ---------------------------------------------------------------------------

/// A node identity keypair.
///
/// Does NOT implement `Serialize`. Exporting a secret key is an explicit
/// call to [`to_hex`](Self::to_hex), never a side effect of shoving a struct
/// into a JSON response.
pub struct NodeKeypair {
    signing_key: SigningKey,
}

impl NodeKeypair {
    /// Generate a fresh keypair from the OS RNG.
    pub fn generate() -> Self {
        Self {
            signing_key: SigningKey::generate(&mut OsRng),
        }
    }

    /// Deterministic keypair from a 32-byte seed. Tests love this.
    pub fn from_seed(seed: &[u8; 32]) -> Self {
        Self {
            signing_key: SigningKey::from_bytes(seed),
        }
    }

    /// Load a keypair from a hex-encoded secret key, as written by
    /// `dedi-gateway init`.
    pub fn from_hex(hex_str: &str) -> Result<Self, KeyError> {
        let bytes = hex::decode(hex_str.trim()).map_err(|_| KeyError::InvalidSecretKey)?;
        let seed: [u8; 32] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| KeyError::InvalidSecretKey)?;
        Ok(Self::from_seed(&seed))
    }

    /// Hex-encoded secret key. Handle with care.
    pub fn to_hex(&self) -> String {
        hex::encode(self.signing_key.to_bytes())
    }

    /// Raw secret bytes, used only to derive the KMS symmetric key.
    pub(crate) fn secret_bytes(&self) -> [u8; 32] {
        self.signing_key.to_bytes()
    }

    pub fn public_key(&self) -> PublicKey {
        PublicKey {
            bytes: self.signing_key.verifying_key().to_bytes(),
        }
    }

    pub fn peer_id(&self) -> PeerId {
        PeerId::from_public_key(&self.public_key())
    }

    pub fn sign(&self, message: &[u8]) -> Signature {
        Signature {
            bytes: self.signing_key.sign(message).to_bytes().to_vec(),
        }
    }
}

impl fmt::Debug for NodeKeypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeKeypair")
            .field("peer_id", &self.peer_id())
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Public Key
// ---------------------------------------------------------------------------

/// The public half of a node identity. Serialized as 64 hex characters.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PublicKey {
    bytes: [u8; PUBLIC_KEY_LENGTH],
}

impl PublicKey {
    /// Wrap raw bytes, rejecting anything that is not a valid curve point.
    pub fn from_bytes(bytes: [u8; PUBLIC_KEY_LENGTH]) -> Result<Self, KeyError> {
        VerifyingKey::from_bytes(&bytes).map_err(|_| KeyError::InvalidPublicKey)?;
        Ok(Self { bytes })
    }

    pub fn from_hex(hex_str: &str) -> Result<Self, KeyError> {
        let bytes = hex::decode(hex_str).map_err(|_| KeyError::InvalidPublicKey)?;
        let arr: [u8; PUBLIC_KEY_LENGTH] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| KeyError::InvalidPublicKey)?;
        Self::from_bytes(arr)
    }

    pub fn as_bytes(&self) -> &[u8; PUBLIC_KEY_LENGTH] {
        &self.bytes
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.bytes)
    }

    /// Verify `signature` over `message`. Malformed signatures simply fail.
    pub fn verify(&self, message: &[u8], signature: &Signature) -> bool {
        let Ok(key) = VerifyingKey::from_bytes(&self.bytes) else {
            return false;
        };
        let Ok(sig_bytes) = <[u8; SIGNATURE_LENGTH]>::try_from(signature.bytes.as_slice()) else {
            return false;
        };
        key.verify(message, &DalekSignature::from_bytes(&sig_bytes))
            .is_ok()
    }
}

impl TryFrom<String> for PublicKey {
    type Error = KeyError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::from_hex(&value)
    }
}

impl From<PublicKey> for String {
    fn from(key: PublicKey) -> Self {
        key.to_hex()
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({})", &self.to_hex()[..16])
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

// ---------------------------------------------------------------------------
// Signature
// ---------------------------------------------------------------------------

/// An Ed25519 signature. Serialized as hex; always 64 bytes when produced
/// by us, but anything is accepted on the way in and fails verification
/// later if it is the wrong size.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Signature {
    bytes: Vec<u8>,
}

impl Signature {
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn to_hex(&self) -> String {
        hex::encode(&self.bytes)
    }
}

impl TryFrom<String> for Signature {
    type Error = hex::FromHexError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Ok(Self {
            bytes: hex::decode(value)?,
        })
    }
}

impl From<Signature> for String {
    fn from(sig: Signature) -> Self {
        sig.to_hex()
    }
}

impl fmt::Debug for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let hex = self.to_hex();
        write!(f, "Signature({}..)", &hex[..hex.len().min(16)])
    }
}

// ---------------------------------------------------------------------------
// Peer Id
// ---------------------------------------------------------------------------

/// Public-key fingerprint identifying a peer: the first
/// [`PEER_ID_LENGTH`] bytes of BLAKE3 over the raw public key, hex-encoded.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PeerId(String);

impl PeerId {
    pub fn from_public_key(key: &PublicKey) -> Self {
        let digest = blake3::hash(key.as_bytes());
        Self(hex::encode(&digest.as_bytes()[..PEER_ID_LENGTH]))
    }

    /// Parse a peer id received from the outside world.
    pub fn parse(value: &str) -> Result<Self, KeyError> {
        let valid = value.len() == PEER_ID_LENGTH * 2
            && value.bytes().all(|b| b.is_ascii_hexdigit() && !b.is_ascii_uppercase());
        if !valid {
            return Err(KeyError::InvalidPeerId(value.to_string()));
        }
        Ok(Self(value.to_string()))
    }

    /// True when this id is the fingerprint of `key`.
    pub fn matches(&self, key: &PublicKey) -> bool {
        *self == Self::from_public_key(key)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First eight characters, for log lines.
    pub fn short(&self) -> &str {
        &self.0[..8.min(self.0.len())]
    }
}

impl TryFrom<String> for PeerId {
    type Error = KeyError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<PeerId> for String {
    fn from(id: PeerId) -> Self {
        id.0
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({})", self.0)
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_and_verify() {
        let kp = NodeKeypair::generate();
        let sig = kp.sign(b"join network alpha");
        assert!(kp.public_key().verify(b"join network alpha", &sig));
        assert!(!kp.public_key().verify(b"join network beta", &sig));
    }

    #[test]
    fn verify_with_foreign_key_fails() {
        let alice = NodeKeypair::generate();
        let bob = NodeKeypair::generate();
        let sig = alice.sign(b"hello");
        assert!(!bob.public_key().verify(b"hello", &sig));
    }

    #[test]
    fn truncated_signature_fails_without_panicking() {
        let kp = NodeKeypair::generate();
        let sig = kp.sign(b"payload");
        let short = Signature::from_bytes(sig.as_bytes()[..10].to_vec());
        assert!(!kp.public_key().verify(b"payload", &short));
    }

    #[test]
    fn hex_roundtrip_preserves_identity() {
        let kp = NodeKeypair::generate();
        let restored = NodeKeypair::from_hex(&kp.to_hex()).unwrap();
        assert_eq!(kp.peer_id(), restored.peer_id());
    }

    #[test]
    fn from_hex_rejects_wrong_length() {
        assert!(NodeKeypair::from_hex("abcd").is_err());
        assert!(NodeKeypair::from_hex("zz").is_err());
    }

    #[test]
    fn peer_id_is_stable_fingerprint() {
        let kp = NodeKeypair::from_seed(&[7u8; 32]);
        let a = kp.peer_id();
        let b = PeerId::from_public_key(&kp.public_key());
        assert_eq!(a, b);
        assert_eq!(a.as_str().len(), PEER_ID_LENGTH * 2);
        assert!(a.matches(&kp.public_key()));
        assert!(!a.matches(&NodeKeypair::generate().public_key()));
    }

    #[test]
    fn peer_id_parse_validates_shape() {
        let id = NodeKeypair::generate().peer_id();
        assert_eq!(PeerId::parse(id.as_str()).unwrap(), id);
        assert!(PeerId::parse("not-a-peer").is_err());
        assert!(PeerId::parse(&id.as_str().to_uppercase()).is_err());
    }

    #[test]
    fn public_key_serializes_as_hex() {
        let kp = NodeKeypair::generate();
        let json = serde_json::to_string(&kp.public_key()).unwrap();
        assert_eq!(json, format!("\"{}\"", kp.public_key().to_hex()));
        let back: PublicKey = serde_json::from_str(&json).unwrap();
        assert_eq!(back, kp.public_key());
    }
}
