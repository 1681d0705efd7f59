//! # Session Handshake
//!
//! The first message on every session, in both directions, is a
//! [`HandshakeProof`]: a signed statement of who the sender is, which
//! network the session is for, and when it was made.
//!
//! ```text
//!   dialer                                   host
//!     | -- handshake(nonce=n1) -------------> |   verify signature, look up peer
//!     | <------------ challenge (pending only) |
//!     | -- challenge_response ---------------> |   SubmitProof
//!     | <---- handshake(responding_to=n1) ---- |   verify, bound to n1
//! ```
//!
//! The host's reply echoes the dialer's nonce in `responding_to`, so a
//! captured host handshake cannot be replayed into a different session.

use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

use crate::config::SESSION_PROTOCOL;
use crate::crypto::keys::{PublicKey, Signature};
use crate::crypto::kms::{self, Kms, KmsError};
use crate::model::PeerIntro;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HandshakeError {
    #[error("unsupported session protocol {0}")]
    ProtocolMismatch(String),

    #[error("peer id does not match the presented key")]
    IdentityMismatch,

    #[error("handshake bound to network {actual}, expected {expected}")]
    WrongNetwork { expected: String, actual: String },

    #[error("handshake signed by an unexpected key")]
    UnexpectedKey,

    #[error("handshake timestamp is {0} ms away from local time")]
    ClockSkew(i64),

    #[error("handshake is not a reply to this session")]
    Unbound,

    #[error("handshake signature does not verify")]
    BadSignature,
}

/// The signed part of a handshake. Field order is part of the wire format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeBody {
    pub protocol: String,
    pub network_id: String,
    pub peer: PeerIntro,
    pub timestamp_ms: i64,
    /// Fresh random value, hex.
    pub nonce: String,
    /// The nonce of the handshake this one answers. `None` on the opening
    /// handshake.
    pub responding_to: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeProof {
    pub body: HandshakeBody,
    pub signature: Signature,
}

/// What the verifier already knows about the other side.
#[derive(Debug, Clone, Copy, Default)]
pub struct Expectation<'a> {
    pub network_id: Option<&'a str>,
    pub public_key: Option<&'a PublicKey>,
    pub responding_to: Option<&'a str>,
}

impl HandshakeProof {
    /// Sign a handshake as this node.
    pub fn create(
        kms: &dyn Kms,
        network_id: &str,
        endpoint: &str,
        responding_to: Option<String>,
    ) -> Result<Self, KmsError> {
        let mut nonce = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut nonce);
        let public_key = kms.public_key();
        let body = HandshakeBody {
            protocol: SESSION_PROTOCOL.to_string(),
            network_id: network_id.to_string(),
            peer: PeerIntro {
                peer_id: kms.peer_id(),
                public_key,
                endpoint: endpoint.to_string(),
            },
            timestamp_ms: chrono::Utc::now().timestamp_millis(),
            nonce: hex::encode(nonce),
            responding_to,
        };
        let signature = kms::sign_payload(kms, &body)?;
        Ok(Self { body, signature })
    }

    /// Check everything a receiver can check on its own, then whatever
    /// `expect` pins down.
    pub fn verify(
        &self,
        kms: &dyn Kms,
        expect: &Expectation<'_>,
        max_skew: Duration,
    ) -> Result<(), HandshakeError> {
        let body = &self.body;
        if body.protocol != SESSION_PROTOCOL {
            return Err(HandshakeError::ProtocolMismatch(body.protocol.clone()));
        }
        if !body.peer.is_consistent() {
            return Err(HandshakeError::IdentityMismatch);
        }
        if let Some(expected) = expect.network_id {
            if body.network_id != expected {
                return Err(HandshakeError::WrongNetwork {
                    expected: expected.to_string(),
                    actual: body.network_id.clone(),
                });
            }
        }
        if let Some(key) = expect.public_key {
            if &body.peer.public_key != key {
                return Err(HandshakeError::UnexpectedKey);
            }
        }

        let skew = chrono::Utc::now().timestamp_millis() - body.timestamp_ms;
        if skew.unsigned_abs() > max_skew.as_millis() as u64 {
            return Err(HandshakeError::ClockSkew(skew));
        }

        if let Some(expected) = expect.responding_to {
            if body.responding_to.as_deref() != Some(expected) {
                return Err(HandshakeError::Unbound);
            }
        }

        if !kms::verify_payload(kms, body, &self.signature, &body.peer.public_key) {
            return Err(HandshakeError::BadSignature);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::kms::MemoryKms;

    const SKEW: Duration = Duration::from_secs(60);

    #[test]
    fn fresh_handshake_verifies() {
        let dialer = MemoryKms::generate();
        let host = MemoryKms::generate();
        let proof = HandshakeProof::create(&dialer, "net", "http://dialer", None).unwrap();

        proof
            .verify(&host, &Expectation::default(), SKEW)
            .unwrap();
        proof
            .verify(
                &host,
                &Expectation {
                    network_id: Some("net"),
                    public_key: Some(&dialer.public_key()),
                    responding_to: None,
                },
                SKEW,
            )
            .unwrap();
    }

    #[test]
    fn reply_must_echo_the_opening_nonce() {
        let dialer = MemoryKms::generate();
        let host = MemoryKms::generate();
        let opening = HandshakeProof::create(&dialer, "net", "d", None).unwrap();
        let reply =
            HandshakeProof::create(&host, "net", "h", Some(opening.body.nonce.clone())).unwrap();

        let bound = Expectation {
            responding_to: Some(&opening.body.nonce),
            ..Default::default()
        };
        reply.verify(&dialer, &bound, SKEW).unwrap();

        let other = HandshakeProof::create(&host, "net", "h", Some("00".into())).unwrap();
        assert_eq!(
            other.verify(&dialer, &bound, SKEW),
            Err(HandshakeError::Unbound)
        );
    }

    #[test]
    fn tampering_breaks_the_signature() {
        let dialer = MemoryKms::generate();
        let mut proof = HandshakeProof::create(&dialer, "net", "d", None).unwrap();
        proof.body.network_id = "other".into();
        assert_eq!(
            proof.verify(&dialer, &Expectation::default(), SKEW),
            Err(HandshakeError::BadSignature)
        );
    }

    #[test]
    fn pinned_key_and_network_are_enforced() {
        let dialer = MemoryKms::generate();
        let stranger = MemoryKms::generate();
        let proof = HandshakeProof::create(&dialer, "net", "d", None).unwrap();

        let wrong_key = stranger.public_key();
        assert_eq!(
            proof.verify(
                &dialer,
                &Expectation {
                    public_key: Some(&wrong_key),
                    ..Default::default()
                },
                SKEW
            ),
            Err(HandshakeError::UnexpectedKey)
        );
        assert!(matches!(
            proof.verify(
                &dialer,
                &Expectation {
                    network_id: Some("elsewhere"),
                    ..Default::default()
                },
                SKEW
            ),
            Err(HandshakeError::WrongNetwork { .. })
        ));
    }

    #[test]
    fn stale_handshakes_are_rejected() {
        let dialer = MemoryKms::generate();
        let mut proof = HandshakeProof::create(&dialer, "net", "d", None).unwrap();
        proof.body.timestamp_ms -= 10 * 60 * 1000;
        proof.signature = kms::sign_payload(&dialer, &proof.body).unwrap();
        assert!(matches!(
            proof.verify(&dialer, &Expectation::default(), SKEW),
            Err(HandshakeError::ClockSkew(_))
        ));
    }

    #[test]
    fn swapped_identity_is_rejected() {
        let dialer = MemoryKms::generate();
        let mut proof = HandshakeProof::create(&dialer, "net", "d", None).unwrap();
        proof.body.peer.peer_id = MemoryKms::generate().peer_id();
        assert_eq!(
            proof.verify(&dialer, &Expectation::default(), SKEW),
            Err(HandshakeError::IdentityMismatch)
        );
    }
}
