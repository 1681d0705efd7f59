//! Admission failures.
//!
//! The first three are the ones a joining peer sees most. None of them is
//! retried automatically: the peer has to ask for a fresh challenge.

use thiserror::Error;

use crate::crypto::keys::PeerId;
use crate::crypto::kms::KmsError;
use crate::crypto::pow::PowError;
use crate::registry::RegistryError;

#[derive(Debug, Error)]
pub enum AdmissionError {
    #[error("challenge has expired")]
    ExpiredChallenge,

    #[error("proof does not satisfy the challenge difficulty")]
    InvalidProof,

    #[error("challenge was already solved")]
    ReusedNonce,

    #[error("unknown challenge: {0}")]
    UnknownChallenge(String),

    #[error("no pending join request from {peer_id} in network {network_id}")]
    NoPendingJoinRequest { network_id: String, peer_id: PeerId },

    #[error("unknown join request: {0}")]
    UnknownJoinRequest(String),

    #[error("unknown or already used invite: {0}")]
    UnknownInvite(String),

    #[error("invite has expired")]
    ExpiredInvite,

    #[error("signature does not verify")]
    InvalidSignature,

    #[error("insufficient permission: {0}")]
    InsufficientPermission(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("remote node refused: {0}")]
    Remote(String),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Kms(#[from] KmsError),

    #[error(transparent)]
    Pow(#[from] PowError),
}
