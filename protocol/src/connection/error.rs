//! Connection-level failures.

use thiserror::Error;

use crate::crypto::kms::KmsError;
use crate::crypto::pow::PowError;
use crate::model::{PeerKey, TransportKind};
use crate::registry::RegistryError;
use crate::transport::TransportError;

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("handshake failed: {0}")]
    HandshakeFailed(String),

    #[error("{0} transport did not come up in time")]
    ConnectTimeout(TransportKind),

    #[error("no session with {0}")]
    Unreachable(PeerKey),

    #[error("request timed out")]
    Timeout,

    /// The peer answered, with an error.
    #[error("peer replied with an error: {0}")]
    Remote(String),

    #[error("{0} is not admitted to route")]
    NotAdmitted(PeerKey),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Kms(#[from] KmsError),

    #[error("challenge solving failed: {0}")]
    Pow(#[from] PowError),
}
