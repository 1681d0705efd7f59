//! Crate-level error for callers of the [`Gateway`](crate::gateway::Gateway)
//! facade. Every module error converts into it, and [`ErrorKind`] gives the
//! coarse class a management surface maps to a status code.

use serde::Serialize;
use thiserror::Error;

use crate::admission::AdmissionError;
use crate::config::ConfigError;
use crate::connection::ConnectionError;
use crate::crypto::kms::KmsError;
use crate::registry::RegistryError;
use crate::routing::RouteError;
use crate::storage::StoreError;
use crate::transport::TransportError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Challenge expired, invalid or reused; bad signatures; bad requests.
    Admission,
    Permission,
    Connection,
    Routing,
    NotFound,
    Configuration,
    Storage,
    Crypto,
}

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error(transparent)]
    Admission(#[from] AdmissionError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error(transparent)]
    Route(#[from] RouteError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Kms(#[from] KmsError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

fn registry_kind(e: &RegistryError) -> ErrorKind {
    match e {
        RegistryError::NetworkNotFound(_) | RegistryError::PeerNotFound(_) => ErrorKind::NotFound,
        RegistryError::InsufficientPermission(_) => ErrorKind::Permission,
        RegistryError::IdentityMismatch(_) | RegistryError::InvalidDifficulty(_) => {
            ErrorKind::Admission
        }
        RegistryError::Storage(_) => ErrorKind::Storage,
    }
}

impl GatewayError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Admission(e) => match e {
                AdmissionError::InsufficientPermission(_) => ErrorKind::Permission,
                AdmissionError::UnknownChallenge(_)
                | AdmissionError::UnknownJoinRequest(_)
                | AdmissionError::UnknownInvite(_) => ErrorKind::NotFound,
                AdmissionError::Remote(_) => ErrorKind::Connection,
                AdmissionError::Registry(inner) => registry_kind(inner),
                AdmissionError::Kms(_) => ErrorKind::Crypto,
                _ => ErrorKind::Admission,
            },
            Self::Registry(e) => registry_kind(e),
            Self::Connection(e) => match e {
                ConnectionError::NotAdmitted(_) => ErrorKind::Permission,
                ConnectionError::Registry(inner) => registry_kind(inner),
                ConnectionError::Kms(_) => ErrorKind::Crypto,
                _ => ErrorKind::Connection,
            },
            Self::Route(_) => ErrorKind::Routing,
            Self::Store(_) => ErrorKind::Storage,
            Self::Kms(_) => ErrorKind::Crypto,
            Self::Config(_) => ErrorKind::Configuration,
            Self::Transport(_) => ErrorKind::Connection,
        }
    }
}

pub type GatewayResult<T> = Result<T, GatewayError>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::keys::NodeKeypair;
    use crate::model::PeerKey;

    #[test]
    fn kinds_separate_what_callers_act_on() {
        let err: GatewayError = AdmissionError::ReusedNonce.into();
        assert_eq!(err.kind(), ErrorKind::Admission);

        let err: GatewayError =
            AdmissionError::Registry(RegistryError::NetworkNotFound("n".into())).into();
        assert_eq!(err.kind(), ErrorKind::NotFound);

        let key = PeerKey::new("n", NodeKeypair::generate().peer_id());
        let err: GatewayError = ConnectionError::NotAdmitted(key).into();
        assert_eq!(err.kind(), ErrorKind::Permission);

        let err: GatewayError = RouteError::DeadlineExceeded { attempts: 1 }.into();
        assert_eq!(err.kind(), ErrorKind::Routing);
    }
}
