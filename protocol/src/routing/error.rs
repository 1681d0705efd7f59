//! Routing failures surfaced to `ProxyRequest` callers.

use serde::Serialize;
use thiserror::Error;

/// Coarse classification callers use to decide whether to retry elsewhere.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RouteFailure {
    /// Nothing to try: no connected candidate in the network.
    NoRoute,
    /// Candidates were tried and none produced an answer.
    RemoteFailure,
    /// The caller's deadline passed first.
    Timeout,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RouteError {
    #[error("no route available in network {network_id}")]
    NoRouteAvailable { network_id: String },

    #[error("all {attempts} candidate(s) failed; last error: {last_error}")]
    AllCandidatesFailed { attempts: u32, last_error: String },

    #[error("deadline exceeded after {attempts} attempt(s)")]
    DeadlineExceeded { attempts: u32 },
}

impl RouteError {
    pub fn kind(&self) -> RouteFailure {
        match self {
            Self::NoRouteAvailable { .. } => RouteFailure::NoRoute,
            Self::AllCandidatesFailed { .. } => RouteFailure::RemoteFailure,
            Self::DeadlineExceeded { .. } => RouteFailure::Timeout,
        }
    }
}
