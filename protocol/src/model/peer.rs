//! # Peer Records
//!
//! A [`PeerRecord`] is everything this node knows about one peer inside one
//! network. The same remote node appearing in two networks has two records,
//! keyed by [`PeerKey`].
//!
//! Three components write to a record and each owns exactly one column:
//!
//! | Column       | Owner              |
//! |--------------|--------------------|
//! | `permission` | AdmissionController (upward), anyone (downward) |
//! | `connection` | ConnectionManager  |
//! | `score`      | RouteScorer        |

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::config::NEUTRAL_SCORE;
use crate::crypto::keys::{PeerId, PublicKey};

/// Permission ladder. Declaration order is the ordering: `Revoked` is the
/// floor and `Admin` the ceiling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Permission {
    Revoked,
    Pending,
    Member,
    Admin,
}

impl Permission {
    /// Peers at or above `member` take part in routing.
    pub fn is_routable(self) -> bool {
        self >= Permission::Member
    }
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Revoked => "revoked",
            Self::Pending => "pending",
            Self::Member => "member",
            Self::Admin => "admin",
        };
        f.write_str(s)
    }
}

/// Which transport carries a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    /// Persistent bidirectional WebSocket.
    Primary,
    /// Server-sent events plus a POST request channel.
    Fallback,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Primary => f.write_str("primary"),
            Self::Fallback => f.write_str("fallback"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    ConnectedPrimary,
    ConnectedFallback,
    /// Reconnects exhausted. Cleared only by re-admission or an explicit
    /// reset.
    Failed,
}

impl ConnectionState {
    pub fn connected(transport: TransportKind) -> Self {
        match transport {
            TransportKind::Primary => Self::ConnectedPrimary,
            TransportKind::Fallback => Self::ConnectedFallback,
        }
    }

    pub fn is_connected(self) -> bool {
        matches!(self, Self::ConnectedPrimary | Self::ConnectedFallback)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::ConnectedPrimary => "connected_primary",
            Self::ConnectedFallback => "connected_fallback",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Identity of a record: one peer inside one network.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerKey {
    pub network_id: String,
    pub peer_id: PeerId,
}

impl PeerKey {
    pub fn new(network_id: impl Into<String>, peer_id: PeerId) -> Self {
        Self {
            network_id: network_id.into(),
            peer_id,
        }
    }
}

impl fmt::Display for PeerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.network_id, self.peer_id.short())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerRecord {
    pub peer_id: PeerId,
    pub network_id: String,
    /// Base URL of the peer's service endpoints.
    pub endpoint: String,
    pub public_key: PublicKey,
    pub permission: Permission,
    pub connection: ConnectionState,
    /// Route score in `[SCORE_MIN, SCORE_MAX]`.
    pub score: f64,
    pub last_seen: Option<DateTime<Utc>>,
}

impl PeerRecord {
    /// A freshly discovered peer: pending, disconnected, neutral score.
    pub fn new(
        network_id: impl Into<String>,
        public_key: PublicKey,
        endpoint: impl Into<String>,
    ) -> Self {
        Self {
            peer_id: PeerId::from_public_key(&public_key),
            network_id: network_id.into(),
            endpoint: endpoint.into(),
            public_key,
            permission: Permission::Pending,
            connection: ConnectionState::Disconnected,
            score: NEUTRAL_SCORE,
            last_seen: None,
        }
    }

    pub fn key(&self) -> PeerKey {
        PeerKey::new(self.network_id.clone(), self.peer_id.clone())
    }

    /// Eligible as a routing candidate.
    pub fn is_connectable(&self) -> bool {
        self.permission.is_routable() && self.connection != ConnectionState::Failed
    }
}
