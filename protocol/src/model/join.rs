//! # Join Requests & Invites
//!
//! Two ways into a network, one admission path:
//!
//! - A **join request** is sent by a peer that wants in. The admin node
//!   records it as a pending [`JoinRequest`] of kind `request`.
//! - An **invite** is sent by an admin to a peer it wants in. The invitee
//!   records the *inviter* as a pending [`JoinRequest`] of kind `invite` and
//!   answers with its own signed join request that references the invite.
//!
//! Either way, whoever is being admitted must solve a challenge bound to the
//! pending record before any permission goes above `pending`.
//!
//! The `*Body` structs are what gets signed (bincode, field order matters).
//! Timestamps inside them are Unix milliseconds so the canonical encoding
//! does not depend on a date formatter.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::network::NetworkDescriptor;
use super::peer::Permission;
use crate::crypto::keys::{PeerId, PublicKey, Signature};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JoinKind {
    Request,
    Invite,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JoinState {
    Pending,
    Accepted,
    Rejected,
    Expired,
}

/// Self-description a node attaches to anything it signs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerIntro {
    pub peer_id: PeerId,
    pub public_key: PublicKey,
    pub endpoint: String,
}

impl PeerIntro {
    /// The peer id must be the fingerprint of the presented key.
    pub fn is_consistent(&self) -> bool {
        self.peer_id.matches(&self.public_key)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinRequestBody {
    pub request_id: String,
    pub network_id: String,
    pub requester: PeerIntro,
    pub proposed_permission: Permission,
    pub invite_id: Option<String>,
    pub issued_at_ms: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedJoinRequest {
    pub body: JoinRequestBody,
    pub signature: Signature,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InviteBody {
    pub invite_id: String,
    pub network: NetworkDescriptor,
    pub inviter: PeerIntro,
    /// What the inviter is inside the network. The invitee admits the
    /// inviter at this level once the inviter solves its challenge.
    pub inviter_permission: Permission,
    /// What the invitee will become on the inviter's side.
    pub granted_permission: Permission,
    pub issued_at_ms: i64,
    pub expires_at_ms: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedInvite {
    pub body: InviteBody,
    pub signature: Signature,
}

/// A pending admission, as tracked by the admitting node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinRequest {
    pub id: String,
    pub kind: JoinKind,
    pub network_id: String,
    pub requester: PeerIntro,
    pub proposed_permission: Permission,
    /// Requester's signature over the originating body.
    pub signature: Signature,
    pub state: JoinState,
    pub invite_id: Option<String>,
    pub challenge_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl JoinRequest {
    pub fn is_pending(&self) -> bool {
        self.state == JoinState::Pending
    }
}
