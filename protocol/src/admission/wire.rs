//! JSON bodies exchanged on the admission service endpoints.

use serde::{Deserialize, Serialize};

use crate::crypto::keys::PeerId;
use crate::model::{ChallengeDescriptor, Permission, SignedInvite, SignedJoinRequest};

/// Answer to a join request: the challenge the requester must solve, and
/// an invite so the requester can record the admin as a peer it will
/// challenge in turn.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinReply {
    pub challenge: ChallengeDescriptor,
    pub counter_invite: SignedInvite,
}

/// Answer to an invite: the invitee's join request redeeming it, and the
/// challenge the inviter must solve before the invitee admits it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InviteReply {
    pub join_request: SignedJoinRequest,
    pub challenge: ChallengeDescriptor,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProofSubmission {
    pub challenge_id: String,
    /// Hex of the nonce bytes.
    pub nonce: String,
}

/// What the admitting node recorded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProofReceipt {
    pub network_id: String,
    pub peer_id: PeerId,
    pub permission: Permission,
}
