//! Proof-of-work admission challenges.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::crypto::keys::PeerId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChallengeState {
    Issued,
    Verified,
    Expired,
    Failed,
}

impl ChallengeState {
    pub fn is_terminal(self) -> bool {
        self != ChallengeState::Issued
    }
}

/// Server-side record of a challenge. Never leaves the issuing node; peers
/// only ever see the [`ChallengeDescriptor`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Challenge {
    pub id: String,
    pub network_id: String,
    pub issuer: PeerId,
    pub target: PeerId,
    /// Hex string; its ASCII bytes are the hash prefix.
    pub prefix: String,
    pub difficulty: u32,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub state: ChallengeState,
    /// Recorded on verification so a replay can be recognised.
    pub solved_nonce: Option<Vec<u8>>,
    pub join_request_id: String,
}

impl Challenge {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    pub fn descriptor(&self) -> ChallengeDescriptor {
        ChallengeDescriptor {
            challenge_id: self.id.clone(),
            network_id: self.network_id.clone(),
            prefix: self.prefix.clone(),
            difficulty: self.difficulty,
            expires_at: self.expires_at,
        }
    }
}

/// What the joining peer needs to solve a challenge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChallengeDescriptor {
    pub challenge_id: String,
    pub network_id: String,
    pub prefix: String,
    pub difficulty: u32,
    pub expires_at: DateTime<Utc>,
}
