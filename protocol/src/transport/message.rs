//! # Session Messages
//!
//! Everything exchanged over a peer session, on either transport, is a
//! [`PeerMessage`] encoded as JSON:
//!
//! ```json
//! { "type": "data", "body": { "id": 7, "reply_to": null, "body": { "kind": "request", ... } } }
//! ```
//!
//! | Type                 | Direction        | Purpose                              |
//! |----------------------|------------------|--------------------------------------|
//! | `handshake`          | both             | Signed identity proof                |
//! | `challenge`          | host -> dialer   | Admission puzzle for a pending peer  |
//! | `challenge_response` | dialer -> host   | Nonce solving the puzzle             |
//! | `data`               | both             | Proxied requests and their replies   |
//! | `heartbeat`          | both             | Ping/pong liveness                   |

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

use super::handshake::HandshakeProof;
use crate::model::ChallengeDescriptor;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "body", rename_all = "snake_case")]
pub enum PeerMessage {
    Handshake(HandshakeProof),
    Challenge(ChallengeDescriptor),
    ChallengeResponse(ChallengeAnswer),
    Data(DataFrame),
    Heartbeat(Heartbeat),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Handshake,
    Challenge,
    ChallengeResponse,
    Data,
    Heartbeat,
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Handshake => "handshake",
            Self::Challenge => "challenge",
            Self::ChallengeResponse => "challenge_response",
            Self::Data => "data",
            Self::Heartbeat => "heartbeat",
        };
        f.write_str(s)
    }
}

impl PeerMessage {
    pub fn kind(&self) -> MessageKind {
        match self {
            Self::Handshake(_) => MessageKind::Handshake,
            Self::Challenge(_) => MessageKind::Challenge,
            Self::ChallengeResponse(_) => MessageKind::ChallengeResponse,
            Self::Data(_) => MessageKind::Data,
            Self::Heartbeat(_) => MessageKind::Heartbeat,
        }
    }

    pub fn ping() -> Self {
        Self::Heartbeat(Heartbeat::new(HeartbeatKind::Ping))
    }

    pub fn pong() -> Self {
        Self::Heartbeat(Heartbeat::new(HeartbeatKind::Pong))
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

/// Solution to a [`ChallengeDescriptor`]. The nonce is hex-encoded bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChallengeAnswer {
    pub challenge_id: String,
    pub nonce: String,
}

/// A framed data exchange. Requests carry a fresh `id`; replies point back
/// at it through `reply_to`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataFrame {
    pub id: u64,
    pub reply_to: Option<u64>,
    pub body: DataBody,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DataBody {
    Request(DataRequest),
    Response { payload: Value },
    Error { message: String },
}

/// A discovery request addressed to a network.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataRequest {
    pub network_id: String,
    pub address: String,
    #[serde(default)]
    pub payload: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HeartbeatKind {
    Ping,
    Pong,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Heartbeat {
    pub kind: HeartbeatKind,
    pub sent_at_ms: i64,
}

impl Heartbeat {
    pub fn new(kind: HeartbeatKind) -> Self {
        Self {
            kind,
            sent_at_ms: chrono::Utc::now().timestamp_millis(),
        }
    }
}
