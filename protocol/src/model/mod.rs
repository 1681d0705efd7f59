//! # Data Model
//!
//! Plain data shared by every component. No behavior beyond small
//! predicates lives here; the state machines that move these records
//! around are owned by the registry, admission and connection modules.
//!
//! ```text
//! network.rs     Network overlays this node belongs to
//! peer.rs        PeerRecord, permission and connection states
//! challenge.rs   Proof-of-work admission challenges
//! join.rs        Join requests, invites and their signed wire forms
//! ```

pub mod challenge;
pub mod join;
pub mod network;
pub mod peer;

pub use challenge::{Challenge, ChallengeDescriptor, ChallengeState};
pub use join::{
    InviteBody, JoinKind, JoinRequest, JoinRequestBody, JoinState, PeerIntro, SignedInvite,
    SignedJoinRequest,
};
pub use network::{Network, NetworkDescriptor, NetworkRole, NetworkState};
pub use peer::{ConnectionState, PeerKey, PeerRecord, Permission, TransportKind};
