// Copyright (c) 2026 ALAS Technology. MIT License.
// See LICENSE for details.

//! # DEDI Gateway Core Library
//!
//! A node that admits peers into private discovery networks behind a
//! proof-of-work gate, keeps sessions to them over WebSocket with an SSE
//! fallback, and proxies discovery requests to whichever peer has been
//! answering best.
//!
//! ## Architecture
//!
//! - **config**: tunables and protocol constants, loaded once.
//! - **crypto**: node keys, the KMS boundary and the PoW solver.
//! - **model**: networks, peers, challenges, join requests and invites.
//! - **storage**: persistence of networks and peer records (memory or sled).
//! - **cache**: TTL key/value cache used for route scores.
//! - **registry**: the network registry and the peer directory.
//! - **admission**: join requests, invites, challenges and proofs.
//! - **transport**: wire messages, the session handshake and connectors.
//! - **connection**: outbound sessions, heartbeats and reconnects.
//! - **routing**: route scoring and the proxy router.
//! - **gateway**: wires the above from one configuration.
//!
//! ## Ground rules
//!
//! 1. Nothing above `pending` without a verified proof.
//! 2. Every signed payload is bincode of its body struct; field order is
//!    part of the protocol.
//! 3. Routing never touches a peer that is not `member` or `admin`.

pub mod admission;
pub mod cache;
pub mod config;
pub mod connection;
pub mod crypto;
pub mod error;
pub mod gateway;
pub mod model;
pub mod registry;
pub mod routing;
pub mod storage;
pub mod transport;

pub use error::{ErrorKind, GatewayError, GatewayResult};
pub use gateway::{Gateway, GatewayBuilder, GatewayStatus, NodeInfo, PeerStatus};
