//! # Membership Registry
//!
//! The single owner of shared membership state. Every other component reads
//! and writes networks and peers through the accessors here; nobody else
//! holds a reference to the maps.
//!
//! ```text
//! networks.rs    NetworkRegistry: the overlays this node belongs to
//! directory.rs   PeerDirectory: per-network peer records
//! ```
//!
//! ## Locking
//!
//! - Networks sit behind one `parking_lot::RwLock`. They change rarely.
//! - Peers sit in a `DashMap` keyed by `(network, peer)`. Every mutation goes
//!   through the map's entry API, so writes to one pair are serialized while
//!   different pairs proceed in parallel.
//! - Durable columns (permission, endpoint) are written through to the
//!   [`Store`](crate::storage::Store) while the entry lock is held.
//!   Connection state and score are runtime-only and reset on load.

pub mod directory;
pub mod networks;

use crate::model::PeerKey;
use crate::storage::StoreError;

pub use directory::{AdmissionGrant, PeerDirectory};
pub use networks::{NetworkRegistry, NewNetwork};

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("network not found: {0}")]
    NetworkNotFound(String),

    #[error("peer not found: {0}")]
    PeerNotFound(PeerKey),

    #[error("insufficient permission: {0}")]
    InsufficientPermission(String),

    #[error("peer identity mismatch: {0}")]
    IdentityMismatch(String),

    #[error("difficulty {0} is out of range")]
    InvalidDifficulty(u32),

    #[error("storage error: {0}")]
    Storage(#[from] StoreError),
}
