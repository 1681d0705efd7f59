//! # Persistence Boundary
//!
//! Durable storage for [`Network`] and [`PeerRecord`] entities. The registry
//! is the only caller; it keeps the authoritative in-memory view and writes
//! through to a [`Store`] on every mutation.
//!
//! ```text
//! memory.rs  HashMap-backed store, forgets everything on restart
//! db.rs      sled-backed store, one tree per entity
//! ```
//!
//! The trait is synchronous. Both bundled backends complete in microseconds,
//! and keeping it sync lets the registry write through while it still holds
//! the per-peer entry lock.

pub mod db;
pub mod memory;

use std::sync::Arc;

use crate::config::StorageBackend;
use crate::model::{Network, PeerKey, PeerRecord};

pub use db::SledStore;
pub use memory::MemoryStore;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("sled error: {0}")]
    Sled(#[from] sled::Error),

    #[error("serialization error: {0}")]
    Serialization(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Create/read/update/list for networks and peers. `put_*` is an upsert.
pub trait Store: Send + Sync {
    fn put_network(&self, network: &Network) -> StoreResult<()>;

    fn get_network(&self, id: &str) -> StoreResult<Option<Network>>;

    fn list_networks(&self) -> StoreResult<Vec<Network>>;

    fn put_peer(&self, peer: &PeerRecord) -> StoreResult<()>;

    fn get_peer(&self, key: &PeerKey) -> StoreResult<Option<PeerRecord>>;

    /// Peers of one network, in peer id order.
    fn list_peers(&self, network_id: &str) -> StoreResult<Vec<PeerRecord>>;

    /// Every peer of every network. Used once, when the registry loads.
    fn list_all_peers(&self) -> StoreResult<Vec<PeerRecord>>;
}

/// Open the configured backend. Failure here is fatal for the process.
pub fn open_store(backend: &StorageBackend) -> StoreResult<Arc<dyn Store>> {
    match backend {
        StorageBackend::Memory => Ok(Arc::new(MemoryStore::new())),
        StorageBackend::Sled { path } => Ok(Arc::new(SledStore::open(path)?)),
    }
}
