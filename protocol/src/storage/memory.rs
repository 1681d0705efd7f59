//! In-memory [`Store`].

use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};

use super::{Store, StoreResult};
use crate::model::{Network, PeerKey, PeerRecord};

#[derive(Debug, Default)]
pub struct MemoryStore {
    networks: RwLock<HashMap<String, Network>>,
    peers: RwLock<BTreeMap<PeerKey, PeerRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Store for MemoryStore {
    fn put_network(&self, network: &Network) -> StoreResult<()> {
        self.networks
            .write()
            .insert(network.id.clone(), network.clone());
        Ok(())
    }

    fn get_network(&self, id: &str) -> StoreResult<Option<Network>> {
        Ok(self.networks.read().get(id).cloned())
    }

    fn list_networks(&self) -> StoreResult<Vec<Network>> {
        Ok(self.networks.read().values().cloned().collect())
    }

    fn put_peer(&self, peer: &PeerRecord) -> StoreResult<()> {
        self.peers.write().insert(peer.key(), peer.clone());
        Ok(())
    }

    fn get_peer(&self, key: &PeerKey) -> StoreResult<Option<PeerRecord>> {
        Ok(self.peers.read().get(key).cloned())
    }

    fn list_peers(&self, network_id: &str) -> StoreResult<Vec<PeerRecord>> {
        Ok(self
            .peers
            .read()
            .values()
            .filter(|p| p.network_id == network_id)
            .cloned()
            .collect())
    }

    fn list_all_peers(&self) -> StoreResult<Vec<PeerRecord>> {
        Ok(self.peers.read().values().cloned().collect())
    }
}
