//! Networks this node belongs to.

use chrono::Utc;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

use super::RegistryError;
use crate::config::MAX_DIFFICULTY;
use crate::model::{Network, NetworkDescriptor, NetworkRole, NetworkState};
use crate::storage::Store;

/// Parameters for [`NetworkRegistry::create_network`].
#[derive(Debug, Clone, Default)]
pub struct NewNetwork {
    pub name: String,
    pub description: String,
    /// Falls back to the configured default.
    pub difficulty: Option<u32>,
}

pub struct NetworkRegistry {
    store: Arc<dyn Store>,
    networks: RwLock<HashMap<String, Network>>,
    default_difficulty: u32,
}

impl NetworkRegistry {
    /// Build the registry from whatever the store already holds.
    pub fn load(store: Arc<dyn Store>, default_difficulty: u32) -> Result<Self, RegistryError> {
        let networks: HashMap<_, _> = store
            .list_networks()?
            .into_iter()
            .map(|n| (n.id.clone(), n))
            .collect();
        info!(count = networks.len(), "loaded networks");
        Ok(Self {
            store,
            networks: RwLock::new(networks),
            default_difficulty,
        })
    }

    /// Create a network administered by this node.
    pub fn create_network(&self, spec: NewNetwork) -> Result<Network, RegistryError> {
        let difficulty = spec.difficulty.unwrap_or(self.default_difficulty);
        if difficulty > MAX_DIFFICULTY {
            return Err(RegistryError::InvalidDifficulty(difficulty));
        }
        let network = Network {
            id: uuid::Uuid::new_v4().to_string(),
            name: spec.name,
            description: spec.description,
            role: NetworkRole::Admin,
            state: NetworkState::Active,
            difficulty,
            created_at: Utc::now(),
        };

        let mut networks = self.networks.write();
        self.store.put_network(&network)?;
        networks.insert(network.id.clone(), network.clone());
        info!(network = %network.id, name = %network.name, difficulty, "network created");
        Ok(network)
    }

    pub fn get_network(&self, id: &str) -> Result<Network, RegistryError> {
        self.networks
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| RegistryError::NetworkNotFound(id.to_string()))
    }

    pub fn contains(&self, id: &str) -> bool {
        self.networks.read().contains_key(id)
    }

    /// All known networks, oldest first.
    pub fn list_networks(&self) -> Vec<Network> {
        let mut out: Vec<_> = self.networks.read().values().cloned().collect();
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        out
    }

    /// Record a network learned from an invite. Stays `pending` until the
    /// inviter is admitted. An already-known network is returned unchanged.
    pub(crate) fn register_joined(
        &self,
        descriptor: &NetworkDescriptor,
        role: NetworkRole,
    ) -> Result<Network, RegistryError> {
        let mut networks = self.networks.write();
        if let Some(existing) = networks.get(&descriptor.id) {
            return Ok(existing.clone());
        }
        let network = Network {
            id: descriptor.id.clone(),
            name: descriptor.name.clone(),
            description: descriptor.description.clone(),
            role,
            state: NetworkState::Pending,
            difficulty: self.default_difficulty,
            created_at: Utc::now(),
        };
        self.store.put_network(&network)?;
        networks.insert(network.id.clone(), network.clone());
        info!(network = %network.id, ?role, "network registered from invite");
        Ok(network)
    }

    pub(crate) fn set_state(
        &self,
        id: &str,
        state: NetworkState,
    ) -> Result<Network, RegistryError> {
        let mut networks = self.networks.write();
        let network = networks
            .get_mut(id)
            .ok_or_else(|| RegistryError::NetworkNotFound(id.to_string()))?;
        if network.state == state {
            return Ok(network.clone());
        }
        let mut updated = network.clone();
        updated.state = state;
        self.store.put_network(&updated)?;
        *network = updated.clone();
        info!(network = %id, %state, "network state changed");
        Ok(updated)
    }

    /// Stop participating in a network. Peers stay on record but routing
    /// to a revoked network is refused.
    pub fn revoke_network(&self, id: &str) -> Result<Network, RegistryError> {
        self.set_state(id, NetworkState::Revoked)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;

    fn registry() -> NetworkRegistry {
        NetworkRegistry::load(Arc::new(MemoryStore::new()), 16).unwrap()
    }

    #[test]
    fn create_and_get() {
        let reg = registry();
        let net = reg
            .create_network(NewNetwork {
                name: "libraries".into(),
                description: "shared catalogues".into(),
                difficulty: None,
            })
            .unwrap();

        assert_eq!(net.role, NetworkRole::Admin);
        assert_eq!(net.state, NetworkState::Active);
        assert_eq!(net.difficulty, 16);
        assert_eq!(reg.get_network(&net.id).unwrap(), net);
        assert!(matches!(
            reg.get_network("missing"),
            Err(RegistryError::NetworkNotFound(_))
        ));
    }

    #[test]
    fn rejects_out_of_range_difficulty() {
        let reg = registry();
        let result = reg.create_network(NewNetwork {
            difficulty: Some(300),
            ..Default::default()
        });
        assert!(matches!(result, Err(RegistryError::InvalidDifficulty(300))));
    }

    #[test]
    fn list_is_ordered_by_creation() {
        let reg = registry();
        let first = reg.create_network(NewNetwork::default()).unwrap();
        let second = reg.create_network(NewNetwork::default()).unwrap();
        let ids: Vec<_> = reg.list_networks().into_iter().map(|n| n.id).collect();
        assert_eq!(ids.len(), 2);
        if first.created_at != second.created_at {
            assert_eq!(ids[0], first.id);
        }
    }

    #[test]
    fn joined_network_is_pending_until_activated() {
        let reg = registry();
        let descriptor = NetworkDescriptor {
            id: "remote-net".into(),
            name: "remote".into(),
            description: String::new(),
        };
        let net = reg
            .register_joined(&descriptor, NetworkRole::Member)
            .unwrap();
        assert_eq!(net.state, NetworkState::Pending);

        let again = reg.register_joined(&descriptor, NetworkRole::Admin).unwrap();
        assert_eq!(again.role, NetworkRole::Member);

        let active = reg.set_state("remote-net", NetworkState::Active).unwrap();
        assert_eq!(active.state, NetworkState::Active);
    }

    #[test]
    fn survives_reload() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let id = {
            let reg = NetworkRegistry::load(store.clone(), 8).unwrap();
            reg.create_network(NewNetwork::default()).unwrap().id
        };
        let reg = NetworkRegistry::load(store, 8).unwrap();
        assert!(reg.contains(&id));
    }
}
