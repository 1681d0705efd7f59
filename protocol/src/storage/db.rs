//! # SledStore: Persistent Membership Storage
//!
//! Networks and peer records on disk, built on sled's embedded key-value
//! store.
//!
//! ## Tree Layout
//!
//! | Tree       | Key                              | Value                |
//! |------------|----------------------------------|----------------------|
//! | `networks` | `network_id` (UTF-8)             | `bincode(Network)`   |
//! | `peers`    | `network_id` `0x00` `peer_id`    | `bincode(PeerRecord)`|
//!
//! The NUL separator keeps all peers of a network contiguous, so listing a
//! network is a single prefix scan. Network ids are UUIDs and never contain
//! NUL.

use sled::{Db, Tree};
use std::path::Path;
use std::time::Duration;
use tracing::debug;

use super::{Store, StoreError, StoreResult};
use crate::model::{Network, PeerKey, PeerRecord};

const KEY_SEPARATOR: u8 = 0x00;

/// A just-dropped handle's flusher thread can hold the file lock briefly.
const LOCK_RETRIES: u32 = 40;
const LOCK_RETRY_DELAY: Duration = Duration::from_millis(50);

fn network_prefix(network_id: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(network_id.len() + 1);
    key.extend_from_slice(network_id.as_bytes());
    key.push(KEY_SEPARATOR);
    key
}

fn peer_key(key: &PeerKey) -> Vec<u8> {
    let mut out = network_prefix(&key.network_id);
    out.extend_from_slice(key.peer_id.as_str().as_bytes());
    out
}

fn encode<T: serde::Serialize>(value: &T) -> StoreResult<Vec<u8>> {
    bincode::serialize(value).map_err(|e| StoreError::Serialization(e.to_string()))
}

fn decode<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> StoreResult<T> {
    bincode::deserialize(bytes).map_err(|e| StoreError::Serialization(e.to_string()))
}

/// sled-backed [`Store`]. Cheap to clone; clones share the database.
#[derive(Debug, Clone)]
pub struct SledStore {
    db: Db,
    networks: Tree,
    peers: Tree,
}

impl SledStore {
    /// Open or create a database at `path`. Waits out a lock still held by
    /// a handle that is shutting down; a lock held for longer is an error.
    pub fn open<P: AsRef<Path>>(path: P) -> StoreResult<Self> {
        let path = path.as_ref();
        let mut attempt = 0;
        loop {
            match sled::open(path) {
                Ok(db) => return Self::from_db(db),
                Err(sled::Error::Io(e))
                    if e.kind() == std::io::ErrorKind::WouldBlock && attempt < LOCK_RETRIES =>
                {
                    attempt += 1;
                    debug!(path = %path.display(), attempt, "database locked, retrying");
                    std::thread::sleep(LOCK_RETRY_DELAY);
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Throwaway database, removed when dropped. For tests.
    pub fn open_temporary() -> StoreResult<Self> {
        let db = sled::Config::new().temporary(true).open()?;
        Self::from_db(db)
    }

    fn from_db(db: Db) -> StoreResult<Self> {
        let networks = db.open_tree("networks")?;
        let peers = db.open_tree("peers")?;
        Ok(Self {
            db,
            networks,
            peers,
        })
    }

    /// Force buffered writes to disk.
    pub fn flush(&self) -> StoreResult<()> {
        self.db.flush()?;
        Ok(())
    }
}

impl Store for SledStore {
    fn put_network(&self, network: &Network) -> StoreResult<()> {
        self.networks
            .insert(network.id.as_bytes(), encode(network)?)?;
        Ok(())
    }

    fn get_network(&self, id: &str) -> StoreResult<Option<Network>> {
        match self.networks.get(id.as_bytes())? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    fn list_networks(&self) -> StoreResult<Vec<Network>> {
        let mut out = Vec::new();
        for entry in self.networks.iter() {
            let (_, bytes) = entry?;
            out.push(decode(&bytes)?);
        }
        Ok(out)
    }

    fn put_peer(&self, peer: &PeerRecord) -> StoreResult<()> {
        self.peers.insert(peer_key(&peer.key()), encode(peer)?)?;
        Ok(())
    }

    fn get_peer(&self, key: &PeerKey) -> StoreResult<Option<PeerRecord>> {
        match self.peers.get(peer_key(key))? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    fn list_peers(&self, network_id: &str) -> StoreResult<Vec<PeerRecord>> {
        let mut out = Vec::new();
        for entry in self.peers.scan_prefix(network_prefix(network_id)) {
            let (_, bytes) = entry?;
            out.push(decode(&bytes)?);
        }
        Ok(out)
    }

    fn list_all_peers(&self) -> StoreResult<Vec<PeerRecord>> {
        let mut out = Vec::new();
        for entry in self.peers.iter() {
            let (_, bytes) = entry?;
            out.push(decode(&bytes)?);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::keys::NodeKeypair;
    use crate::model::{ConnectionState, NetworkRole, NetworkState, Permission};
    use chrono::Utc;

    fn network(id: &str) -> Network {
        Network {
            id: id.to_string(),
            name: format!("net {id}"),
            description: String::new(),
            role: NetworkRole::Admin,
            state: NetworkState::Active,
            difficulty: 12,
            created_at: Utc::now(),
        }
    }

    fn peer(network_id: &str) -> PeerRecord {
        let mut record = PeerRecord::new(
            network_id,
            NodeKeypair::generate().public_key(),
            "http://peer.example",
        );
        record.permission = Permission::Member;
        record.connection = ConnectionState::ConnectedPrimary;
        record.score = 0.8;
        record.last_seen = Some(Utc::now());
        record
    }

    #[test]
    fn network_roundtrip() {
        let store = SledStore::open_temporary().unwrap();
        let net = network("alpha");
        store.put_network(&net).unwrap();
        assert_eq!(store.get_network("alpha").unwrap(), Some(net));
        assert_eq!(store.get_network("beta").unwrap(), None);
        assert_eq!(store.list_networks().unwrap().len(), 1);
    }

    #[test]
    fn peers_are_scoped_by_network() {
        let store = SledStore::open_temporary().unwrap();
        let a1 = peer("a");
        let a2 = peer("a");
        let ab = peer("ab");
        for p in [&a1, &a2, &ab] {
            store.put_peer(p).unwrap();
        }

        // "a" must not pick up peers of "ab" through the prefix scan.
        assert_eq!(store.list_peers("a").unwrap().len(), 2);
        assert_eq!(store.list_peers("ab").unwrap().len(), 1);
        assert_eq!(store.list_all_peers().unwrap().len(), 3);
        assert_eq!(store.get_peer(&a1.key()).unwrap(), Some(a1));
    }

    #[test]
    fn put_peer_overwrites() {
        let store = SledStore::open_temporary().unwrap();
        let mut record = peer("net");
        store.put_peer(&record).unwrap();
        record.permission = Permission::Revoked;
        store.put_peer(&record).unwrap();

        let stored = store.get_peer(&record.key()).unwrap().unwrap();
        assert_eq!(stored.permission, Permission::Revoked);
        assert_eq!(store.list_peers("net").unwrap().len(), 1);
    }

    #[test]
    fn data_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let record = peer("net");
        {
            let store = SledStore::open(dir.path()).unwrap();
            store.put_network(&network("net")).unwrap();
            store.put_peer(&record).unwrap();
            store.flush().unwrap();
        }
        // Back-to-back reopens race the previous handle's flusher.
        for _ in 0..3 {
            let store = SledStore::open(dir.path()).unwrap();
            assert!(store.get_network("net").unwrap().is_some());
            assert_eq!(store.get_peer(&record.key()).unwrap(), Some(record.clone()));
        }
    }

    #[test]
    fn a_live_handle_keeps_others_out() {
        let dir = tempfile::tempdir().unwrap();
        let _held = SledStore::open(dir.path()).unwrap();
        assert!(matches!(
            SledStore::open(dir.path()),
            Err(StoreError::Sled(sled::Error::Io(_)))
        ));
    }
}
