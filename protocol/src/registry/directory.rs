//! # PeerDirectory
//!
//! Per-network peer records and the rules for changing them.
//!
//! Permission only goes up through an [`AdmissionGrant`], a token that only
//! the admission module can mint and only after a bound challenge has been
//! verified. Everything else ([`upsert_peer`](PeerDirectory::upsert_peer),
//! [`revoke_peer`](PeerDirectory::revoke_peer)) may keep or lower a
//! permission, never raise it.
//!
//! Connection state is written only by the connection manager through
//! `pub(crate)` accessors; route score only by the scorer.

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::networks::NetworkRegistry;
use super::RegistryError;
use crate::config::{NEUTRAL_SCORE, SCORE_MAX, SCORE_MIN};
use crate::model::{ConnectionState, PeerKey, PeerRecord, Permission};
use crate::storage::Store;

/// Proof that admission verified a challenge for `key`. Cannot be built
/// outside this crate.
#[derive(Debug, Clone)]
pub struct AdmissionGrant {
    key: PeerKey,
    permission: Permission,
    challenge_id: String,
}

impl AdmissionGrant {
    pub(crate) fn new(key: PeerKey, permission: Permission, challenge_id: String) -> Self {
        Self {
            key,
            permission,
            challenge_id,
        }
    }

    pub fn key(&self) -> &PeerKey {
        &self.key
    }

    pub fn permission(&self) -> Permission {
        self.permission
    }
}

pub struct PeerDirectory {
    store: Arc<dyn Store>,
    networks: Arc<NetworkRegistry>,
    peers: DashMap<PeerKey, PeerRecord>,
}

impl PeerDirectory {
    /// Load persisted peers. Runtime columns start fresh: every peer comes
    /// back disconnected with a neutral score.
    pub fn load(
        store: Arc<dyn Store>,
        networks: Arc<NetworkRegistry>,
    ) -> Result<Self, RegistryError> {
        let peers = DashMap::new();
        for mut record in store.list_all_peers()? {
            record.connection = ConnectionState::Disconnected;
            record.score = NEUTRAL_SCORE;
            peers.insert(record.key(), record);
        }
        info!(count = peers.len(), "loaded peer directory");
        Ok(Self {
            store,
            networks,
            peers,
        })
    }

    pub fn networks(&self) -> &Arc<NetworkRegistry> {
        &self.networks
    }

    fn ensure_network(&self, network_id: &str) -> Result<(), RegistryError> {
        if self.networks.contains(network_id) {
            Ok(())
        } else {
            Err(RegistryError::NetworkNotFound(network_id.to_string()))
        }
    }

    fn check_identity(record: &PeerRecord) -> Result<(), RegistryError> {
        if !record.peer_id.matches(&record.public_key) {
            return Err(RegistryError::IdentityMismatch(format!(
                "{} is not the fingerprint of the presented key",
                record.peer_id
            )));
        }
        Ok(())
    }

    // -- Public accessors ---------------------------------------------------

    /// Insert or update a peer record from outside the admission path.
    ///
    /// - The peer id must be the fingerprint of the record's key.
    /// - A new peer may enter at `pending` or `revoked` only.
    /// - An existing peer keeps or lowers its permission; raising it is
    ///   [`RegistryError::InsufficientPermission`].
    /// - Connection state, score and last-seen are owned elsewhere and are
    ///   preserved from the stored record.
    pub fn upsert_peer(
        &self,
        network_id: &str,
        record: PeerRecord,
    ) -> Result<PeerRecord, RegistryError> {
        self.ensure_network(network_id)?;
        if record.network_id != network_id {
            return Err(RegistryError::IdentityMismatch(format!(
                "record belongs to network {}, not {}",
                record.network_id, network_id
            )));
        }
        Self::check_identity(&record)?;

        match self.peers.entry(record.key()) {
            Entry::Occupied(mut slot) => {
                let existing = slot.get();
                if record.permission > existing.permission {
                    return Err(RegistryError::InsufficientPermission(format!(
                        "cannot raise {} from {} to {} outside admission",
                        record.key(),
                        existing.permission,
                        record.permission
                    )));
                }
                let mut merged = existing.clone();
                merged.endpoint = record.endpoint;
                merged.permission = record.permission;
                self.store.put_peer(&merged)?;
                debug!(peer = %merged.key(), permission = %merged.permission, "peer updated");
                slot.insert(merged.clone());
                Ok(merged)
            }
            Entry::Vacant(slot) => {
                if record.permission > Permission::Pending {
                    return Err(RegistryError::InsufficientPermission(format!(
                        "new peer {} must enter as pending, not {}",
                        record.key(),
                        record.permission
                    )));
                }
                let mut fresh = record;
                fresh.connection = ConnectionState::Disconnected;
                fresh.score = NEUTRAL_SCORE;
                self.store.put_peer(&fresh)?;
                debug!(peer = %fresh.key(), "peer recorded");
                slot.insert(fresh.clone());
                Ok(fresh)
            }
        }
    }

    pub fn get_peer(&self, key: &PeerKey) -> Result<PeerRecord, RegistryError> {
        self.find_peer(key)
            .ok_or_else(|| RegistryError::PeerNotFound(key.clone()))
    }

    pub fn find_peer(&self, key: &PeerKey) -> Option<PeerRecord> {
        self.peers.get(key).map(|r| r.value().clone())
    }

    /// All peers of a network, in peer id order.
    pub fn list_peers(&self, network_id: &str) -> Vec<PeerRecord> {
        let mut out: Vec<_> = self
            .peers
            .iter()
            .filter(|r| r.key().network_id == network_id)
            .map(|r| r.value().clone())
            .collect();
        out.sort_by(|a, b| a.peer_id.cmp(&b.peer_id));
        out
    }

    /// Routing candidates: permission at least `member`, not `failed`.
    pub fn list_connectable_peers(&self, network_id: &str) -> Vec<PeerRecord> {
        let mut out: Vec<_> = self
            .peers
            .iter()
            .filter(|r| r.key().network_id == network_id && r.value().is_connectable())
            .map(|r| r.value().clone())
            .collect();
        out.sort_by(|a, b| a.peer_id.cmp(&b.peer_id));
        out
    }

    /// Every peer of every network whose permission lets it route. Used to
    /// bring sessions up at startup.
    pub fn list_routable(&self) -> Vec<PeerRecord> {
        self.peers
            .iter()
            .filter(|r| r.value().permission.is_routable())
            .map(|r| r.value().clone())
            .collect()
    }

    /// Downgrade a peer to `revoked`. Tearing down its session is the
    /// caller's business.
    pub fn revoke_peer(&self, key: &PeerKey) -> Result<PeerRecord, RegistryError> {
        let mut slot = self
            .peers
            .get_mut(key)
            .ok_or_else(|| RegistryError::PeerNotFound(key.clone()))?;
        let mut updated = slot.value().clone();
        updated.permission = Permission::Revoked;
        self.store.put_peer(&updated)?;
        *slot = updated.clone();
        warn!(peer = %key, "peer revoked");
        Ok(updated)
    }

    // -- Admission-only -----------------------------------------------------

    /// Record a peer that has asked (or been asked) to join. A revoked or
    /// pending peer is reset to `pending` with the fresh endpoint; a peer
    /// that is already a member keeps its standing.
    pub(crate) fn enroll(&self, record: PeerRecord) -> Result<PeerRecord, RegistryError> {
        self.ensure_network(&record.network_id)?;
        Self::check_identity(&record)?;

        match self.peers.entry(record.key()) {
            Entry::Occupied(mut slot) => {
                if slot.get().permission.is_routable() {
                    return Ok(slot.get().clone());
                }
                let mut updated = slot.get().clone();
                updated.permission = Permission::Pending;
                updated.endpoint = record.endpoint;
                if updated.connection == ConnectionState::Failed {
                    updated.connection = ConnectionState::Disconnected;
                }
                self.store.put_peer(&updated)?;
                slot.insert(updated.clone());
                Ok(updated)
            }
            Entry::Vacant(slot) => {
                let mut fresh = record;
                fresh.permission = Permission::Pending;
                fresh.connection = ConnectionState::Disconnected;
                fresh.score = NEUTRAL_SCORE;
                self.store.put_peer(&fresh)?;
                slot.insert(fresh.clone());
                Ok(fresh)
            }
        }
    }

    /// Raise a peer's permission on the strength of a verified challenge.
    /// Never lowers: a grant below the current level is a no-op.
    pub(crate) fn apply_grant(&self, grant: AdmissionGrant) -> Result<PeerRecord, RegistryError> {
        let mut slot = self
            .peers
            .get_mut(&grant.key)
            .ok_or_else(|| RegistryError::PeerNotFound(grant.key.clone()))?;
        if slot.permission >= grant.permission {
            return Ok(slot.value().clone());
        }
        let mut updated = slot.value().clone();
        updated.permission = grant.permission;
        if updated.connection == ConnectionState::Failed {
            updated.connection = ConnectionState::Disconnected;
        }
        self.store.put_peer(&updated)?;
        *slot = updated.clone();
        info!(
            peer = %grant.key,
            permission = %grant.permission,
            challenge = %grant.challenge_id,
            "peer admitted"
        );
        Ok(updated)
    }

    // -- Connection manager & scorer ----------------------------------------

    /// Move a peer's connection state. Returns the previous state.
    pub(crate) fn set_connection_state(
        &self,
        key: &PeerKey,
        state: ConnectionState,
    ) -> Result<ConnectionState, RegistryError> {
        let mut slot = self
            .peers
            .get_mut(key)
            .ok_or_else(|| RegistryError::PeerNotFound(key.clone()))?;
        let previous = slot.connection;
        slot.connection = state;
        if state.is_connected() {
            slot.last_seen = Some(Utc::now());
        }
        if previous != state {
            debug!(peer = %key, from = %previous, to = %state, "connection state");
        }
        Ok(previous)
    }

    /// Atomically claim a peer for connecting. Succeeds only from
    /// `disconnected`.
    pub(crate) fn try_begin_connect(&self, key: &PeerKey) -> Result<bool, RegistryError> {
        let mut slot = self
            .peers
            .get_mut(key)
            .ok_or_else(|| RegistryError::PeerNotFound(key.clone()))?;
        if slot.connection == ConnectionState::Disconnected {
            slot.connection = ConnectionState::Connecting;
            debug!(peer = %key, "connecting");
            Ok(true)
        } else {
            Ok(false)
        }
    }

    pub(crate) fn mark_seen(&self, key: &PeerKey, at: DateTime<Utc>) {
        if let Some(mut slot) = self.peers.get_mut(key) {
            slot.last_seen = Some(at);
        }
    }

    pub(crate) fn update_score(&self, key: &PeerKey, score: f64) {
        if let Some(mut slot) = self.peers.get_mut(key) {
            slot.score = score.clamp(SCORE_MIN, SCORE_MAX);
        }
    }
}
