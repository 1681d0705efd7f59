//! # Gateway
//!
//! Wires every component from one [`GatewayConfig`] and exposes the
//! operations a management surface calls. Nothing here holds state of its
//! own beyond the component handles; each method is a short composition of
//! component calls.
//!
//! ```text
//! store, cache, kms, solver                 boundaries (configured)
//!   -> NetworkRegistry -> PeerDirectory     membership
//!   -> RouteScorer, DataIndex               routing inputs
//!   -> ConnectionManager (ws + sse)         sessions we dial
//!   -> AdmissionController                  who gets in
//!   -> ProxyRouter                          where requests go
//!   -> SessionHost                          sessions others dial
//! ```
//!
//! ## Two-sided admission
//!
//! Every admission is challenged in both directions, so each node ends up
//! holding a verified record of the other.
//!
//! ```text
//! joiner B                                   admin A
//!   request_join ── signed join request ──>  handle_join_request
//!                <── challenge + counter invite ──
//!   complete_join (records A pending, solves)
//!                ── proof ──>                handle_proof: B is member,
//!                                            A dials B
//!   B's host challenges A in-band; A solves; B admits A and dials back.
//! ```
//!
//! Invites run the same shape with the roles of the first leg swapped.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::admission::{
    AdmissionClient, AdmissionController, AdmissionDeps, AdmissionError, ExpirySweep,
    InviteReply, JoinReply, ProofReceipt, ProofSubmission,
};
use crate::cache::open_cache;
use crate::config::{GatewayConfig, PROTOCOL_VERSION};
use crate::connection::{ConnectionDeps, ConnectionManager, SessionInfo};
use crate::crypto::keys::{PeerId, PublicKey};
use crate::crypto::kms::{Kms, MemoryKms};
use crate::crypto::pow::{PowSolver, Sha256Solver};
use crate::error::GatewayResult;
use crate::model::{
    ChallengeDescriptor, ConnectionState, JoinRequest, Network, PeerKey, PeerRecord, Permission,
    SignedInvite, SignedJoinRequest,
};
use crate::registry::{NetworkRegistry, NewNetwork, PeerDirectory, RegistryError};
use crate::routing::{DataIndex, IndexEntry, ProxyResponse, ProxyRouter, RouteScorer};
use crate::storage::{open_store, Store};
use crate::transport::{
    Connector, DataRequest, MessageDispatcher, SessionHost, SseConnector, WsConnector,
};

/// Who this node is.
#[derive(Debug, Clone, Serialize)]
pub struct NodeInfo {
    pub node_name: String,
    pub peer_id: PeerId,
    pub public_key: PublicKey,
    pub endpoint: String,
    pub version: String,
}

/// Snapshot for status endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct GatewayStatus {
    #[serde(flatten)]
    pub node: NodeInfo,
    pub networks: usize,
    pub routable_peers: usize,
    pub sessions: usize,
    pub started_at: DateTime<Utc>,
    pub uptime_secs: i64,
}

/// Everything known about one peer.
#[derive(Debug, Clone, Serialize)]
pub struct PeerStatus {
    #[serde(flatten)]
    pub record: PeerRecord,
    pub session: Option<SessionInfo>,
    pub reconnect_pending: bool,
}

/// Builder for [`Gateway`]. Anything not supplied is built from the
/// configuration.
pub struct GatewayBuilder {
    config: GatewayConfig,
    kms: Option<Arc<dyn Kms>>,
    store: Option<Arc<dyn Store>>,
    solver: Option<Arc<dyn PowSolver>>,
    primary: Option<Arc<dyn Connector>>,
    fallback: Option<Arc<dyn Connector>>,
}

impl GatewayBuilder {
    pub fn with_kms(mut self, kms: Arc<dyn Kms>) -> Self {
        self.kms = Some(kms);
        self
    }

    pub fn with_store(mut self, store: Arc<dyn Store>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_solver(mut self, solver: Arc<dyn PowSolver>) -> Self {
        self.solver = Some(solver);
        self
    }

    /// Replace both transports, e.g. with a [`MemoryHub`](crate::transport::MemoryHub)'s.
    pub fn with_connectors(
        mut self,
        primary: Arc<dyn Connector>,
        fallback: Arc<dyn Connector>,
    ) -> Self {
        self.primary = Some(primary);
        self.fallback = Some(fallback);
        self
    }

    pub fn build(self) -> GatewayResult<Gateway> {
        let config = self.config;
        config.validate()?;

        let store = match self.store {
            Some(store) => store,
            None => open_store(&config.backends.storage)?,
        };
        let cache = open_cache(&config.backends.cache);
        let kms: Arc<dyn Kms> = match self.kms {
            Some(kms) => kms,
            None => Arc::new(MemoryKms::from_backend(&config.backends.kms)?),
        };
        let solver: Arc<dyn PowSolver> = match self.solver {
            Some(solver) => solver,
            None => Arc::new(Sha256Solver::new()),
        };

        let networks = Arc::new(NetworkRegistry::load(
            store.clone(),
            config.admission.default_difficulty,
        )?);
        let directory = Arc::new(PeerDirectory::load(store, networks.clone())?);
        let scorer = Arc::new(RouteScorer::new(&config.scoring, cache, directory.clone()));
        let index = Arc::new(DataIndex::new());
        let dispatcher = Arc::new(MessageDispatcher::new(index.clone()));

        let primary: Arc<dyn Connector> = match self.primary {
            Some(primary) => primary,
            None => Arc::new(WsConnector::new()),
        };
        let fallback: Arc<dyn Connector> = match self.fallback {
            Some(fallback) => fallback,
            None => Arc::new(SseConnector::new()?),
        };
        let connections = ConnectionManager::new(ConnectionDeps {
            config: config.connection.clone(),
            kms: kms.clone(),
            endpoint: config.endpoint.clone(),
            max_skew: config.admission.max_clock_skew(),
            solver: solver.clone(),
            max_solve_difficulty: config.admission.max_solve_difficulty,
            directory: directory.clone(),
            dispatcher: dispatcher.clone(),
            primary,
            fallback,
        });
        let admission = Arc::new(AdmissionController::new(AdmissionDeps {
            config: config.admission.clone(),
            kms: kms.clone(),
            endpoint: config.endpoint.clone(),
            solver: solver.clone(),
            directory: directory.clone(),
            connections: connections.clone(),
        }));
        let router = ProxyRouter::new(
            config.proxy.clone(),
            directory.clone(),
            scorer.clone(),
            index.clone(),
            Arc::new(connections.clone()),
        );
        let host = Arc::new(SessionHost::new(
            kms.clone(),
            config.endpoint.clone(),
            directory.clone(),
            admission.clone(),
            dispatcher,
            &config.connection,
            &config.admission,
        ));
        let client = AdmissionClient::new(solver, config.admission.max_solve_difficulty)?;

        info!(
            node = %config.node_name,
            peer_id = %kms.peer_id(),
            endpoint = %config.endpoint,
            "gateway assembled"
        );
        Ok(Gateway {
            config,
            kms,
            networks,
            directory,
            scorer,
            index,
            connections,
            admission,
            router,
            host,
            client,
            started_at: Utc::now(),
        })
    }
}

pub struct Gateway {
    config: GatewayConfig,
    kms: Arc<dyn Kms>,
    networks: Arc<NetworkRegistry>,
    directory: Arc<PeerDirectory>,
    scorer: Arc<RouteScorer>,
    index: Arc<DataIndex>,
    connections: ConnectionManager,
    admission: Arc<AdmissionController>,
    router: ProxyRouter,
    host: Arc<SessionHost>,
    client: AdmissionClient,
    started_at: DateTime<Utc>,
}

impl Gateway {
    pub fn builder(config: GatewayConfig) -> GatewayBuilder {
        GatewayBuilder {
            config,
            kms: None,
            store: None,
            solver: None,
            primary: None,
            fallback: None,
        }
    }

    /// Assemble a gateway entirely from configuration.
    pub fn build(config: GatewayConfig) -> GatewayResult<Self> {
        Self::builder(config).build()
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn scorer(&self) -> &Arc<RouteScorer> {
        &self.scorer
    }

    /// The accepting side of sessions, for transports' server halves.
    pub fn session_host(&self) -> Arc<SessionHost> {
        self.host.clone()
    }

    pub fn node_info(&self) -> NodeInfo {
        NodeInfo {
            node_name: self.config.node_name.clone(),
            peer_id: self.kms.peer_id(),
            public_key: self.kms.public_key(),
            endpoint: self.config.endpoint.clone(),
            version: PROTOCOL_VERSION.to_string(),
        }
    }

    pub fn status(&self) -> GatewayStatus {
        GatewayStatus {
            node: self.node_info(),
            networks: self.networks.list_networks().len(),
            routable_peers: self.directory.list_routable().len(),
            sessions: self.connections.connected_count(),
            started_at: self.started_at,
            uptime_secs: (Utc::now() - self.started_at).num_seconds(),
        }
    }

    // -----------------------------------------------------------------------
    // Networks
    // -----------------------------------------------------------------------

    pub fn create_network(&self, spec: NewNetwork) -> GatewayResult<Network> {
        Ok(self.networks.create_network(spec)?)
    }

    pub fn get_network(&self, id: &str) -> GatewayResult<Network> {
        Ok(self.networks.get_network(id)?)
    }

    pub fn list_networks(&self) -> Vec<Network> {
        self.networks.list_networks()
    }

    /// Leave a network: refuse routing into it and drop its sessions.
    pub fn revoke_network(&self, id: &str) -> GatewayResult<Network> {
        let network = self.networks.revoke_network(id)?;
        for peer in self.directory.list_peers(id) {
            self.connections.disconnect(&peer.key());
        }
        Ok(network)
    }

    // -----------------------------------------------------------------------
    // Admission: local operations
    // -----------------------------------------------------------------------

    pub fn issue_invite(
        &self,
        network_id: &str,
        granted: Permission,
    ) -> GatewayResult<SignedInvite> {
        Ok(self.admission.issue_invite(network_id, granted)?)
    }

    pub fn accept_invite(&self, invite: SignedInvite) -> GatewayResult<JoinRequest> {
        Ok(self.admission.accept_invite(invite)?)
    }

    /// Sign a request to join `network_id`, for delivery by other means
    /// than [`request_join`](Self::request_join).
    pub fn prepare_join_request(
        &self,
        network_id: &str,
        permission: Permission,
    ) -> GatewayResult<SignedJoinRequest> {
        Ok(self
            .admission
            .prepare_join_request(network_id, permission, None)?)
    }

    pub fn issue_challenge(
        &self,
        network_id: &str,
        target: &PeerId,
    ) -> GatewayResult<ChallengeDescriptor> {
        Ok(self.admission.issue_challenge(network_id, target)?)
    }

    pub fn submit_proof(&self, challenge_id: &str, nonce: &[u8]) -> GatewayResult<PeerRecord> {
        Ok(self.admission.submit_proof(challenge_id, nonce)?)
    }

    pub fn reject_join_request(&self, join_id: &str) -> GatewayResult<JoinRequest> {
        Ok(self.admission.reject_join_request(join_id)?)
    }

    pub fn pending_requests(&self, network_id: Option<&str>) -> Vec<JoinRequest> {
        self.admission.pending_requests(network_id)
    }

    // -----------------------------------------------------------------------
    // Admission: service endpoints (the remote peer's requests)
    // -----------------------------------------------------------------------

    /// Record a remote join request and answer with a challenge plus a
    /// counter invite.
    pub fn handle_join_request(&self, request: SignedJoinRequest) -> GatewayResult<JoinReply> {
        let join = self.admission.submit_join_request(request)?;
        let challenge = self
            .admission
            .issue_challenge(&join.network_id, &join.requester.peer_id)?;
        let counter_invite = self
            .admission
            .issue_invite(&join.network_id, join.proposed_permission)?;
        Ok(JoinReply {
            challenge,
            counter_invite,
        })
    }

    /// Accept a remote invite, answer with our join request redeeming it
    /// and a challenge for the inviter.
    pub fn handle_invite(&self, invite: SignedInvite) -> GatewayResult<InviteReply> {
        let network_id = invite.body.network.id.clone();
        let inviter = invite.body.inviter.peer_id.clone();
        let granted = invite.body.granted_permission;
        let invite_id = invite.body.invite_id.clone();

        self.admission.accept_invite(invite)?;
        let join_request =
            self.admission
                .prepare_join_request(&network_id, granted, Some(invite_id))?;
        let challenge = self.admission.issue_challenge(&network_id, &inviter)?;
        Ok(InviteReply {
            join_request,
            challenge,
        })
    }

    pub fn handle_proof(&self, proof: ProofSubmission) -> GatewayResult<ProofReceipt> {
        let nonce = hex::decode(&proof.nonce)
            .map_err(|_| AdmissionError::InvalidRequest("nonce is not hex".to_string()))?;
        let record = self.admission.submit_proof(&proof.challenge_id, &nonce)?;
        Ok(ProofReceipt {
            network_id: record.network_id,
            peer_id: record.peer_id,
            permission: record.permission,
        })
    }

    // -----------------------------------------------------------------------
    // Admission: our side of a remote exchange
    // -----------------------------------------------------------------------

    /// Record the admin behind a join reply and solve its challenge.
    pub async fn complete_join(&self, reply: JoinReply) -> GatewayResult<ProofSubmission> {
        if reply.counter_invite.body.network.id != reply.challenge.network_id {
            return Err(AdmissionError::InvalidRequest(
                "counter invite is for another network".to_string(),
            )
            .into());
        }
        self.admission.accept_invite(reply.counter_invite)?;
        Ok(self.client.solve(&reply.challenge).await?)
    }

    /// Record the invitee behind an invite reply and solve its challenge.
    pub async fn complete_invite(&self, reply: InviteReply) -> GatewayResult<ProofSubmission> {
        if reply.join_request.body.network_id != reply.challenge.network_id {
            return Err(AdmissionError::InvalidRequest(
                "join request is for another network".to_string(),
            )
            .into());
        }
        self.admission.submit_join_request(reply.join_request)?;
        Ok(self.client.solve(&reply.challenge).await?)
    }

    /// Ask the node at `endpoint` to let us into `network_id` as a member.
    pub async fn request_join(
        &self,
        endpoint: &str,
        network_id: &str,
    ) -> GatewayResult<ProofReceipt> {
        let request = self
            .admission
            .prepare_join_request(network_id, Permission::Member, None)?;
        let reply = self.client.post_join(endpoint, &request).await?;
        let proof = self.complete_join(reply).await?;
        let receipt = self.client.post_proof(endpoint, &proof).await?;
        info!(network = %network_id, %endpoint, permission = %receipt.permission, "joined");
        Ok(receipt)
    }

    /// Invite the node at `endpoint` into `network_id`.
    pub async fn send_invite(
        &self,
        endpoint: &str,
        network_id: &str,
        granted: Permission,
    ) -> GatewayResult<ProofReceipt> {
        let invite = self.admission.issue_invite(network_id, granted)?;
        let reply = self.client.post_invite(endpoint, &invite).await?;
        if reply.join_request.body.invite_id.as_deref() != Some(invite.body.invite_id.as_str()) {
            return Err(AdmissionError::InvalidRequest(
                "reply does not redeem the invite we sent".to_string(),
            )
            .into());
        }
        let proof = self.complete_invite(reply).await?;
        let receipt = self.client.post_proof(endpoint, &proof).await?;
        info!(network = %network_id, %endpoint, "invite accepted by remote");
        Ok(receipt)
    }

    // -----------------------------------------------------------------------
    // Peers
    // -----------------------------------------------------------------------

    pub fn list_peers(&self, network_id: &str) -> GatewayResult<Vec<PeerRecord>> {
        self.networks.get_network(network_id)?;
        Ok(self.directory.list_peers(network_id))
    }

    pub fn get_peer_status(&self, key: &PeerKey) -> GatewayResult<PeerStatus> {
        let mut record = self.directory.get_peer(key)?;
        record.score = self.scorer.score(key);
        Ok(PeerStatus {
            session: self.connections.session_info(key),
            reconnect_pending: self.connections.reconnect_pending(key),
            record,
        })
    }

    pub async fn connect_peer(&self, key: &PeerKey) -> GatewayResult<ConnectionState> {
        Ok(self.connections.connect(key).await?)
    }

    /// Clear a `failed` peer and dial it again.
    pub async fn reset_peer(&self, key: &PeerKey) -> GatewayResult<ConnectionState> {
        Ok(self.connections.reset_failed(key).await?)
    }

    /// Downgrade to `revoked`, close the session, cancel reconnects and
    /// forget the score.
    pub fn revoke_peer(&self, key: &PeerKey) -> GatewayResult<PeerRecord> {
        let record = self.directory.revoke_peer(key)?;
        self.connections.disconnect(key);
        self.scorer.forget(key);
        Ok(record)
    }

    /// Dial every routable peer. Failures schedule their own reconnects.
    pub async fn connect_known_peers(&self) -> usize {
        let peers = self.directory.list_routable();
        let attempts = peers.iter().map(|peer| {
            let key = peer.key();
            async move {
                match self.connections.connect(&key).await {
                    Ok(state) => state.is_connected(),
                    Err(e) => {
                        debug!(peer = %key, error = %e, "startup connect failed");
                        false
                    }
                }
            }
        });
        let connected = futures::future::join_all(attempts)
            .await
            .into_iter()
            .filter(|ok| *ok)
            .count();
        info!(connected, known = peers.len(), "startup connections");
        connected
    }

    // -----------------------------------------------------------------------
    // Discovery
    // -----------------------------------------------------------------------

    /// Answer a discovery request locally or through the best peer, within
    /// `deadline` (or the configured default).
    pub async fn proxy_request(
        &self,
        network_id: &str,
        address: &str,
        payload: Value,
        deadline: Option<Duration>,
    ) -> GatewayResult<ProxyResponse> {
        let budget = deadline.unwrap_or_else(|| self.config.proxy.default_deadline());
        let request = DataRequest {
            network_id: network_id.to_string(),
            address: address.to_string(),
            payload,
        };
        let deadline = tokio::time::Instant::now() + budget;
        Ok(self.router.route(request, deadline).await?)
    }

    /// Publish a record this node answers for.
    pub fn publish_index(
        &self,
        network_id: &str,
        address: &str,
        value: Value,
    ) -> GatewayResult<IndexEntry> {
        if !self.networks.contains(network_id) {
            return Err(RegistryError::NetworkNotFound(network_id.to_string()).into());
        }
        Ok(self.index.publish(network_id, address, value))
    }

    pub fn remove_index(&self, network_id: &str, address: &str) -> Option<IndexEntry> {
        self.index.remove(network_id, address)
    }

    pub fn list_index(&self, network_id: &str) -> Vec<IndexEntry> {
        self.index.list(network_id)
    }

    // -----------------------------------------------------------------------
    // Housekeeping
    // -----------------------------------------------------------------------

    pub fn expire_stale(&self) -> ExpirySweep {
        self.admission.expire_stale(Utc::now())
    }

    pub fn shutdown(&self) {
        self.connections.shutdown();
        warn!("gateway shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::model::TransportKind;
    use crate::transport::MemoryHub;
    use serde_json::json;

    fn gateway(hub: &MemoryHub, name: &str) -> Gateway {
        let mut config = GatewayConfig::default();
        config.node_name = name.to_string();
        config.endpoint = format!("mem://{name}");
        config.admission.default_difficulty = 4;
        let gateway = Gateway::builder(config)
            .with_connectors(
                Arc::new(hub.connector(TransportKind::Primary)),
                Arc::new(hub.connector(TransportKind::Fallback)),
            )
            .build()
            .unwrap();
        hub.register(format!("mem://{name}"), gateway.session_host());
        gateway
    }

    #[tokio::test]
    async fn local_index_answers_without_peers() {
        let hub = MemoryHub::new();
        let node = gateway(&hub, "solo");
        let net = node.create_network(NewNetwork::default()).unwrap();
        node.publish_index(&net.id, "k", json!({"v": 1})).unwrap();

        let response = node
            .proxy_request(&net.id, "k", Value::Null, None)
            .await
            .unwrap();
        assert_eq!(response.payload, json!({"v": 1}));

        let err = node
            .proxy_request(&net.id, "missing", Value::Null, None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Routing);
    }

    #[tokio::test]
    async fn publishing_needs_a_known_network() {
        let hub = MemoryHub::new();
        let node = gateway(&hub, "solo");
        let err = node.publish_index("nope", "k", json!(1)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn join_exchange_without_http() {
        let hub = MemoryHub::new();
        let admin = gateway(&hub, "admin");
        let joiner = gateway(&hub, "joiner");
        let net = admin.create_network(NewNetwork::default()).unwrap();

        let request = joiner
            .prepare_join_request(&net.id, Permission::Member)
            .unwrap();
        let reply = admin.handle_join_request(request).unwrap();
        let proof = joiner.complete_join(reply).await.unwrap();
        let receipt = admin.handle_proof(proof).unwrap();
        assert_eq!(receipt.permission, Permission::Member);
        assert_eq!(receipt.peer_id, joiner.node_info().peer_id);

        let status = admin
            .get_peer_status(&PeerKey::new(net.id.clone(), receipt.peer_id))
            .unwrap();
        assert_eq!(status.record.permission, Permission::Member);
        admin.shutdown();
        joiner.shutdown();
    }
}
