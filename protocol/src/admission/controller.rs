//! # AdmissionController
//!
//! The only path by which a peer's permission rises above `pending`.
//!
//! ```text
//!  join request ──┐                         ┌── invite accepted
//!  (signed, kind  │                         │   (signed, kind invite:
//!   request)      v                         v    the inviter is the peer)
//!             JoinRequest { pending } ── enroll peer as pending
//!                      │
//!                issue_challenge ──> Challenge { issued, prefix, difficulty }
//!                      │
//!                submit_proof(nonce)
//!                      │ SHA-256(prefix ++ nonce) has ≥ difficulty zero bits
//!                      v
//!             Challenge { verified }  JoinRequest { accepted }
//!             AdmissionGrant ──> PeerDirectory raises permission
//!                      │
//!                      └──> ConnectionManager::connect (spawned)
//! ```
//!
//! ## Single use
//!
//! Verification runs while holding the challenge's map entry, so two
//! concurrent submissions for one challenge are serialized: the first flips
//! it to `verified`, every later one sees `ReusedNonce`. A wrong proof
//! flips it to `failed` and it stays that way; the peer must ask for a new
//! challenge.
//!
//! When the challenge and join maps are both touched, the challenge entry
//! is taken first.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rand::RngCore;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::AdmissionError;
use crate::config::{AdmissionConfig, CHALLENGE_PREFIX_BYTES};
use crate::connection::ConnectionManager;
use crate::crypto::keys::PeerId;
use crate::crypto::kms::{sign_payload, verify_payload, Kms};
use crate::crypto::pow::PowSolver;
use crate::model::{
    Challenge, ChallengeDescriptor, ChallengeState, InviteBody, JoinKind, JoinRequest,
    JoinRequestBody, JoinState, NetworkRole, NetworkState, PeerIntro, PeerKey, PeerRecord,
    Permission, SignedInvite, SignedJoinRequest,
};
use crate::registry::{AdmissionGrant, NetworkRegistry, PeerDirectory};

/// Counts from one [`AdmissionController::expire_stale`] pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct ExpirySweep {
    pub challenges_expired: usize,
    pub join_requests_expired: usize,
    pub invites_expired: usize,
    /// Terminal records dropped after lingering one more lifetime.
    pub purged: usize,
}

/// Everything the controller is built from.
pub struct AdmissionDeps {
    pub config: AdmissionConfig,
    pub kms: Arc<dyn Kms>,
    pub endpoint: String,
    pub solver: Arc<dyn PowSolver>,
    pub directory: Arc<PeerDirectory>,
    pub connections: ConnectionManager,
}

pub struct AdmissionController {
    config: AdmissionConfig,
    kms: Arc<dyn Kms>,
    endpoint: String,
    solver: Arc<dyn PowSolver>,
    networks: Arc<NetworkRegistry>,
    directory: Arc<PeerDirectory>,
    connections: ConnectionManager,
    challenges: DashMap<String, Challenge>,
    joins: DashMap<String, JoinRequest>,
    /// Invites this node has issued and nobody has redeemed yet.
    invites: DashMap<String, InviteBody>,
}

fn deadline(from: DateTime<Utc>, ttl: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(ttl)
        .ok()
        .and_then(|delta| from.checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

impl AdmissionController {
    pub fn new(deps: AdmissionDeps) -> Self {
        Self {
            config: deps.config,
            kms: deps.kms,
            endpoint: deps.endpoint,
            solver: deps.solver,
            networks: deps.directory.networks().clone(),
            directory: deps.directory,
            connections: deps.connections,
            challenges: DashMap::new(),
            joins: DashMap::new(),
            invites: DashMap::new(),
        }
    }

    /// How this node introduces itself in anything it signs.
    pub fn intro(&self) -> PeerIntro {
        PeerIntro {
            peer_id: self.kms.peer_id(),
            public_key: self.kms.public_key(),
            endpoint: self.endpoint.clone(),
        }
    }

    fn ensure_not_self(&self, peer: &PeerIntro) -> Result<(), AdmissionError> {
        if peer.peer_id == self.kms.peer_id() {
            return Err(AdmissionError::InvalidRequest(
                "a node cannot admit itself".to_string(),
            ));
        }
        Ok(())
    }

    /// The network must exist, be administered here and be active.
    fn admin_network(&self, network_id: &str) -> Result<crate::model::Network, AdmissionError> {
        let network = self.networks.get_network(network_id)?;
        if !network.is_admin() {
            return Err(AdmissionError::InsufficientPermission(format!(
                "this node does not administer network {network_id}"
            )));
        }
        if network.state != NetworkState::Active {
            return Err(AdmissionError::InvalidRequest(format!(
                "network {network_id} is {}",
                network.state
            )));
        }
        Ok(network)
    }

    /// Mark every other pending request from the same peer in the same
    /// network as expired. One open request per peer at a time.
    fn supersede_pending(&self, network_id: &str, peer_id: &PeerId, keep: &str) {
        for mut join in self.joins.iter_mut() {
            if join.id != keep
                && join.is_pending()
                && join.network_id == network_id
                && join.requester.peer_id == *peer_id
            {
                join.state = JoinState::Expired;
                debug!(join = %join.id, "superseded by a newer request");
            }
        }
    }

    // -----------------------------------------------------------------------
    // Invites (admin side)
    // -----------------------------------------------------------------------

    /// Sign an invite into `network_id` granting `granted` to whoever
    /// redeems it. Only admins of an active network may invite.
    pub fn issue_invite(
        &self,
        network_id: &str,
        granted: Permission,
    ) -> Result<SignedInvite, AdmissionError> {
        let network = self.admin_network(network_id)?;
        if !granted.is_routable() {
            return Err(AdmissionError::InvalidRequest(format!(
                "an invite must grant member or admin, not {granted}"
            )));
        }
        let now = Utc::now();
        let body = InviteBody {
            invite_id: uuid::Uuid::new_v4().to_string(),
            network: network.descriptor(),
            inviter: self.intro(),
            inviter_permission: Permission::Admin,
            granted_permission: granted,
            issued_at_ms: now.timestamp_millis(),
            expires_at_ms: deadline(now, self.config.invite_ttl()).timestamp_millis(),
        };
        let signature = sign_payload(self.kms.as_ref(), &body)?;
        self.invites.insert(body.invite_id.clone(), body.clone());
        info!(network = %network_id, invite = %body.invite_id, %granted, "invite issued");
        Ok(SignedInvite { body, signature })
    }

    // -----------------------------------------------------------------------
    // Invites (invitee side)
    // -----------------------------------------------------------------------

    /// Accept an invite from another node.
    ///
    /// Records the network locally as `pending`, enrolls the inviter as a
    /// pending peer and opens a join request for it. The inviter is
    /// admitted (and the network activated) only once it solves a
    /// challenge issued from this side.
    pub fn accept_invite(&self, invite: SignedInvite) -> Result<JoinRequest, AdmissionError> {
        let body = &invite.body;
        if !body.inviter.is_consistent() {
            return Err(AdmissionError::InvalidRequest(
                "inviter id is not the fingerprint of its key".to_string(),
            ));
        }
        if !verify_payload(
            self.kms.as_ref(),
            body,
            &invite.signature,
            &body.inviter.public_key,
        ) {
            return Err(AdmissionError::InvalidSignature);
        }
        let now = Utc::now();
        if now.timestamp_millis() >= body.expires_at_ms {
            return Err(AdmissionError::ExpiredInvite);
        }
        self.ensure_not_self(&body.inviter)?;
        if !body.granted_permission.is_routable() || !body.inviter_permission.is_routable() {
            return Err(AdmissionError::InvalidRequest(
                "invite permissions must be member or admin".to_string(),
            ));
        }

        let role = if body.granted_permission == Permission::Admin {
            NetworkRole::Admin
        } else {
            NetworkRole::Member
        };
        let network = self.networks.register_joined(&body.network, role)?;
        if network.state == NetworkState::Revoked {
            return Err(AdmissionError::InvalidRequest(format!(
                "network {} was revoked here",
                network.id
            )));
        }
        self.directory.enroll(PeerRecord::new(
            &network.id,
            body.inviter.public_key,
            &body.inviter.endpoint,
        ))?;

        let join = JoinRequest {
            id: uuid::Uuid::new_v4().to_string(),
            kind: JoinKind::Invite,
            network_id: network.id.clone(),
            requester: body.inviter.clone(),
            proposed_permission: body.inviter_permission,
            signature: invite.signature.clone(),
            state: JoinState::Pending,
            invite_id: Some(body.invite_id.clone()),
            challenge_id: None,
            created_at: now,
            expires_at: deadline(now, self.config.join_request_ttl()),
        };
        self.supersede_pending(&network.id, &body.inviter.peer_id, &join.id);
        self.joins.insert(join.id.clone(), join.clone());
        info!(
            network = %network.id,
            inviter = %body.inviter.peer_id,
            "invite accepted"
        );
        Ok(join)
    }

    // -----------------------------------------------------------------------
    // Join requests
    // -----------------------------------------------------------------------

    /// Sign a request to join `network_id` at `permission`, optionally
    /// redeeming an invite.
    pub fn prepare_join_request(
        &self,
        network_id: &str,
        permission: Permission,
        invite_id: Option<String>,
    ) -> Result<SignedJoinRequest, AdmissionError> {
        let body = JoinRequestBody {
            request_id: uuid::Uuid::new_v4().to_string(),
            network_id: network_id.to_string(),
            requester: self.intro(),
            proposed_permission: permission,
            invite_id,
            issued_at_ms: Utc::now().timestamp_millis(),
        };
        let signature = sign_payload(self.kms.as_ref(), &body)?;
        Ok(SignedJoinRequest { body, signature })
    }

    /// Record a signed join request from a remote peer and enroll it as
    /// pending.
    ///
    /// Without an invite a peer may ask for `member` only. With one, it may
    /// ask for anything up to what the invite grants; the invite is spent.
    /// Re-submitting the exact same signed request returns the existing
    /// record.
    pub fn submit_join_request(
        &self,
        request: SignedJoinRequest,
    ) -> Result<JoinRequest, AdmissionError> {
        let body = &request.body;
        if !body.requester.is_consistent() {
            return Err(AdmissionError::InvalidRequest(
                "requester id is not the fingerprint of its key".to_string(),
            ));
        }
        if !verify_payload(
            self.kms.as_ref(),
            body,
            &request.signature,
            &body.requester.public_key,
        ) {
            return Err(AdmissionError::InvalidSignature);
        }
        let now = Utc::now();
        let skew = (now.timestamp_millis() - body.issued_at_ms).unsigned_abs();
        if skew > self.config.max_clock_skew_ms {
            return Err(AdmissionError::InvalidRequest(format!(
                "request timestamp is {skew} ms off"
            )));
        }
        self.admin_network(&body.network_id)?;
        self.ensure_not_self(&body.requester)?;

        if let Some(existing) = self.joins.iter().find(|j| {
            j.is_pending() && j.network_id == body.network_id && j.signature == request.signature
        }) {
            return Ok(existing.value().clone());
        }

        match &body.invite_id {
            Some(invite_id) => self.redeem_invite(invite_id, body)?,
            None => {
                if body.proposed_permission > Permission::Member {
                    return Err(AdmissionError::InsufficientPermission(format!(
                        "{} requires an invite",
                        body.proposed_permission
                    )));
                }
            }
        }
        if !body.proposed_permission.is_routable() {
            return Err(AdmissionError::InvalidRequest(format!(
                "cannot request {}",
                body.proposed_permission
            )));
        }

        self.directory.enroll(PeerRecord::new(
            &body.network_id,
            body.requester.public_key,
            &body.requester.endpoint,
        ))?;

        let join = JoinRequest {
            id: uuid::Uuid::new_v4().to_string(),
            kind: JoinKind::Request,
            network_id: body.network_id.clone(),
            requester: body.requester.clone(),
            proposed_permission: body.proposed_permission,
            signature: request.signature.clone(),
            state: JoinState::Pending,
            invite_id: body.invite_id.clone(),
            challenge_id: None,
            created_at: now,
            expires_at: deadline(now, self.config.join_request_ttl()),
        };
        self.supersede_pending(&body.network_id, &body.requester.peer_id, &join.id);
        self.joins.insert(join.id.clone(), join.clone());
        info!(
            network = %join.network_id,
            peer = %join.requester.peer_id,
            permission = %join.proposed_permission,
            "join request recorded"
        );
        Ok(join)
    }

    /// Check an invite against the request redeeming it, then spend it.
    fn redeem_invite(&self, invite_id: &str, body: &JoinRequestBody) -> Result<(), AdmissionError> {
        let invite = self
            .invites
            .get(invite_id)
            .map(|i| i.value().clone())
            .ok_or_else(|| AdmissionError::UnknownInvite(invite_id.to_string()))?;
        if invite.network.id != body.network_id {
            return Err(AdmissionError::UnknownInvite(invite_id.to_string()));
        }
        if Utc::now().timestamp_millis() >= invite.expires_at_ms {
            self.invites.remove(invite_id);
            return Err(AdmissionError::ExpiredInvite);
        }
        if body.proposed_permission > invite.granted_permission {
            return Err(AdmissionError::InsufficientPermission(format!(
                "invite grants {}, request asks for {}",
                invite.granted_permission, body.proposed_permission
            )));
        }
        // Two requests racing for one invite: only the remover wins.
        self.invites
            .remove(invite_id)
            .map(|_| ())
            .ok_or_else(|| AdmissionError::UnknownInvite(invite_id.to_string()))
    }

    /// Refuse a pending join request. Its challenge, if any, can no longer
    /// be solved.
    pub fn reject_join_request(&self, join_id: &str) -> Result<JoinRequest, AdmissionError> {
        let challenge_id = {
            let join = self
                .joins
                .get(join_id)
                .ok_or_else(|| AdmissionError::UnknownJoinRequest(join_id.to_string()))?;
            if !join.is_pending() {
                return Err(AdmissionError::InvalidRequest(format!(
                    "join request {join_id} is not pending"
                )));
            }
            join.challenge_id.clone()
        };
        if let Some(challenge_id) = challenge_id {
            if let Some(mut challenge) = self.challenges.get_mut(&challenge_id) {
                if challenge.state == ChallengeState::Issued {
                    challenge.state = ChallengeState::Expired;
                }
            }
        }
        let mut join = self
            .joins
            .get_mut(join_id)
            .ok_or_else(|| AdmissionError::UnknownJoinRequest(join_id.to_string()))?;
        join.state = JoinState::Rejected;
        info!(join = %join_id, peer = %join.requester.peer_id, "join request rejected");
        Ok(join.value().clone())
    }

    /// Pending requests, oldest first, optionally for one network.
    pub fn pending_requests(&self, network_id: Option<&str>) -> Vec<JoinRequest> {
        let mut out: Vec<_> = self
            .joins
            .iter()
            .filter(|j| j.is_pending() && network_id.map_or(true, |n| j.network_id == n))
            .map(|j| j.value().clone())
            .collect();
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        out
    }

    pub fn get_join_request(&self, join_id: &str) -> Option<JoinRequest> {
        self.joins.get(join_id).map(|j| j.value().clone())
    }

    // -----------------------------------------------------------------------
    // Challenges
    // -----------------------------------------------------------------------

    /// Bind a fresh challenge to `target`'s pending join request in
    /// `network_id`. A challenge still open for that request is replaced.
    pub fn issue_challenge(
        &self,
        network_id: &str,
        target: &PeerId,
    ) -> Result<ChallengeDescriptor, AdmissionError> {
        let network = self.networks.get_network(network_id)?;
        let now = Utc::now();
        let no_request = || AdmissionError::NoPendingJoinRequest {
            network_id: network_id.to_string(),
            peer_id: target.clone(),
        };

        let (join_id, previous) = self
            .joins
            .iter()
            .filter(|j| {
                j.is_pending() && j.network_id == network_id && j.requester.peer_id == *target
            })
            .max_by(|a, b| a.created_at.cmp(&b.created_at))
            .map(|j| (j.id.clone(), j.challenge_id.clone()))
            .ok_or_else(no_request)?;

        if let Some(previous) = previous {
            if let Some(mut old) = self.challenges.get_mut(&previous) {
                if old.state == ChallengeState::Issued {
                    old.state = ChallengeState::Expired;
                }
            }
        }

        let mut seed = [0u8; CHALLENGE_PREFIX_BYTES];
        rand::thread_rng().fill_bytes(&mut seed);
        let challenge = Challenge {
            id: uuid::Uuid::new_v4().to_string(),
            network_id: network_id.to_string(),
            issuer: self.kms.peer_id(),
            target: target.clone(),
            prefix: hex::encode(seed),
            difficulty: network.difficulty,
            issued_at: now,
            expires_at: deadline(now, self.config.challenge_ttl()),
            state: ChallengeState::Issued,
            solved_nonce: None,
            join_request_id: join_id.clone(),
        };
        let descriptor = challenge.descriptor();
        self.challenges.insert(challenge.id.clone(), challenge);

        {
            let mut join = self.joins.get_mut(&join_id).ok_or_else(no_request)?;
            if join.expires_at <= now {
                join.state = JoinState::Expired;
            }
            if !join.is_pending() {
                drop(join);
                if let Some(mut orphan) = self.challenges.get_mut(&descriptor.challenge_id) {
                    orphan.state = ChallengeState::Expired;
                }
                return Err(no_request());
            }
            join.challenge_id = Some(descriptor.challenge_id.clone());
        }

        info!(
            network = %network_id,
            peer = %target,
            challenge = %descriptor.challenge_id,
            difficulty = descriptor.difficulty,
            "challenge issued"
        );
        Ok(descriptor)
    }

    pub fn get_challenge(&self, challenge_id: &str) -> Option<Challenge> {
        self.challenges.get(challenge_id).map(|c| c.value().clone())
    }

    /// Verify `nonce` against a challenge and admit its target.
    pub fn submit_proof(
        &self,
        challenge_id: &str,
        nonce: &[u8],
    ) -> Result<PeerRecord, AdmissionError> {
        self.submit_proof_at(challenge_id, nonce, Utc::now())
    }

    /// [`submit_proof`](Self::submit_proof) with an explicit clock.
    pub fn submit_proof_at(
        &self,
        challenge_id: &str,
        nonce: &[u8],
        now: DateTime<Utc>,
    ) -> Result<PeerRecord, AdmissionError> {
        let (record, kind) = {
            let mut challenge = self
                .challenges
                .get_mut(challenge_id)
                .ok_or_else(|| AdmissionError::UnknownChallenge(challenge_id.to_string()))?;

            match challenge.state {
                ChallengeState::Issued => {}
                ChallengeState::Verified => return Err(AdmissionError::ReusedNonce),
                ChallengeState::Expired => return Err(AdmissionError::ExpiredChallenge),
                ChallengeState::Failed => return Err(AdmissionError::InvalidProof),
            }
            if challenge.is_expired_at(now) {
                challenge.state = ChallengeState::Expired;
                return Err(AdmissionError::ExpiredChallenge);
            }
            if !self
                .solver
                .verify(challenge.prefix.as_bytes(), nonce, challenge.difficulty)
            {
                challenge.state = ChallengeState::Failed;
                warn!(challenge = %challenge_id, peer = %challenge.target, "invalid proof");
                return Err(AdmissionError::InvalidProof);
            }

            let mut join = self
                .joins
                .get_mut(&challenge.join_request_id)
                .filter(|j| j.is_pending())
                .ok_or_else(|| AdmissionError::NoPendingJoinRequest {
                    network_id: challenge.network_id.clone(),
                    peer_id: challenge.target.clone(),
                })?;

            let key = PeerKey::new(challenge.network_id.clone(), challenge.target.clone());
            let grant = AdmissionGrant::new(key, join.proposed_permission, challenge_id.to_string());
            let record = self.directory.apply_grant(grant)?;

            challenge.state = ChallengeState::Verified;
            challenge.solved_nonce = Some(nonce.to_vec());
            join.state = JoinState::Accepted;
            (record, join.kind)
        };

        if kind == JoinKind::Invite {
            if let Ok(network) = self.networks.get_network(&record.network_id) {
                if network.state == NetworkState::Pending {
                    self.networks
                        .set_state(&record.network_id, NetworkState::Active)?;
                }
            }
        }
        info!(
            network = %record.network_id,
            peer = %record.peer_id,
            permission = %record.permission,
            "proof verified"
        );

        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            let connections = self.connections.clone();
            let key = record.key();
            runtime.spawn(async move {
                if let Err(e) = connections.connect(&key).await {
                    debug!(peer = %key, error = %e, "post-admission connect failed");
                }
            });
        }
        Ok(record)
    }

    // -----------------------------------------------------------------------
    // Housekeeping
    // -----------------------------------------------------------------------

    /// Expire everything past its lifetime and drop terminal records that
    /// have outlived it by one more lifetime.
    pub fn expire_stale(&self, now: DateTime<Utc>) -> ExpirySweep {
        let mut sweep = ExpirySweep::default();

        let challenge_ttl = self.config.challenge_ttl();
        for mut challenge in self.challenges.iter_mut() {
            if challenge.state == ChallengeState::Issued && challenge.is_expired_at(now) {
                challenge.state = ChallengeState::Expired;
                sweep.challenges_expired += 1;
            }
        }
        let before = self.challenges.len();
        self.challenges
            .retain(|_, c| !(c.state.is_terminal() && deadline(c.expires_at, challenge_ttl) <= now));
        sweep.purged += before - self.challenges.len();

        let join_ttl = self.config.join_request_ttl();
        for mut join in self.joins.iter_mut() {
            if join.is_pending() && join.expires_at <= now {
                join.state = JoinState::Expired;
                sweep.join_requests_expired += 1;
            }
        }
        let before = self.joins.len();
        self.joins
            .retain(|_, j| j.is_pending() || deadline(j.expires_at, join_ttl) > now);
        sweep.purged += before - self.joins.len();

        let now_ms = now.timestamp_millis();
        let before = self.invites.len();
        self.invites.retain(|_, i| i.expires_at_ms > now_ms);
        sweep.invites_expired = before - self.invites.len();

        if sweep != ExpirySweep::default() {
            debug!(?sweep, "admission sweep");
        }
        sweep
    }
}
