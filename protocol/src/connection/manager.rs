//! # ConnectionManager
//!
//! Owns the one live session per peer and every write to a peer's
//! connection state.
//!
//! ```text
//!                 connect()
//! disconnected ──────────────> connecting ──(primary ok)──> connected_primary
//!      ^                           │
//!      │                           └──(primary fails)──> fallback ──> connected_fallback
//!      │                                                     │
//!      └──────(both fail / session lost / missed heartbeats)─┘
//!               schedule reconnect with backoff
//!               after max attempts ──> failed
//! ```
//!
//! Every session gets two tasks: a reader that routes replies to waiting
//! requests and everything else to the [`MessageDispatcher`], and a
//! heartbeat that pings on an interval and declares the session lost when
//! the peer has been silent for the liveness window.
//!
//! A session is removed from the table by whoever ends it, and only the
//! remover acts on the loss. That keeps eviction, revocation and a dying
//! transport from each scheduling their own reconnect.

use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use super::backoff::Backoff;
use super::session::{Session, SessionInfo};
use super::ConnectionError;
use crate::config::ConnectionConfig;
use crate::crypto::kms::Kms;
use crate::crypto::pow::{self, PowSolver};
use crate::model::{
    ChallengeDescriptor, ConnectionState, PeerKey, PeerRecord, TransportKind,
};
use crate::registry::PeerDirectory;
use crate::transport::handshake::{Expectation, HandshakeProof};
use crate::transport::message::{
    ChallengeAnswer, DataBody, DataFrame, DataRequest, HeartbeatKind, PeerMessage,
};
use crate::transport::{Channel, Connector, MessageDispatcher, TransportError};

struct ReconnectHandle {
    id: u64,
    cancel: watch::Sender<bool>,
}

struct Inner {
    config: ConnectionConfig,
    kms: Arc<dyn Kms>,
    endpoint: String,
    max_skew: Duration,
    solver: Arc<dyn PowSolver>,
    max_solve_difficulty: u32,
    directory: Arc<PeerDirectory>,
    dispatcher: Arc<MessageDispatcher>,
    primary: Arc<dyn Connector>,
    fallback: Arc<dyn Connector>,
    sessions: DashMap<PeerKey, Arc<Session>>,
    reconnects: DashMap<PeerKey, ReconnectHandle>,
    next_id: AtomicU64,
}

/// Cheap to clone; clones share the session table.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

/// Everything the manager is built from.
pub struct ConnectionDeps {
    pub config: ConnectionConfig,
    pub kms: Arc<dyn Kms>,
    pub endpoint: String,
    pub max_skew: Duration,
    pub solver: Arc<dyn PowSolver>,
    /// Hardest in-band challenge a host may hand us.
    pub max_solve_difficulty: u32,
    pub directory: Arc<PeerDirectory>,
    pub dispatcher: Arc<MessageDispatcher>,
    pub primary: Arc<dyn Connector>,
    pub fallback: Arc<dyn Connector>,
}

impl ConnectionManager {
    pub fn new(deps: ConnectionDeps) -> Self {
        Self {
            inner: Arc::new(Inner {
                config: deps.config,
                kms: deps.kms,
                endpoint: deps.endpoint,
                max_skew: deps.max_skew,
                solver: deps.solver,
                max_solve_difficulty: deps.max_solve_difficulty,
                directory: deps.directory,
                dispatcher: deps.dispatcher,
                primary: deps.primary,
                fallback: deps.fallback,
                sessions: DashMap::new(),
                reconnects: DashMap::new(),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    fn next_id(&self) -> u64 {
        self.inner.next_id.fetch_add(1, Ordering::Relaxed)
    }

    // -----------------------------------------------------------------------
    // Connect
    // -----------------------------------------------------------------------

    /// Bring a session up with `key`, primary first, then fallback.
    ///
    /// Idempotent: a peer that is already connecting or connected is left
    /// alone and its current state returned. A `failed` peer stays failed
    /// until [`reset_failed`](Self::reset_failed) or re-admission.
    ///
    /// When both transports fail the peer goes back to `disconnected`, a
    /// backoff reconnect is scheduled, and the error is returned.
    pub async fn connect(&self, key: &PeerKey) -> Result<ConnectionState, ConnectionError> {
        let record = self.inner.directory.get_peer(key)?;
        if !record.permission.is_routable() {
            return Err(ConnectionError::NotAdmitted(key.clone()));
        }
        if record.connection != ConnectionState::Disconnected {
            return Ok(record.connection);
        }
        if !self.inner.directory.try_begin_connect(key)? {
            return Ok(self.inner.directory.get_peer(key)?.connection);
        }
        self.cancel_reconnect(key);

        match self.establish(&record).await {
            Ok(state) => Ok(state),
            Err(e) => {
                let _ = self
                    .inner
                    .directory
                    .set_connection_state(key, ConnectionState::Disconnected);
                warn!(peer = %key, error = %e, "connect failed on both transports");
                self.schedule_reconnect(key.clone());
                Err(e)
            }
        }
    }

    /// Try primary, then fallback. The caller has already moved the peer
    /// to `connecting`.
    async fn establish(&self, record: &PeerRecord) -> Result<ConnectionState, ConnectionError> {
        let key = record.key();
        let primary = self.inner.primary.clone();
        match self.open_session(primary.as_ref(), record).await {
            Ok(channel) => return Ok(self.install(key, channel, TransportKind::Primary)),
            Err(e) => debug!(peer = %key, error = %e, "primary transport failed, falling back"),
        }

        let fallback = self.inner.fallback.clone();
        let channel = self.open_session(fallback.as_ref(), record).await?;
        Ok(self.install(key, channel, TransportKind::Fallback))
    }

    /// Open a raw channel and run the dialer half of the handshake on it,
    /// solving an in-band challenge if the host asks for one. The
    /// transport's timeout bounds the network waits; solving is bounded by
    /// the challenge's own expiry.
    async fn open_session(
        &self,
        connector: &dyn Connector,
        record: &PeerRecord,
    ) -> Result<Channel, ConnectionError> {
        let kind = connector.kind();
        let limit = match kind {
            TransportKind::Primary => self.inner.config.handshake_timeout(),
            TransportKind::Fallback => self.inner.config.fallback_timeout(),
        };
        let key = record.key();
        let opening =
            HandshakeProof::create(self.inner.kms.as_ref(), &key.network_id, &self.inner.endpoint, None)?;
        let nonce = opening.body.nonce.clone();

        let (mut channel, first) = timeout(limit, async {
            let mut channel = connector.open(record).await?;
            channel
                .outbound
                .send(PeerMessage::Handshake(opening))
                .await
                .map_err(|_| TransportError::Closed)?;
            let first = next_control(&mut channel).await?;
            Ok::<_, ConnectionError>((channel, first))
        })
        .await
        .map_err(|_| ConnectionError::ConnectTimeout(kind))??;

        let reply = match first {
            PeerMessage::Handshake(reply) => reply,
            PeerMessage::Challenge(descriptor) => {
                self.answer_challenge(&mut channel, &key, descriptor).await?;
                match timeout(limit, next_control(&mut channel))
                    .await
                    .map_err(|_| ConnectionError::ConnectTimeout(kind))??
                {
                    PeerMessage::Handshake(reply) => reply,
                    other => {
                        return Err(ConnectionError::HandshakeFailed(format!(
                            "expected handshake after proof, got {}",
                            other.kind()
                        )))
                    }
                }
            }
            other => {
                return Err(ConnectionError::HandshakeFailed(format!(
                    "expected handshake, got {}",
                    other.kind()
                )))
            }
        };

        reply
            .verify(
                self.inner.kms.as_ref(),
                &Expectation {
                    network_id: Some(&key.network_id),
                    public_key: Some(&record.public_key),
                    responding_to: Some(&nonce),
                },
                self.inner.max_skew,
            )
            .map_err(|e| ConnectionError::HandshakeFailed(e.to_string()))?;
        Ok(channel)
    }

    async fn answer_challenge(
        &self,
        channel: &mut Channel,
        key: &PeerKey,
        descriptor: ChallengeDescriptor,
    ) -> Result<(), ConnectionError> {
        if descriptor.network_id != key.network_id {
            return Err(ConnectionError::HandshakeFailed(
                "challenge is for another network".to_string(),
            ));
        }
        let limit = self.inner.max_solve_difficulty;
        if descriptor.difficulty > limit {
            warn!(
                peer = %key,
                difficulty = descriptor.difficulty,
                limit,
                "refusing in-band challenge above the solve limit"
            );
            return Err(ConnectionError::HandshakeFailed(format!(
                "challenge difficulty {} is above the solve limit of {limit}",
                descriptor.difficulty
            )));
        }
        let remaining = (descriptor.expires_at - chrono::Utc::now())
            .to_std()
            .map_err(|_| ConnectionError::HandshakeFailed("challenge already expired".into()))?;
        debug!(peer = %key, difficulty = descriptor.difficulty, "solving in-band challenge");

        let nonce = timeout(
            remaining,
            pow::solve_detached(
                self.inner.solver.clone(),
                descriptor.prefix.clone().into_bytes(),
                descriptor.difficulty,
            ),
        )
        .await
        .map_err(|_| ConnectionError::HandshakeFailed("challenge expired while solving".into()))??;

        channel
            .outbound
            .send(PeerMessage::ChallengeResponse(ChallengeAnswer {
                challenge_id: descriptor.challenge_id,
                nonce: hex::encode(nonce),
            }))
            .await
            .map_err(|_| TransportError::Closed)?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Session lifecycle
    // -----------------------------------------------------------------------

    fn install(&self, key: PeerKey, channel: Channel, kind: TransportKind) -> ConnectionState {
        self.evict_if_full(&key);

        let session = Arc::new(Session::new(self.next_id(), key.clone(), kind, channel.outbound));
        if let Some(old) = self.inner.sessions.insert(key.clone(), session.clone()) {
            old.close();
        }
        let state = ConnectionState::connected(kind);
        let _ = self.inner.directory.set_connection_state(&key, state);
        info!(peer = %key, transport = %kind, "session established");

        tokio::spawn(self.clone().read_loop(session.clone(), channel.inbound));
        tokio::spawn(self.clone().heartbeat_loop(session));
        state
    }

    /// Make room for one more session by closing the least recently active
    /// one. The evicted peer is left `disconnected` with no reconnect.
    fn evict_if_full(&self, incoming: &PeerKey) {
        let max = self.inner.config.max_sessions;
        while self.inner.sessions.len() >= max && !self.inner.sessions.contains_key(incoming) {
            let oldest = self
                .inner
                .sessions
                .iter()
                .min_by_key(|s| s.value().last_active())
                .map(|s| s.key().clone());
            let Some(victim) = oldest else { return };
            if let Some((_, session)) = self.inner.sessions.remove(&victim) {
                session.close();
                let _ = self
                    .inner
                    .directory
                    .set_connection_state(&victim, ConnectionState::Disconnected);
                info!(peer = %victim, "evicted least recently active session");
            }
        }
    }

    async fn read_loop(
        self,
        session: Arc<Session>,
        mut inbound: tokio::sync::mpsc::Receiver<PeerMessage>,
    ) {
        let mut closed = session.closed_signal();
        loop {
            let message = tokio::select! {
                message = inbound.recv() => message,
                _ = closed.changed() => None,
            };
            let Some(message) = message else { break };
            session.touch_inbound();

            match message {
                PeerMessage::Data(DataFrame {
                    reply_to: Some(reply_to),
                    body,
                    ..
                }) => {
                    if !session.complete(reply_to, body) {
                        debug!(peer = %session.key(), frame = reply_to, "late reply dropped");
                    }
                }
                PeerMessage::Heartbeat(beat) if beat.kind == HeartbeatKind::Pong => {}
                other => {
                    if let Some(reply) = self.inner.dispatcher.dispatch(session.key(), other) {
                        if session.send(reply).await.is_err() {
                            break;
                        }
                    }
                }
            }
        }
        self.session_lost(&session, "transport closed");
    }

    async fn heartbeat_loop(self, session: Arc<Session>) {
        let window = self.inner.config.liveness_window();
        let mut ticker = tokio::time::interval(self.inner.config.heartbeat_interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;
        let mut closed = session.closed_signal();

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = closed.changed() => return,
            }
            if session.is_closed() {
                return;
            }
            if session.idle_for() >= window {
                warn!(peer = %session.key(), idle_ms = session.idle_for().as_millis() as u64, "missed heartbeats");
                self.session_lost(&session, "missed heartbeats");
                return;
            }
            if session.send(PeerMessage::ping()).await.is_err() {
                self.session_lost(&session, "heartbeat send failed");
                return;
            }
        }
    }

    /// Handle a session dying on its own. A no-op if someone else already
    /// took it out of the table.
    fn session_lost(&self, session: &Arc<Session>, reason: &str) {
        let removed = self
            .inner
            .sessions
            .remove_if(session.key(), |_, current| current.id() == session.id());
        if removed.is_none() {
            return;
        }
        session.close();
        let key = session.key().clone();
        let _ = self
            .inner
            .directory
            .set_connection_state(&key, ConnectionState::Disconnected);
        warn!(peer = %key, reason, "session lost");
        self.schedule_reconnect(key);
    }

    // -----------------------------------------------------------------------
    // Reconnect
    // -----------------------------------------------------------------------

    fn schedule_reconnect(&self, key: PeerKey) {
        let (cancel, cancelled) = watch::channel(false);
        let id = self.next_id();
        if let Some(previous) = self
            .inner
            .reconnects
            .insert(key.clone(), ReconnectHandle { id, cancel })
        {
            let _ = previous.cancel.send(true);
        }
        tokio::spawn(self.clone().reconnect_loop(key, id, cancelled));
    }

    fn cancel_reconnect(&self, key: &PeerKey) -> bool {
        match self.inner.reconnects.remove(key) {
            Some((_, handle)) => {
                let _ = handle.cancel.send(true);
                debug!(peer = %key, "reconnect cancelled");
                true
            }
            None => false,
        }
    }

    fn clear_reconnect(&self, key: &PeerKey, id: u64) {
        self.inner.reconnects.remove_if(key, |_, h| h.id == id);
    }

    async fn reconnect_loop(self, key: PeerKey, id: u64, mut cancelled: watch::Receiver<bool>) {
        let config = &self.inner.config;
        let backoff = Backoff::new(config.reconnect_base(), config.reconnect_max());
        let attempts = config.max_reconnect_attempts;

        for attempt in 1..=attempts {
            let delay = backoff.delay(attempt);
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = wait_cancelled(&mut cancelled) => return,
            }

            let record = match self.inner.directory.find_peer(&key) {
                Some(record) if record.permission.is_routable() => record,
                _ => {
                    self.clear_reconnect(&key, id);
                    return;
                }
            };
            match self.inner.directory.try_begin_connect(&key) {
                Ok(true) => {}
                // Someone else is connecting or connected.
                _ => {
                    self.clear_reconnect(&key, id);
                    return;
                }
            }

            debug!(peer = %key, attempt, "reconnecting");
            let result = tokio::select! {
                result = self.establish(&record) => result,
                _ = wait_cancelled(&mut cancelled) => {
                    let _ = self.inner.directory.set_connection_state(&key, ConnectionState::Disconnected);
                    return;
                }
            };
            match result {
                Ok(state) => {
                    info!(peer = %key, attempt, %state, "reconnected");
                    self.clear_reconnect(&key, id);
                    return;
                }
                Err(e) => {
                    let _ = self
                        .inner
                        .directory
                        .set_connection_state(&key, ConnectionState::Disconnected);
                    debug!(peer = %key, attempt, error = %e, "reconnect attempt failed");
                }
            }
        }

        let _ = self
            .inner
            .directory
            .set_connection_state(&key, ConnectionState::Failed);
        warn!(peer = %key, attempts, "giving up on peer");
        self.clear_reconnect(&key, id);
    }

    // -----------------------------------------------------------------------
    // Traffic and control
    // -----------------------------------------------------------------------

    /// Forward a request over the peer's live session.
    pub async fn send(
        &self,
        key: &PeerKey,
        request: DataRequest,
        timeout: Duration,
    ) -> Result<serde_json::Value, ConnectionError> {
        let session = self
            .inner
            .sessions
            .get(key)
            .map(|s| s.value().clone())
            .ok_or_else(|| ConnectionError::Unreachable(key.clone()))?;
        session.request(request, timeout).await
    }

    /// Tear down the session with `key` and stop trying to reconnect.
    pub fn disconnect(&self, key: &PeerKey) {
        self.cancel_reconnect(key);
        if let Some((_, session)) = self.inner.sessions.remove(key) {
            session.close();
            info!(peer = %key, "session closed");
        }
        if let Some(record) = self.inner.directory.find_peer(key) {
            if record.connection != ConnectionState::Failed {
                let _ = self
                    .inner
                    .directory
                    .set_connection_state(key, ConnectionState::Disconnected);
            }
        }
    }

    /// Clear a `failed` peer and try again.
    pub async fn reset_failed(&self, key: &PeerKey) -> Result<ConnectionState, ConnectionError> {
        let record = self.inner.directory.get_peer(key)?;
        if record.connection == ConnectionState::Failed {
            self.inner
                .directory
                .set_connection_state(key, ConnectionState::Disconnected)?;
        }
        self.connect(key).await
    }

    /// Close every session and cancel every reconnect.
    pub fn shutdown(&self) {
        let keys: Vec<_> = self.inner.reconnects.iter().map(|r| r.key().clone()).collect();
        for key in keys {
            self.cancel_reconnect(&key);
        }
        let keys: Vec<_> = self.inner.sessions.iter().map(|s| s.key().clone()).collect();
        for key in keys {
            self.disconnect(&key);
        }
        info!("connection manager stopped");
    }

    pub fn connected_count(&self) -> usize {
        self.inner.sessions.len()
    }

    pub fn session_info(&self, key: &PeerKey) -> Option<SessionInfo> {
        self.inner.sessions.get(key).map(|s| s.value().info())
    }

    pub fn reconnect_pending(&self, key: &PeerKey) -> bool {
        self.inner.reconnects.contains_key(key)
    }
}

/// Next message that is not a heartbeat.
async fn next_control(channel: &mut Channel) -> Result<PeerMessage, ConnectionError> {
    loop {
        match channel.inbound.recv().await {
            Some(PeerMessage::Heartbeat(_)) => continue,
            Some(message) => return Ok(message),
            None => return Err(TransportError::Closed.into()),
        }
    }
}

/// Resolves once cancellation is requested or the handle is dropped.
async fn wait_cancelled(cancelled: &mut watch::Receiver<bool>) {
    while !*cancelled.borrow() {
        if cancelled.changed().await.is_err() {
            return;
        }
    }
}
