//! # Session Host
//!
//! The accepting half of a session. Every transport's server side (the
//! WebSocket upgrade, the SSE event stream, the in-memory hub) ends up in
//! [`SessionHost::serve`] with a pair of queues.
//!
//! ## State machine
//!
//! ```text
//! AwaitingHandshake --(member/admin)-------------------> Established
//!        |
//!        +--(pending with open join)--> AwaitingProof --(proof ok)--> Established
//!        |                                    |
//!        +--(unknown/revoked/bad proof)-------+--(bad proof)--> closed
//! ```
//!
//! Each state has its own idle bound: the handshake timeout while waiting
//! for the opening handshake, the challenge lifetime while the dialer
//! solves, and the liveness window once established (the dialer pings).

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::dispatch::MessageDispatcher;
use super::handshake::{Expectation, HandshakeProof};
use super::message::{ChallengeAnswer, PeerMessage};
use crate::admission::AdmissionController;
use crate::config::{AdmissionConfig, ConnectionConfig};
use crate::crypto::kms::Kms;
use crate::model::{PeerKey, Permission, TransportKind};
use crate::registry::PeerDirectory;

enum HostState {
    AwaitingHandshake,
    AwaitingProof {
        key: PeerKey,
        challenge_id: String,
        dialer_nonce: String,
    },
    Established {
        key: PeerKey,
    },
}

/// Why a hosted session ended. Only used for logging.
#[derive(Debug)]
enum Close {
    Idle,
    PeerClosed,
    Rejected(String),
}

pub struct SessionHost {
    kms: Arc<dyn Kms>,
    endpoint: String,
    directory: Arc<PeerDirectory>,
    admission: Arc<AdmissionController>,
    dispatcher: Arc<MessageDispatcher>,
    handshake_timeout: Duration,
    proof_timeout: Duration,
    liveness: Duration,
    max_skew: Duration,
}

impl SessionHost {
    pub fn new(
        kms: Arc<dyn Kms>,
        endpoint: impl Into<String>,
        directory: Arc<PeerDirectory>,
        admission: Arc<AdmissionController>,
        dispatcher: Arc<MessageDispatcher>,
        connection: &ConnectionConfig,
        admission_config: &AdmissionConfig,
    ) -> Self {
        Self {
            kms,
            endpoint: endpoint.into(),
            directory,
            admission,
            dispatcher,
            handshake_timeout: connection.handshake_timeout(),
            proof_timeout: admission_config.challenge_ttl(),
            liveness: connection.liveness_window(),
            max_skew: admission_config.max_clock_skew(),
        }
    }

    /// Run one hosted session to completion.
    pub async fn serve(
        self: Arc<Self>,
        transport: TransportKind,
        mut inbound: mpsc::Receiver<PeerMessage>,
        outbound: mpsc::Sender<PeerMessage>,
    ) {
        let mut state = HostState::AwaitingHandshake;
        let reason = loop {
            let idle = match state {
                HostState::AwaitingHandshake => self.handshake_timeout,
                HostState::AwaitingProof { .. } => self.proof_timeout,
                HostState::Established { .. } => self.liveness,
            };
            let message = match tokio::time::timeout(idle, inbound.recv()).await {
                Ok(Some(message)) => message,
                Ok(None) => break Close::PeerClosed,
                Err(_) => break Close::Idle,
            };

            let current = std::mem::replace(&mut state, HostState::AwaitingHandshake);
            let step = match current {
                HostState::AwaitingHandshake => self.on_opening(message),
                HostState::AwaitingProof {
                    key,
                    challenge_id,
                    dialer_nonce,
                } => self.on_proof(message, key, challenge_id, dialer_nonce),
                HostState::Established { key } => self.on_established(message, key),
            };

            match step {
                Ok((next, reply)) => {
                    if let Some(reply) = reply {
                        if outbound.send(reply).await.is_err() {
                            break Close::PeerClosed;
                        }
                    }
                    state = next;
                }
                Err(reason) => break Close::Rejected(reason),
            }
        };

        match (&state, reason) {
            (HostState::Established { key }, reason) => {
                debug!(peer = %key, %transport, ?reason, "hosted session ended")
            }
            (_, Close::Rejected(reason)) => {
                warn!(%transport, %reason, "hosted session rejected")
            }
            (_, reason) => debug!(%transport, ?reason, "hosted session abandoned"),
        }
    }

    fn on_opening(
        &self,
        message: PeerMessage,
    ) -> Result<(HostState, Option<PeerMessage>), String> {
        let PeerMessage::Handshake(proof) = message else {
            return Err(format!("expected handshake, got {}", message.kind()));
        };
        proof
            .verify(self.kms.as_ref(), &Expectation::default(), self.max_skew)
            .map_err(|e| e.to_string())?;

        let intro = &proof.body.peer;
        let key = PeerKey::new(proof.body.network_id.clone(), intro.peer_id.clone());
        let record = self
            .directory
            .find_peer(&key)
            .ok_or_else(|| format!("{key} is not known here"))?;
        if record.public_key != intro.public_key {
            return Err(format!("{key} presented a different key than recorded"));
        }

        match record.permission {
            p if p.is_routable() => {
                let reply = self.reply_to(&key, &proof.body.nonce)?;
                info!(peer = %key, "hosted session established");
                Ok((HostState::Established { key }, Some(reply)))
            }
            Permission::Pending => {
                let descriptor = self
                    .admission
                    .issue_challenge(&key.network_id, &key.peer_id)
                    .map_err(|e| e.to_string())?;
                debug!(peer = %key, challenge = %descriptor.challenge_id, "challenging pending peer");
                let next = HostState::AwaitingProof {
                    key,
                    challenge_id: descriptor.challenge_id.clone(),
                    dialer_nonce: proof.body.nonce.clone(),
                };
                Ok((next, Some(PeerMessage::Challenge(descriptor))))
            }
            _ => Err(format!("{key} is revoked")),
        }
    }

    fn on_proof(
        &self,
        message: PeerMessage,
        key: PeerKey,
        challenge_id: String,
        dialer_nonce: String,
    ) -> Result<(HostState, Option<PeerMessage>), String> {
        match message {
            PeerMessage::ChallengeResponse(ChallengeAnswer {
                challenge_id: answered,
                nonce,
            }) => {
                if answered != challenge_id {
                    return Err(format!("answer for unknown challenge {answered}"));
                }
                let nonce = hex::decode(&nonce).map_err(|_| "nonce is not hex".to_string())?;
                self.admission
                    .submit_proof(&challenge_id, &nonce)
                    .map_err(|e| e.to_string())?;
                let reply = self.reply_to(&key, &dialer_nonce)?;
                info!(peer = %key, "peer admitted in-band");
                Ok((HostState::Established { key }, Some(reply)))
            }
            PeerMessage::Heartbeat(_) => {
                let reply = self.dispatcher.dispatch(&key, message);
                Ok((
                    HostState::AwaitingProof {
                        key,
                        challenge_id,
                        dialer_nonce,
                    },
                    reply,
                ))
            }
            other => Err(format!("expected challenge_response, got {}", other.kind())),
        }
    }

    fn on_established(
        &self,
        message: PeerMessage,
        key: PeerKey,
    ) -> Result<(HostState, Option<PeerMessage>), String> {
        // Revocation takes effect on the next message.
        let still_admitted = self
            .directory
            .find_peer(&key)
            .is_some_and(|r| r.permission.is_routable());
        if !still_admitted {
            return Err(format!("{key} is no longer admitted"));
        }
        let reply = self.dispatcher.dispatch(&key, message);
        Ok((HostState::Established { key }, reply))
    }

    fn reply_to(&self, key: &PeerKey, dialer_nonce: &str) -> Result<PeerMessage, String> {
        HandshakeProof::create(
            self.kms.as_ref(),
            &key.network_id,
            &self.endpoint,
            Some(dialer_nonce.to_string()),
        )
        .map(PeerMessage::Handshake)
        .map_err(|e| e.to_string())
    }
}
