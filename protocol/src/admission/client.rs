//! The joining side of admission over HTTP.
//!
//! Posts signed join requests and invites to a remote node's service
//! endpoints, solves the challenge that comes back with the local
//! [`PowSolver`], and posts the proof.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use super::wire::{InviteReply, JoinReply, ProofReceipt, ProofSubmission};
use super::AdmissionError;
use crate::config::{SERVICE_INVITE_PATH, SERVICE_JOIN_PATH, SERVICE_PROOF_PATH};
use crate::crypto::pow::{self, PowError, PowSolver};
use crate::model::{ChallengeDescriptor, SignedInvite, SignedJoinRequest};
use crate::transport::http_url;

#[derive(Clone)]
pub struct AdmissionClient {
    http: reqwest::Client,
    solver: Arc<dyn PowSolver>,
    max_solve_difficulty: u32,
}

impl AdmissionClient {
    pub fn new(
        solver: Arc<dyn PowSolver>,
        max_solve_difficulty: u32,
    ) -> Result<Self, AdmissionError> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| AdmissionError::Remote(e.to_string()))?;
        Ok(Self {
            http,
            solver,
            max_solve_difficulty,
        })
    }

    async fn post<B: Serialize, R: DeserializeOwned>(
        &self,
        endpoint: &str,
        path: &str,
        body: &B,
    ) -> Result<R, AdmissionError> {
        let url = http_url(endpoint, path);
        let response = self
            .http
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(|e| AdmissionError::Remote(format!("{url}: {e}")))?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            let message = serde_json::from_str::<serde_json::Value>(&text)
                .ok()
                .and_then(|v| v.get("error").and_then(|e| e.as_str()).map(str::to_string))
                .unwrap_or(text);
            return Err(AdmissionError::Remote(format!("{status}: {message}")));
        }
        response
            .json()
            .await
            .map_err(|e| AdmissionError::Remote(format!("{url}: malformed reply: {e}")))
    }

    pub async fn post_join(
        &self,
        endpoint: &str,
        request: &SignedJoinRequest,
    ) -> Result<JoinReply, AdmissionError> {
        self.post(endpoint, SERVICE_JOIN_PATH, request).await
    }

    pub async fn post_invite(
        &self,
        endpoint: &str,
        invite: &SignedInvite,
    ) -> Result<InviteReply, AdmissionError> {
        self.post(endpoint, SERVICE_INVITE_PATH, invite).await
    }

    pub async fn post_proof(
        &self,
        endpoint: &str,
        proof: &ProofSubmission,
    ) -> Result<ProofReceipt, AdmissionError> {
        self.post(endpoint, SERVICE_PROOF_PATH, proof).await
    }

    /// Solve a challenge off the async runtime, giving up when it expires.
    /// Challenges above the local solve limit are refused outright.
    pub async fn solve(
        &self,
        challenge: &ChallengeDescriptor,
    ) -> Result<ProofSubmission, AdmissionError> {
        if challenge.difficulty > self.max_solve_difficulty {
            return Err(PowError::AboveSolveLimit {
                difficulty: challenge.difficulty,
                limit: self.max_solve_difficulty,
            }
            .into());
        }
        solve_with(self.solver.clone(), challenge).await
    }
}

/// Solve `challenge` with `solver` before it expires.
pub async fn solve_with(
    solver: Arc<dyn PowSolver>,
    challenge: &ChallengeDescriptor,
) -> Result<ProofSubmission, AdmissionError> {
    let remaining = (challenge.expires_at - chrono::Utc::now())
        .to_std()
        .map_err(|_| AdmissionError::ExpiredChallenge)?;
    debug!(
        challenge = %challenge.challenge_id,
        difficulty = challenge.difficulty,
        "solving challenge"
    );
    let nonce = tokio::time::timeout(
        remaining,
        pow::solve_detached(
            solver,
            challenge.prefix.clone().into_bytes(),
            challenge.difficulty,
        ),
    )
    .await
    .map_err(|_| AdmissionError::ExpiredChallenge)??;
    Ok(ProofSubmission {
        challenge_id: challenge.challenge_id.clone(),
        nonce: hex::encode(nonce),
    })
}
