//! # ProxyRouter
//!
//! Turns a discovery request into a local answer or a forwarded one.
//!
//! ```text
//! 1. network must exist and not be revoked          else NoRouteAvailable
//! 2. local resolver answers?                        -> done, no network call
//! 3. candidates = connectable + connected peers, ranked by RouteScorer
//!    empty?                                         -> NoRouteAvailable
//! 4. for each candidate, best first, each at most once,
//!    at most 1 + retry_budget attempts:
//!       send with min(attempt_timeout, time left)
//!       ok       -> record success, return
//!       timeout  -> record timeout, next
//!       remote   -> record unanswered (reachable, no data), next
//!       other    -> record failure, next
//! 5. out of candidates or budget                    -> AllCandidatesFailed
//! ```
//!
//! The whole walk runs under the caller's deadline. When it passes the
//! in-flight send is dropped, nothing is recorded for that attempt, and
//! the result is `DeadlineExceeded`. Dropping a send only abandons the
//! caller's wait; the session itself stays up.

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::error::RouteError;
use super::resolver::LocalResolver;
use super::scorer::{Outcome, RankedPeer, RouteScorer};
use crate::config::ProxyConfig;
use crate::connection::{ConnectionError, ConnectionManager};
use crate::crypto::keys::PeerId;
use crate::model::{NetworkState, PeerKey};
use crate::registry::PeerDirectory;
use crate::transport::message::DataRequest;

/// Sends one request to one peer. The connection manager is the real one;
/// tests script their own.
#[async_trait]
pub trait Forwarder: Send + Sync {
    async fn forward(
        &self,
        key: &PeerKey,
        request: DataRequest,
        timeout: Duration,
    ) -> Result<Value, ConnectionError>;
}

#[async_trait]
impl Forwarder for ConnectionManager {
    async fn forward(
        &self,
        key: &PeerKey,
        request: DataRequest,
        timeout: Duration,
    ) -> Result<Value, ConnectionError> {
        self.send(key, request, timeout).await
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ServedBy {
    Local,
    Peer { peer_id: PeerId },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProxyResponse {
    pub served_by: ServedBy,
    pub payload: Value,
    /// Forwarding attempts made; zero when answered locally.
    pub attempts: u32,
}

pub struct ProxyRouter {
    config: ProxyConfig,
    directory: Arc<PeerDirectory>,
    scorer: Arc<RouteScorer>,
    resolver: Arc<dyn LocalResolver>,
    forwarder: Arc<dyn Forwarder>,
}

impl ProxyRouter {
    pub fn new(
        config: ProxyConfig,
        directory: Arc<PeerDirectory>,
        scorer: Arc<RouteScorer>,
        resolver: Arc<dyn LocalResolver>,
        forwarder: Arc<dyn Forwarder>,
    ) -> Self {
        Self {
            config,
            directory,
            scorer,
            resolver,
            forwarder,
        }
    }

    pub fn config(&self) -> &ProxyConfig {
        &self.config
    }

    /// Answer `request` before `deadline`.
    pub async fn route(
        &self,
        request: DataRequest,
        deadline: Instant,
    ) -> Result<ProxyResponse, RouteError> {
        let network_id = request.network_id.clone();
        let routable = self
            .directory
            .networks()
            .get_network(&network_id)
            .map(|n| n.state != NetworkState::Revoked)
            .unwrap_or(false);
        if !routable {
            return Err(RouteError::NoRouteAvailable { network_id });
        }

        if let Some(payload) = self.resolver.resolve(&request) {
            debug!(network = %network_id, address = %request.address, "answered locally");
            return Ok(ProxyResponse {
                served_by: ServedBy::Local,
                payload,
                attempts: 0,
            });
        }

        if Instant::now() >= deadline {
            return Err(RouteError::DeadlineExceeded { attempts: 0 });
        }

        let connected: Vec<_> = self
            .directory
            .list_connectable_peers(&network_id)
            .into_iter()
            .filter(|p| p.connection.is_connected())
            .collect();
        let candidates = self.scorer.ranked_candidates(connected);
        if candidates.is_empty() {
            debug!(network = %network_id, "no connected candidates");
            return Err(RouteError::NoRouteAvailable { network_id });
        }

        let mut attempts = 0u32;
        let walk = self.try_candidates(&request, candidates, deadline, &mut attempts);
        let result = match tokio::time::timeout_at(deadline, walk).await {
            Ok(result) => result,
            Err(_) => Err(RouteError::DeadlineExceeded { attempts }),
        };

        match &result {
            Ok(response) => info!(
                network = %network_id,
                address = %request.address,
                attempts = response.attempts,
                "request proxied"
            ),
            Err(e) => warn!(network = %network_id, address = %request.address, error = %e, "proxy failed"),
        }
        result
    }

    async fn try_candidates(
        &self,
        request: &DataRequest,
        candidates: Vec<RankedPeer>,
        deadline: Instant,
        attempts: &mut u32,
    ) -> Result<ProxyResponse, RouteError> {
        let max_attempts = self.config.retry_budget.saturating_add(1);
        let mut last_error = String::from("no attempt made");

        for candidate in candidates {
            if *attempts >= max_attempts {
                break;
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(RouteError::DeadlineExceeded {
                    attempts: *attempts,
                });
            }
            let budget = self.config.attempt_timeout().min(deadline - now);
            let key = candidate.record.key();
            *attempts += 1;

            let started = Instant::now();
            match self.forwarder.forward(&key, request.clone(), budget).await {
                Ok(payload) => {
                    let latency = started.elapsed();
                    self.scorer.record_outcome(&key, Outcome::Success { latency });
                    return Ok(ProxyResponse {
                        served_by: ServedBy::Peer {
                            peer_id: key.peer_id,
                        },
                        payload,
                        attempts: *attempts,
                    });
                }
                Err(ConnectionError::Timeout) => {
                    if Instant::now() >= deadline {
                        return Err(RouteError::DeadlineExceeded {
                            attempts: *attempts,
                        });
                    }
                    self.scorer.record_outcome(&key, Outcome::Timeout);
                    debug!(peer = %key, score = candidate.score, "candidate timed out");
                    last_error = format!("{} timed out", key);
                }
                Err(ConnectionError::Remote(message)) => {
                    let latency = started.elapsed();
                    self.scorer
                        .record_outcome(&key, Outcome::Unanswered { latency });
                    debug!(peer = %key, %message, "candidate could not answer");
                    last_error = message;
                }
                Err(e) => {
                    self.scorer.record_outcome(&key, Outcome::Failure);
                    debug!(peer = %key, error = %e, "candidate failed");
                    last_error = e.to_string();
                }
            }
        }

        Err(RouteError::AllCandidatesFailed {
            attempts: *attempts,
            last_error,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCache;
    use crate::config::ScoringConfig;
    use crate::crypto::keys::NodeKeypair;
    use crate::model::{ConnectionState, PeerRecord, Permission};
    use crate::registry::{AdmissionGrant, NetworkRegistry, NewNetwork};
    use crate::routing::DataIndex;
    use crate::storage::{MemoryStore, Store};
    use parking_lot::Mutex;
    use serde_json::json;
    use std::collections::HashMap;

    #[derive(Clone)]
    enum Script {
        Answer(Value),
        Hang,
        Fail,
        Remote(&'static str),
    }

    #[derive(Default)]
    struct ScriptedForwarder {
        scripts: Mutex<HashMap<PeerKey, Script>>,
        calls: Mutex<Vec<PeerKey>>,
    }

    #[async_trait]
    impl Forwarder for ScriptedForwarder {
        async fn forward(
            &self,
            key: &PeerKey,
            _request: DataRequest,
            timeout: Duration,
        ) -> Result<Value, ConnectionError> {
            self.calls.lock().push(key.clone());
            let script = self.scripts.lock().get(key).cloned();
            match script {
                Some(Script::Answer(v)) => Ok(v),
                Some(Script::Hang) => {
                    tokio::time::sleep(timeout).await;
                    Err(ConnectionError::Timeout)
                }
                Some(Script::Remote(m)) => Err(ConnectionError::Remote(m.to_string())),
                Some(Script::Fail) | None => Err(ConnectionError::Unreachable(key.clone())),
            }
        }
    }

    struct Fixture {
        router: ProxyRouter,
        forwarder: Arc<ScriptedForwarder>,
        scorer: Arc<RouteScorer>,
        directory: Arc<PeerDirectory>,
        index: Arc<DataIndex>,
        network_id: String,
    }

    fn fixture(retry_budget: u32) -> Fixture {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let networks = Arc::new(NetworkRegistry::load(store.clone(), 4).unwrap());
        let network_id = networks.create_network(NewNetwork::default()).unwrap().id;
        let directory = Arc::new(PeerDirectory::load(store, networks).unwrap());
        let scorer = Arc::new(RouteScorer::new(
            &ScoringConfig::default(),
            Arc::new(MemoryCache::with_capacity(64)),
            directory.clone(),
        ));
        let index = Arc::new(DataIndex::new());
        let forwarder = Arc::new(ScriptedForwarder::default());
        let config = ProxyConfig {
            attempt_timeout_ms: 100,
            retry_budget,
            default_deadline_ms: 1_000,
        };
        let router = ProxyRouter::new(
            config,
            directory.clone(),
            scorer.clone(),
            index.clone(),
            forwarder.clone(),
        );
        Fixture {
            router,
            forwarder,
            scorer,
            directory,
            index,
            network_id,
        }
    }

    impl Fixture {
        /// A connected member whose score has been driven to roughly `score`.
        fn peer(&self, score: f64, script: Script) -> PeerKey {
            let record = self
                .directory
                .enroll(PeerRecord::new(
                    &self.network_id,
                    NodeKeypair::generate().public_key(),
                    "mem://peer",
                ))
                .unwrap();
            let key = record.key();
            self.directory
                .apply_grant(AdmissionGrant::new(key.clone(), Permission::Member, "c".into()))
                .unwrap();
            self.directory
                .set_connection_state(&key, ConnectionState::ConnectedPrimary)
                .unwrap();
            for _ in 0..40 {
                self.scorer.record_sample(&key, score);
            }
            self.forwarder.scripts.lock().insert(key.clone(), script);
            key
        }

        fn request(&self) -> DataRequest {
            DataRequest {
                network_id: self.network_id.clone(),
                address: "books/1".into(),
                payload: Value::Null,
            }
        }
    }

    fn in_ms(ms: u64) -> Instant {
        Instant::now() + Duration::from_millis(ms)
    }

    #[tokio::test]
    async fn local_answers_skip_the_network() {
        let f = fixture(2);
        f.peer(0.9, Script::Answer(json!("remote")));
        f.index.publish(&f.network_id, "books/1", json!("local"));

        let response = f.router.route(f.request(), in_ms(500)).await.unwrap();
        assert_eq!(response.served_by, ServedBy::Local);
        assert_eq!(response.payload, json!("local"));
        assert!(f.forwarder.calls.lock().is_empty());
    }

    #[tokio::test]
    async fn no_connected_candidates_means_no_route() {
        let f = fixture(2);
        let key = f.peer(0.9, Script::Answer(json!(1)));
        f.directory
            .set_connection_state(&key, ConnectionState::Disconnected)
            .unwrap();

        let err = f.router.route(f.request(), in_ms(500)).await.unwrap_err();
        assert!(matches!(err, RouteError::NoRouteAvailable { .. }));
        assert!(f.forwarder.calls.lock().is_empty());
    }

    #[tokio::test]
    async fn unknown_network_means_no_route() {
        let f = fixture(2);
        let mut request = f.request();
        request.network_id = "elsewhere".into();
        let err = f.router.route(request, in_ms(500)).await.unwrap_err();
        assert!(matches!(err, RouteError::NoRouteAvailable { .. }));
    }

    #[tokio::test]
    async fn timeout_on_best_peer_falls_through_to_next() {
        let f = fixture(2);
        let best = f.peer(0.9, Script::Hang);
        let middle = f.peer(0.5, Script::Answer(json!({"found": true})));
        let worst = f.peer(0.2, Script::Answer(json!("unused")));

        let best_before = f.scorer.score(&best);
        let middle_before = f.scorer.score(&middle);
        let response = f.router.route(f.request(), in_ms(2_000)).await.unwrap();

        assert_eq!(response.payload, json!({"found": true}));
        assert_eq!(
            response.served_by,
            ServedBy::Peer {
                peer_id: middle.peer_id.clone()
            }
        );
        assert_eq!(response.attempts, 2);
        assert_eq!(*f.forwarder.calls.lock(), vec![best.clone(), middle.clone()]);
        assert!(f.scorer.score(&best) < best_before);
        assert!(f.scorer.score(&middle) > middle_before);
        assert!(!f.forwarder.calls.lock().contains(&worst));
    }

    #[tokio::test]
    async fn retry_budget_bounds_attempts() {
        let f = fixture(1);
        for score in [0.9, 0.8, 0.7] {
            f.peer(score, Script::Fail);
        }
        let err = f.router.route(f.request(), in_ms(1_000)).await.unwrap_err();
        assert!(matches!(
            err,
            RouteError::AllCandidatesFailed { attempts: 2, .. }
        ));
        assert_eq!(f.forwarder.calls.lock().len(), 2);
    }

    #[tokio::test]
    async fn each_candidate_is_tried_once() {
        let f = fixture(10);
        f.peer(0.9, Script::Fail);
        f.peer(0.4, Script::Remote("no record at books/1"));
        let err = f.router.route(f.request(), in_ms(1_000)).await.unwrap_err();
        assert_eq!(
            err,
            RouteError::AllCandidatesFailed {
                attempts: 2,
                last_error: "no record at books/1".into()
            }
        );
    }

    #[tokio::test]
    async fn peer_without_data_stops_ranking_first() {
        let f = fixture(2);
        let empty = f.peer(0.9, Script::Remote("no record at books/1"));
        let useful = f.peer(0.6, Script::Answer(json!("found")));

        for _ in 0..2 {
            let response = f.router.route(f.request(), in_ms(1_000)).await.unwrap();
            assert_eq!(response.payload, json!("found"));
        }
        // First request tries the empty peer first; by the second, the
        // useful one has overtaken it.
        assert_eq!(
            *f.forwarder.calls.lock(),
            vec![empty.clone(), useful.clone(), useful.clone()]
        );
        assert!(f.scorer.score(&empty) < f.scorer.score(&useful));
        assert!(f.scorer.score(&empty) > 0.0);
    }

    #[tokio::test]
    async fn deadline_beats_retry_budget() {
        let f = fixture(5);
        let first = f.peer(0.9, Script::Hang);
        f.peer(0.8, Script::Hang);
        f.peer(0.7, Script::Hang);

        let before = f.scorer.score(&first);
        let started = Instant::now();
        let err = f.router.route(f.request(), in_ms(150)).await.unwrap_err();
        assert!(matches!(err, RouteError::DeadlineExceeded { .. }));
        assert!(started.elapsed() < Duration::from_millis(400));
        // The first attempt timed out on its own and was scored.
        assert!(f.scorer.score(&first) < before);
    }

    #[tokio::test]
    async fn expired_deadline_fails_fast() {
        let f = fixture(2);
        f.peer(0.9, Script::Answer(json!(1)));
        let err = f
            .router
            .route(f.request(), Instant::now() - Duration::from_millis(1))
            .await
            .unwrap_err();
        assert_eq!(err, RouteError::DeadlineExceeded { attempts: 0 });
        assert!(f.forwarder.calls.lock().is_empty());
    }
}
