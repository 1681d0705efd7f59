//! # HTTP Surface
//!
//! One axum router carries both faces of the node:
//!
//! - the **management** API operators and tooling drive, and
//! - the **service** endpoints other gateways call: session transports,
//!   join and invite intake, and proof submission.
//!
//! ## Management
//!
//! | Method | Path                                  | Description                   |
//! |--------|---------------------------------------|-------------------------------|
//! | GET    | `/health`                             | Liveness probe                |
//! | GET    | `/status`                             | Node status summary           |
//! | GET    | `/metrics`                            | Prometheus metrics            |
//! | GET    | `/networks`                           | Networks this node is in      |
//! | POST   | `/networks`                           | Create a network (as admin)   |
//! | GET    | `/networks/:id`                       | One network                   |
//! | DELETE | `/networks/:id`                       | Revoke a network              |
//! | GET    | `/networks/:id/peers`                 | Peers of a network            |
//! | POST   | `/invites`                            | Issue a signed invite         |
//! | POST   | `/invites/accept`                     | Accept an invite locally      |
//! | POST   | `/invites/send`                       | Invite a remote node          |
//! | GET    | `/joins`                              | Pending join requests         |
//! | POST   | `/joins`                              | Join a network on a remote    |
//! | POST   | `/joins/:id/reject`                   | Reject a pending request      |
//! | POST   | `/challenges`                         | Issue a challenge             |
//! | POST   | `/proofs`                             | Submit a proof                |
//! | GET    | `/peers/:network/:peer`               | Peer status                   |
//! | DELETE | `/peers/:network/:peer`               | Revoke a peer                 |
//! | POST   | `/peers/:network/:peer/connect`       | Dial a peer now               |
//! | POST   | `/peers/:network/:peer/reset`         | Clear `failed` and redial     |
//! | GET    | `/index/:network`                     | Published records             |
//! | POST   | `/index`                              | Publish a record              |
//! | DELETE | `/index/:network/:address`            | Withdraw a record             |
//! | POST   | `/proxy`                              | Discovery request             |
//!
//! ## Service
//!
//! | Method | Path                  | Description                              |
//! |--------|-----------------------|------------------------------------------|
//! | GET    | `/service/websocket`  | Primary session transport                |
//! | GET    | `/service/events`     | Fallback transport, host -> peer stream  |
//! | POST   | `/service/messages`   | Fallback transport, peer -> host         |
//! | POST   | `/service/joins`      | Signed join request intake               |
//! | POST   | `/service/invites`    | Signed invite intake                     |
//! | POST   | `/service/proofs`     | Proof for a challenge handed out here    |
//! | GET    | `/service/status`     | Who this node is                         |

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    http::{Method, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{delete, get, post},
    Json, Router,
};
use futures::{SinkExt, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use dedi_protocol::admission::{ProofReceipt, ProofSubmission};
use dedi_protocol::config::{
    SERVICE_EVENTS_PATH, SERVICE_INVITE_PATH, SERVICE_JOIN_PATH, SERVICE_MESSAGES_PATH,
    SERVICE_PROOF_PATH, SERVICE_WEBSOCKET_PATH, SESSION_QUEUE_DEPTH,
};
use dedi_protocol::crypto::keys::PeerId;
use dedi_protocol::model::{PeerKey, Permission, SignedInvite, SignedJoinRequest, TransportKind};
use dedi_protocol::registry::NewNetwork;
use dedi_protocol::routing::RouteFailure;
use dedi_protocol::transport::{PeerMessage, SessionHost, SseSessions};
use dedi_protocol::{ErrorKind, Gateway, GatewayError};

use crate::metrics::{metrics_handler, SharedMetrics};

pub const SERVICE_STATUS_PATH: &str = "/service/status";

// ---------------------------------------------------------------------------
// Application State
// ---------------------------------------------------------------------------

/// Shared by every handler. Cheap to clone.
#[derive(Clone)]
pub struct AppState {
    pub gateway: Arc<Gateway>,
    pub metrics: SharedMetrics,
    /// Fallback sessions hosted here, keyed by the dialer's session id.
    pub sse: SseSessions,
}

impl AppState {
    pub fn new(gateway: Arc<Gateway>, metrics: SharedMetrics) -> Self {
        Self {
            gateway,
            metrics,
            sse: SseSessions::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Router Construction
// ---------------------------------------------------------------------------

pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
        .allow_headers(Any);

    let metrics = Router::new()
        .route("/metrics", get(metrics_handler))
        .with_state(state.metrics.clone());

    Router::new()
        .route("/health", get(health_handler))
        .route("/status", get(status_handler))
        .route("/networks", get(list_networks).post(create_network))
        .route("/networks/:id", get(get_network).delete(revoke_network))
        .route("/networks/:id/peers", get(list_peers))
        .route("/invites", post(issue_invite))
        .route("/invites/accept", post(accept_invite))
        .route("/invites/send", post(send_invite))
        .route("/joins", get(pending_joins).post(request_join))
        .route("/joins/:id/reject", post(reject_join))
        .route("/challenges", post(issue_challenge))
        .route("/proofs", post(submit_proof))
        .route("/peers/:network/:peer", get(peer_status).delete(revoke_peer))
        .route("/peers/:network/:peer/connect", post(connect_peer))
        .route("/peers/:network/:peer/reset", post(reset_peer))
        .route("/index", post(publish_index))
        .route("/index/:network", get(list_index))
        .route("/index/:network/:address", delete(remove_index))
        .route("/proxy", post(proxy_handler))
        .route(SERVICE_WEBSOCKET_PATH, get(service_websocket))
        .route(SERVICE_EVENTS_PATH, get(service_events))
        .route(SERVICE_MESSAGES_PATH, post(service_messages))
        .route(SERVICE_JOIN_PATH, post(service_join))
        .route(SERVICE_INVITE_PATH, post(service_invite))
        .route(SERVICE_PROOF_PATH, post(service_proof))
        .route(SERVICE_STATUS_PATH, get(service_status))
        .with_state(state)
        .merge(metrics)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Body of every non-2xx reply.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub kind: String,
}

#[derive(Debug)]
pub enum ApiError {
    Gateway(GatewayError),
    BadRequest(String),
}

impl From<GatewayError> for ApiError {
    fn from(e: GatewayError) -> Self {
        Self::Gateway(e)
    }
}

fn status_for(e: &GatewayError) -> StatusCode {
    if let GatewayError::Route(route) = e {
        return match route.kind() {
            RouteFailure::NoRoute => StatusCode::SERVICE_UNAVAILABLE,
            RouteFailure::RemoteFailure => StatusCode::BAD_GATEWAY,
            RouteFailure::Timeout => StatusCode::GATEWAY_TIMEOUT,
        };
    }
    match e.kind() {
        ErrorKind::Admission => StatusCode::BAD_REQUEST,
        ErrorKind::Permission => StatusCode::FORBIDDEN,
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::Connection | ErrorKind::Routing => StatusCode::BAD_GATEWAY,
        ErrorKind::Configuration | ErrorKind::Storage | ErrorKind::Crypto => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

fn kind_label(e: &GatewayError) -> String {
    match e {
        GatewayError::Route(route) => match route.kind() {
            RouteFailure::NoRoute => "no_route",
            RouteFailure::RemoteFailure => "remote_failure",
            RouteFailure::Timeout => "timeout",
        }
        .to_string(),
        other => serde_json::to_value(other.kind())
            .ok()
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_else(|| "internal".to_string()),
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body) = match self {
            Self::Gateway(e) => {
                let status = status_for(&e);
                if status.is_server_error() {
                    tracing::warn!(error = %e, "request failed");
                }
                (
                    status,
                    ErrorResponse {
                        error: e.to_string(),
                        kind: kind_label(&e),
                    },
                )
            }
            Self::BadRequest(message) => (
                StatusCode::BAD_REQUEST,
                ErrorResponse {
                    error: message,
                    kind: "bad_request".to_string(),
                },
            ),
        };
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

fn peer_key(network: String, peer: &str) -> Result<PeerKey, ApiError> {
    let peer_id =
        PeerId::parse(peer).map_err(|e| ApiError::BadRequest(format!("bad peer id: {e}")))?;
    Ok(PeerKey::new(network, peer_id))
}

// ---------------------------------------------------------------------------
// Request Types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct CreateNetworkBody {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub difficulty: Option<u32>,
}

#[derive(Debug, Deserialize)]
pub struct IssueInviteBody {
    pub network_id: String,
    #[serde(default = "default_permission")]
    pub permission: Permission,
}

#[derive(Debug, Deserialize)]
pub struct SendInviteBody {
    pub endpoint: String,
    pub network_id: String,
    #[serde(default = "default_permission")]
    pub permission: Permission,
}

fn default_permission() -> Permission {
    Permission::Member
}

#[derive(Debug, Deserialize)]
pub struct RequestJoinBody {
    pub endpoint: String,
    pub network_id: String,
}

#[derive(Debug, Deserialize)]
pub struct PendingQuery {
    pub network_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct IssueChallengeBody {
    pub network_id: String,
    pub peer_id: String,
}

#[derive(Debug, Deserialize)]
pub struct PublishBody {
    pub network_id: String,
    pub address: String,
    pub value: Value,
}

#[derive(Debug, Deserialize)]
pub struct ProxyBody {
    pub network_id: String,
    pub address: String,
    #[serde(default)]
    pub payload: Value,
    pub deadline_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct SessionQuery {
    pub session: String,
}

// ---------------------------------------------------------------------------
// Management Handlers
// ---------------------------------------------------------------------------

async fn health_handler() -> impl IntoResponse {
    (StatusCode::OK, Json(serde_json::json!({ "status": "ok" })))
}

async fn status_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.gateway.status())
}

async fn list_networks(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.gateway.list_networks())
}

async fn create_network(
    State(state): State<AppState>,
    Json(body): Json<CreateNetworkBody>,
) -> Result<impl IntoResponse, ApiError> {
    let network = state.gateway.create_network(NewNetwork {
        name: body.name,
        description: body.description,
        difficulty: body.difficulty,
    })?;
    Ok((StatusCode::CREATED, Json(network)))
}

async fn get_network(State(state): State<AppState>, Path(id): Path<String>) -> impl IntoResponse {
    state.gateway.get_network(&id).map(Json).map_err(ApiError::from)
}

async fn revoke_network(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    state
        .gateway
        .revoke_network(&id)
        .map(Json)
        .map_err(ApiError::from)
}

async fn list_peers(State(state): State<AppState>, Path(id): Path<String>) -> impl IntoResponse {
    state.gateway.list_peers(&id).map(Json).map_err(ApiError::from)
}

async fn issue_invite(
    State(state): State<AppState>,
    Json(body): Json<IssueInviteBody>,
) -> ApiResult<SignedInvite> {
    Ok(Json(
        state
            .gateway
            .issue_invite(&body.network_id, body.permission)?,
    ))
}

async fn accept_invite(
    State(state): State<AppState>,
    Json(invite): Json<SignedInvite>,
) -> impl IntoResponse {
    state
        .gateway
        .accept_invite(invite)
        .map(Json)
        .map_err(ApiError::from)
}

async fn send_invite(
    State(state): State<AppState>,
    Json(body): Json<SendInviteBody>,
) -> ApiResult<ProofReceipt> {
    let receipt = state
        .gateway
        .send_invite(&body.endpoint, &body.network_id, body.permission)
        .await?;
    Ok(Json(receipt))
}

async fn pending_joins(
    State(state): State<AppState>,
    Query(query): Query<PendingQuery>,
) -> impl IntoResponse {
    Json(state.gateway.pending_requests(query.network_id.as_deref()))
}

async fn request_join(
    State(state): State<AppState>,
    Json(body): Json<RequestJoinBody>,
) -> ApiResult<ProofReceipt> {
    let receipt = state
        .gateway
        .request_join(&body.endpoint, &body.network_id)
        .await?;
    Ok(Json(receipt))
}

async fn reject_join(State(state): State<AppState>, Path(id): Path<String>) -> impl IntoResponse {
    state
        .gateway
        .reject_join_request(&id)
        .map(Json)
        .map_err(ApiError::from)
}

async fn issue_challenge(
    State(state): State<AppState>,
    Json(body): Json<IssueChallengeBody>,
) -> Result<impl IntoResponse, ApiError> {
    let peer_id = PeerId::parse(&body.peer_id)
        .map_err(|e| ApiError::BadRequest(format!("bad peer id: {e}")))?;
    let descriptor = state.gateway.issue_challenge(&body.network_id, &peer_id)?;
    Ok(Json(descriptor))
}

async fn submit_proof(
    State(state): State<AppState>,
    Json(body): Json<ProofSubmission>,
) -> Result<impl IntoResponse, ApiError> {
    let nonce = hex::decode(&body.nonce)
        .map_err(|_| ApiError::BadRequest("nonce is not hex".to_string()))?;
    let result = state.gateway.submit_proof(&body.challenge_id, &nonce);
    state.metrics.record_admission(&result);
    Ok(Json(result?))
}

async fn peer_status(
    State(state): State<AppState>,
    Path((network, peer)): Path<(String, String)>,
) -> Result<impl IntoResponse, ApiError> {
    let key = peer_key(network, &peer)?;
    Ok(Json(state.gateway.get_peer_status(&key)?))
}

async fn revoke_peer(
    State(state): State<AppState>,
    Path((network, peer)): Path<(String, String)>,
) -> Result<impl IntoResponse, ApiError> {
    let key = peer_key(network, &peer)?;
    Ok(Json(state.gateway.revoke_peer(&key)?))
}

async fn connect_peer(
    State(state): State<AppState>,
    Path((network, peer)): Path<(String, String)>,
) -> Result<impl IntoResponse, ApiError> {
    let key = peer_key(network, &peer)?;
    let connection = state.gateway.connect_peer(&key).await?;
    Ok(Json(serde_json::json!({ "connection": connection })))
}

async fn reset_peer(
    State(state): State<AppState>,
    Path((network, peer)): Path<(String, String)>,
) -> Result<impl IntoResponse, ApiError> {
    let key = peer_key(network, &peer)?;
    let connection = state.gateway.reset_peer(&key).await?;
    Ok(Json(serde_json::json!({ "connection": connection })))
}

async fn publish_index(
    State(state): State<AppState>,
    Json(body): Json<PublishBody>,
) -> Result<impl IntoResponse, ApiError> {
    let entry = state
        .gateway
        .publish_index(&body.network_id, &body.address, body.value)?;
    Ok((StatusCode::CREATED, Json(entry)))
}

async fn list_index(
    State(state): State<AppState>,
    Path(network): Path<String>,
) -> impl IntoResponse {
    Json(state.gateway.list_index(&network))
}

async fn remove_index(
    State(state): State<AppState>,
    Path((network, address)): Path<(String, String)>,
) -> impl IntoResponse {
    match state.gateway.remove_index(&network, &address) {
        Some(entry) => Json(entry).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

/// `POST /proxy`: answer locally or through the best connected peer.
async fn proxy_handler(
    State(state): State<AppState>,
    Json(body): Json<ProxyBody>,
) -> Result<impl IntoResponse, ApiError> {
    let started = Instant::now();
    let result = state
        .gateway
        .proxy_request(
            &body.network_id,
            &body.address,
            body.payload,
            body.deadline_ms.map(Duration::from_millis),
        )
        .await;
    match &result {
        Ok(_) => state.metrics.record_proxy(Ok(started.elapsed())),
        Err(e) => state.metrics.record_proxy(Err(e)),
    }
    Ok(Json(result?))
}

// ---------------------------------------------------------------------------
// Service Handlers
// ---------------------------------------------------------------------------

async fn service_status(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.gateway.node_info())
}

async fn service_join(
    State(state): State<AppState>,
    Json(request): Json<SignedJoinRequest>,
) -> impl IntoResponse {
    state
        .gateway
        .handle_join_request(request)
        .map(Json)
        .map_err(ApiError::from)
}

async fn service_invite(
    State(state): State<AppState>,
    Json(invite): Json<SignedInvite>,
) -> impl IntoResponse {
    state
        .gateway
        .handle_invite(invite)
        .map(Json)
        .map_err(ApiError::from)
}

async fn service_proof(
    State(state): State<AppState>,
    Json(proof): Json<ProofSubmission>,
) -> ApiResult<ProofReceipt> {
    let result = state.gateway.handle_proof(proof);
    state.metrics.record_admission(&result);
    Ok(Json(result?))
}

/// Primary transport: run a hosted session over the upgraded socket.
async fn service_websocket(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
) -> impl IntoResponse {
    let host = state.gateway.session_host();
    ws.on_upgrade(move |socket| pump_websocket(socket, host))
}

async fn pump_websocket(socket: WebSocket, host: Arc<SessionHost>) {
    let (mut sink, mut stream) = socket.split();
    let (inbound_tx, inbound_rx) = mpsc::channel::<PeerMessage>(SESSION_QUEUE_DEPTH);
    let (outbound_tx, mut outbound_rx) = mpsc::channel::<PeerMessage>(SESSION_QUEUE_DEPTH);

    let session = tokio::spawn(host.serve(TransportKind::Primary, inbound_rx, outbound_tx));

    // Writer ends when the host finishes and drops its sender.
    let writer = tokio::spawn(async move {
        while let Some(message) = outbound_rx.recv().await {
            let text = match message.to_json() {
                Ok(text) => text,
                Err(e) => {
                    tracing::warn!(error = %e, "dropping unencodable message");
                    continue;
                }
            };
            if sink.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    while let Some(Ok(frame)) = stream.next().await {
        match frame {
            Message::Text(text) => match PeerMessage::from_json(&text) {
                Ok(message) => {
                    if inbound_tx.send(message).await.is_err() {
                        break;
                    }
                }
                Err(e) => tracing::debug!(error = %e, "malformed frame"),
            },
            Message::Close(_) => break,
            _ => {}
        }
    }

    drop(inbound_tx);
    let _ = session.await;
    let _ = writer.await;
}

/// Fallback transport, host -> peer leg.
async fn service_events(
    State(state): State<AppState>,
    Query(query): Query<SessionQuery>,
) -> Result<Sse<impl Stream<Item = Result<Event, axum::Error>>>, ApiError> {
    let outbound = state
        .sse
        .open(state.gateway.session_host(), query.session)
        .map_err(|e| ApiError::Gateway(e.into()))?;

    let events = futures::stream::unfold(outbound, |mut outbound| async move {
        outbound
            .recv()
            .await
            .map(|message| (Event::default().json_data(&message), outbound))
    });
    Ok(Sse::new(events).keep_alive(KeepAlive::default()))
}

/// Fallback transport, peer -> host leg.
async fn service_messages(
    State(state): State<AppState>,
    Query(query): Query<SessionQuery>,
    Json(message): Json<PeerMessage>,
) -> Result<StatusCode, ApiError> {
    state
        .sse
        .deliver(&query.session, message)
        .await
        .map_err(|e| ApiError::Gateway(e.into()))?;
    Ok(StatusCode::ACCEPTED)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use dedi_protocol::config::GatewayConfig;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    fn test_state() -> AppState {
        let mut config = GatewayConfig::default();
        config.node_name = "api-test".into();
        config.admission.default_difficulty = 4;
        let gateway = Arc::new(Gateway::build(config).expect("gateway"));
        let metrics = Arc::new(crate::metrics::GatewayMetrics::new().expect("metrics"));
        AppState::new(gateway, metrics)
    }

    async fn send(router: &Router, request: Request<Body>) -> (StatusCode, Value) {
        let resp = router.clone().oneshot(request).await.unwrap();
        let status = resp.status();
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, body)
    }

    async fn get(router: &Router, path: &str) -> (StatusCode, Value) {
        let req = Request::builder().uri(path).body(Body::empty()).unwrap();
        send(router, req).await
    }

    async fn post_json(router: &Router, path: &str, body: Value) -> (StatusCode, Value) {
        let req = Request::builder()
            .method("POST")
            .uri(path)
            .header("content-type", "application/json")
            .body(Body::from(serde_json::to_vec(&body).unwrap()))
            .unwrap();
        send(router, req).await
    }

    #[tokio::test]
    async fn health_endpoint_returns_ok() {
        let router = create_router(test_state());
        let (status, body) = get(&router, "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn created_networks_are_listed() {
        let router = create_router(test_state());
        let (status, created) = post_json(
            &router,
            "/networks",
            serde_json::json!({ "name": "lab", "difficulty": 6 }),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(created["difficulty"], 6);

        let (status, listed) = get(&router, "/networks").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(listed.as_array().unwrap().len(), 1);
        assert_eq!(listed[0]["id"], created["id"]);

        let (status, body) = get(&router, "/networks/nope").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["kind"], "not_found");
    }

    #[tokio::test]
    async fn proxy_answers_from_the_local_index() {
        let state = test_state();
        let router = create_router(state.clone());
        let (_, network) = post_json(&router, "/networks", serde_json::json!({ "name": "lab" })).await;
        let network_id = network["id"].as_str().unwrap().to_string();

        let (status, _) = post_json(
            &router,
            "/index",
            serde_json::json!({ "network_id": network_id, "address": "printers/3f", "value": { "ip": "10.0.0.9" } }),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);

        let (status, body) = post_json(
            &router,
            "/proxy",
            serde_json::json!({ "network_id": network_id, "address": "printers/3f" }),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["served_by"]["kind"], "local");
        assert_eq!(body["payload"]["ip"], "10.0.0.9");
        assert_eq!(
            state
                .metrics
                .proxy_requests_total
                .with_label_values(&["ok"])
                .get(),
            1
        );
    }

    #[tokio::test]
    async fn proxy_without_candidates_is_no_route() {
        let router = create_router(test_state());
        let (_, network) = post_json(&router, "/networks", serde_json::json!({ "name": "lab" })).await;

        let (status, body) = post_json(
            &router,
            "/proxy",
            serde_json::json!({ "network_id": network["id"], "address": "missing", "deadline_ms": 500 }),
        )
        .await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["kind"], "no_route");
    }

    #[tokio::test]
    async fn unknown_challenge_is_not_found() {
        let router = create_router(test_state());
        let (status, body) = post_json(
            &router,
            SERVICE_PROOF_PATH,
            serde_json::json!({ "challenge_id": "nope", "nonce": "3130" }),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["kind"], "not_found");

        let (status, body) = post_json(
            &router,
            "/proofs",
            serde_json::json!({ "challenge_id": "nope", "nonce": "zz" }),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["kind"], "bad_request");
    }

    #[tokio::test]
    async fn join_intake_hands_out_a_challenge() {
        let admin = test_state();
        let router = create_router(admin.clone());
        let (_, network) = post_json(&router, "/networks", serde_json::json!({ "name": "lab" })).await;
        let network_id = network["id"].as_str().unwrap().to_string();

        let joiner = test_state();
        let request = joiner
            .gateway
            .prepare_join_request(&network_id, Permission::Member)
            .unwrap();

        let (status, reply) = post_json(
            &router,
            SERVICE_JOIN_PATH,
            serde_json::to_value(&request).unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(reply["challenge"]["network_id"], network_id.as_str());
        assert_eq!(reply["challenge"]["difficulty"], 4);

        // A tampered copy is refused.
        let mut forged = serde_json::to_value(&request).unwrap();
        forged["body"]["proposed_permission"] = serde_json::json!("admin");
        let (status, body) = post_json(&router, SERVICE_JOIN_PATH, forged).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["kind"], "admission");
    }

    #[tokio::test]
    async fn bad_peer_ids_are_rejected() {
        let router = create_router(test_state());
        let (status, body) = get(&router, "/peers/net/not-a-peer").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["kind"], "bad_request");
    }

    #[tokio::test]
    async fn service_status_names_the_node() {
        let state = test_state();
        let router = create_router(state.clone());
        let (status, body) = get(&router, SERVICE_STATUS_PATH).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["node_name"], "api-test");
        assert_eq!(
            body["peer_id"],
            state.gateway.node_info().peer_id.as_str()
        );
    }

    #[tokio::test]
    async fn metrics_are_exposed() {
        let router = create_router(test_state());
        let req = Request::builder().uri("/metrics").body(Body::empty()).unwrap();
        let resp = router.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        let text = String::from_utf8(bytes.to_vec()).unwrap();
        assert!(text.contains("dedi_connected_peers"));
    }

    #[tokio::test]
    async fn messages_for_unknown_sessions_are_refused() {
        let router = create_router(test_state());
        let (status, body) = post_json(
            &router,
            &format!("{SERVICE_MESSAGES_PATH}?session=missing"),
            serde_json::to_value(PeerMessage::ping()).unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_GATEWAY);
        assert_eq!(body["kind"], "connection");
    }
}
