//! # Gateway Configuration & Constants
//!
//! Every tunable in the gateway lives here: protocol constants at the top,
//! the serde-backed [`GatewayConfig`] tree below. The node binary loads a
//! `GatewayConfig` from TOML (or builds the default) and hands it to
//! [`Gateway::build`](crate::gateway::Gateway::build); nothing else in the
//! crate reads configuration from the environment.
//!
//! Durations are carried as `*_ms` integers so config files stay readable
//! without a duration-parsing dependency. Each section exposes `Duration`
//! accessors so the rest of the crate never multiplies by 1000 by hand.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

// ---------------------------------------------------------------------------
// Protocol
// ---------------------------------------------------------------------------

/// Crate version string advertised on the status endpoints.
pub const PROTOCOL_VERSION: &str = "0.1.0";

/// Session protocol identifier carried in every handshake. Peers that speak
/// something else are refused before any signature is checked.
pub const SESSION_PROTOCOL: &str = "dedi-session/1";

// ---------------------------------------------------------------------------
// Cryptographic Parameters
// ---------------------------------------------------------------------------

/// Ed25519 public key length in bytes.
pub const PUBLIC_KEY_LENGTH: usize = 32;

/// Ed25519 signature length. Always 64 bytes.
pub const SIGNATURE_LENGTH: usize = 64;

/// Number of BLAKE3 output bytes kept for a peer fingerprint (hex-encoded
/// to 32 characters).
pub const PEER_ID_LENGTH: usize = 16;

/// AES-256 key length in bytes.
pub const AES_KEY_LENGTH: usize = 32;

/// AES-GCM nonce length (96 bits, the only size worth using).
pub const AES_NONCE_LENGTH: usize = 12;

/// Domain separation context for the symmetric key derived from the node's
/// identity key inside the in-memory KMS.
pub const KMS_ENCRYPTION_CONTEXT: &str = "dedi-gateway 2026 kms encryption key";

// ---------------------------------------------------------------------------
// Admission
// ---------------------------------------------------------------------------

/// A SHA-256 digest only has 256 bits to be zero.
pub const MAX_DIFFICULTY: u32 = 256;

/// Default leading-zero-bit requirement for new networks. Around a second
/// of single-core search on commodity hardware.
pub const DEFAULT_DIFFICULTY: u32 = 20;

/// Random bytes behind a challenge prefix. Hex-encoded, this yields the
/// 32-character prefixes peers expect on the wire.
pub const CHALLENGE_PREFIX_BYTES: usize = 16;

/// Challenges are valid for five minutes after issue.
pub const DEFAULT_CHALLENGE_TTL_MS: u64 = 300_000;

/// Join requests left pending longer than this are swept.
pub const DEFAULT_JOIN_REQUEST_TTL_MS: u64 = 3_600_000;

/// Invites expire after a day.
pub const DEFAULT_INVITE_TTL_MS: u64 = 86_400_000;

/// Maximum tolerated skew between a signed timestamp and our clock.
pub const DEFAULT_MAX_CLOCK_SKEW_MS: u64 = 60_000;

/// Hardest puzzle this node agrees to solve for a remote host. Anything
/// above is refused without starting a search.
pub const DEFAULT_MAX_SOLVE_DIFFICULTY: u32 = 32;

// ---------------------------------------------------------------------------
// Route Scoring
// ---------------------------------------------------------------------------

/// Lower bound of a route score.
pub const SCORE_MIN: f64 = 0.0;

/// Upper bound of a route score.
pub const SCORE_MAX: f64 = 1.0;

/// Score given to peers we know nothing about: the midpoint of the range.
pub const NEUTRAL_SCORE: f64 = (SCORE_MIN + SCORE_MAX) / 2.0;

/// Weight of the newest sample in the moving average.
pub const DEFAULT_EMA_FACTOR: f64 = 0.3;

/// Successful exchanges faster than this count as a perfect sample.
pub const DEFAULT_EXPECTED_LATENCY_MS: u64 = 500;

/// Sample for a peer that replied, but with an error instead of an answer.
/// Reachable, so above a failure; useless for this request, so well below
/// a success.
pub const DEFAULT_UNANSWERED_SAMPLE: f64 = 0.25;

// ---------------------------------------------------------------------------
// Connections
// ---------------------------------------------------------------------------

pub const DEFAULT_HANDSHAKE_TIMEOUT_MS: u64 = 5_000;
pub const DEFAULT_FALLBACK_TIMEOUT_MS: u64 = 10_000;
pub const DEFAULT_HEARTBEAT_INTERVAL_MS: u64 = 5_000;
pub const DEFAULT_MISSED_HEARTBEATS: u32 = 2;
pub const DEFAULT_RECONNECT_BASE_MS: u64 = 500;
pub const DEFAULT_RECONNECT_MAX_MS: u64 = 30_000;
pub const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 6;
pub const DEFAULT_MAX_SESSIONS: usize = 64;

/// Depth of the per-session outbound queue.
pub const SESSION_QUEUE_DEPTH: usize = 256;

// ---------------------------------------------------------------------------
// Proxy
// ---------------------------------------------------------------------------

pub const DEFAULT_ATTEMPT_TIMEOUT_MS: u64 = 3_000;
pub const DEFAULT_RETRY_BUDGET: u32 = 2;

/// Deadline applied to proxy requests that arrive without one.
pub const DEFAULT_PROXY_DEADLINE_MS: u64 = 10_000;

// ---------------------------------------------------------------------------
// Service Endpoints
// ---------------------------------------------------------------------------

/// Primary transport: a WebSocket upgraded on this path.
pub const SERVICE_WEBSOCKET_PATH: &str = "/service/websocket";

/// Fallback transport, server-to-peer leg: a server-sent event stream.
pub const SERVICE_EVENTS_PATH: &str = "/service/events";

/// Fallback transport, peer-to-server leg: one POST per message.
pub const SERVICE_MESSAGES_PATH: &str = "/service/messages";

/// Query parameter pairing the two fallback legs.
pub const SESSION_QUERY_PARAM: &str = "session";

/// Intake for signed join requests from remote peers.
pub const SERVICE_JOIN_PATH: &str = "/service/joins";

/// Intake for signed invites from remote peers.
pub const SERVICE_INVITE_PATH: &str = "/service/invites";

/// Proof submission for challenges handed out by the intake endpoints.
pub const SERVICE_PROOF_PATH: &str = "/service/proofs";

/// Default listen address for the node's HTTP surface.
pub const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:8720";

// ---------------------------------------------------------------------------
// Configuration Tree
// ---------------------------------------------------------------------------

/// Raised by [`GatewayConfig::validate`].
#[derive(Debug, thiserror::Error)]
#[error("invalid configuration: {0}")]
pub struct ConfigError(pub String);

/// Top-level gateway configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Human-friendly node name, used only in logs and status output.
    pub node_name: String,
    /// Base URL other peers use to reach this node's service endpoints.
    pub endpoint: String,
    pub admission: AdmissionConfig,
    pub scoring: ScoringConfig,
    pub connection: ConnectionConfig,
    pub proxy: ProxyConfig,
    pub backends: BackendConfig,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            node_name: "dedi-node".to_string(),
            endpoint: "http://127.0.0.1:8720".to_string(),
            admission: AdmissionConfig::default(),
            scoring: ScoringConfig::default(),
            connection: ConnectionConfig::default(),
            proxy: ProxyConfig::default(),
            backends: BackendConfig::default(),
        }
    }
}

impl GatewayConfig {
    /// Reject values that would make the gateway misbehave rather than
    /// merely perform badly.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.endpoint.trim().is_empty() {
            return Err(ConfigError("endpoint must not be empty".into()));
        }
        if self.admission.default_difficulty > MAX_DIFFICULTY {
            return Err(ConfigError(format!(
                "default_difficulty {} exceeds {}",
                self.admission.default_difficulty, MAX_DIFFICULTY
            )));
        }
        if self.admission.max_solve_difficulty > MAX_DIFFICULTY {
            return Err(ConfigError(format!(
                "max_solve_difficulty {} exceeds {}",
                self.admission.max_solve_difficulty, MAX_DIFFICULTY
            )));
        }
        if self.admission.challenge_ttl_ms == 0 {
            return Err(ConfigError("challenge_ttl_ms must be positive".into()));
        }
        let alpha = self.scoring.ema_factor;
        if !(alpha > 0.0 && alpha <= 1.0) {
            return Err(ConfigError(format!(
                "ema_factor {} must lie in (0, 1]",
                alpha
            )));
        }
        let unanswered = self.scoring.unanswered_sample;
        if !(SCORE_MIN..=SCORE_MAX).contains(&unanswered) {
            return Err(ConfigError(format!(
                "unanswered_sample {} must lie in [{}, {}]",
                unanswered, SCORE_MIN, SCORE_MAX
            )));
        }
        if self.scoring.expected_latency_ms == 0 {
            return Err(ConfigError("expected_latency_ms must be positive".into()));
        }
        if self.connection.max_sessions == 0 {
            return Err(ConfigError("max_sessions must be at least 1".into()));
        }
        if self.connection.missed_heartbeats == 0 {
            return Err(ConfigError("missed_heartbeats must be at least 1".into()));
        }
        if self.connection.reconnect_base_ms > self.connection.reconnect_max_ms {
            return Err(ConfigError(
                "reconnect_base_ms must not exceed reconnect_max_ms".into(),
            ));
        }
        if self.proxy.attempt_timeout_ms == 0 {
            return Err(ConfigError("attempt_timeout_ms must be positive".into()));
        }
        Ok(())
    }
}

/// Challenge and join-request lifetimes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AdmissionConfig {
    /// Difficulty assigned to networks created without an explicit one.
    pub default_difficulty: u32,
    pub challenge_ttl_ms: u64,
    pub join_request_ttl_ms: u64,
    pub invite_ttl_ms: u64,
    /// Signed timestamps further than this from our clock are refused.
    pub max_clock_skew_ms: u64,
    /// Challenges from other nodes above this difficulty are refused.
    pub max_solve_difficulty: u32,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            default_difficulty: DEFAULT_DIFFICULTY,
            challenge_ttl_ms: DEFAULT_CHALLENGE_TTL_MS,
            join_request_ttl_ms: DEFAULT_JOIN_REQUEST_TTL_MS,
            invite_ttl_ms: DEFAULT_INVITE_TTL_MS,
            max_clock_skew_ms: DEFAULT_MAX_CLOCK_SKEW_MS,
            max_solve_difficulty: DEFAULT_MAX_SOLVE_DIFFICULTY,
        }
    }
}

impl AdmissionConfig {
    pub fn challenge_ttl(&self) -> Duration {
        Duration::from_millis(self.challenge_ttl_ms)
    }

    pub fn join_request_ttl(&self) -> Duration {
        Duration::from_millis(self.join_request_ttl_ms)
    }

    pub fn invite_ttl(&self) -> Duration {
        Duration::from_millis(self.invite_ttl_ms)
    }

    pub fn max_clock_skew(&self) -> Duration {
        Duration::from_millis(self.max_clock_skew_ms)
    }
}

/// Moving-average parameters and the latency-to-sample mapping.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoringConfig {
    /// The α in `α·sample + (1-α)·old`. Must lie in `(0, 1]`.
    pub ema_factor: f64,
    /// Successes at or under this latency map to a sample of 1.0.
    pub expected_latency_ms: u64,
    /// Sample recorded when a peer replies with an error.
    pub unanswered_sample: f64,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            ema_factor: DEFAULT_EMA_FACTOR,
            expected_latency_ms: DEFAULT_EXPECTED_LATENCY_MS,
            unanswered_sample: DEFAULT_UNANSWERED_SAMPLE,
        }
    }
}

impl ScoringConfig {
    pub fn expected_latency(&self) -> Duration {
        Duration::from_millis(self.expected_latency_ms)
    }
}

/// Session establishment, liveness and reconnection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Budget for opening and handshaking the primary transport.
    pub handshake_timeout_ms: u64,
    /// Budget for the fallback transport once the primary gave up.
    pub fallback_timeout_ms: u64,
    pub heartbeat_interval_ms: u64,
    /// Silent intervals tolerated before a session is declared dropped.
    pub missed_heartbeats: u32,
    pub reconnect_base_ms: u64,
    pub reconnect_max_ms: u64,
    /// Reconnect attempts before a peer is parked in `failed`.
    pub max_reconnect_attempts: u32,
    /// Upper bound on concurrently open outbound sessions.
    pub max_sessions: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            handshake_timeout_ms: DEFAULT_HANDSHAKE_TIMEOUT_MS,
            fallback_timeout_ms: DEFAULT_FALLBACK_TIMEOUT_MS,
            heartbeat_interval_ms: DEFAULT_HEARTBEAT_INTERVAL_MS,
            missed_heartbeats: DEFAULT_MISSED_HEARTBEATS,
            reconnect_base_ms: DEFAULT_RECONNECT_BASE_MS,
            reconnect_max_ms: DEFAULT_RECONNECT_MAX_MS,
            max_reconnect_attempts: DEFAULT_MAX_RECONNECT_ATTEMPTS,
            max_sessions: DEFAULT_MAX_SESSIONS,
        }
    }
}

impl ConnectionConfig {
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn fallback_timeout(&self) -> Duration {
        Duration::from_millis(self.fallback_timeout_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    /// How long a session may stay silent before it counts as dropped.
    pub fn liveness_window(&self) -> Duration {
        self.heartbeat_interval() * self.missed_heartbeats
    }

    pub fn reconnect_base(&self) -> Duration {
        Duration::from_millis(self.reconnect_base_ms)
    }

    pub fn reconnect_max(&self) -> Duration {
        Duration::from_millis(self.reconnect_max_ms)
    }
}

/// Forwarding limits for proxied requests.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    /// Upper bound on a single forwarding attempt.
    pub attempt_timeout_ms: u64,
    /// Additional candidates tried after the first one fails.
    pub retry_budget: u32,
    /// Deadline used when the caller does not supply one.
    pub default_deadline_ms: u64,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            attempt_timeout_ms: DEFAULT_ATTEMPT_TIMEOUT_MS,
            retry_budget: DEFAULT_RETRY_BUDGET,
            default_deadline_ms: DEFAULT_PROXY_DEADLINE_MS,
        }
    }
}

impl ProxyConfig {
    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_millis(self.attempt_timeout_ms)
    }

    pub fn default_deadline(&self) -> Duration {
        Duration::from_millis(self.default_deadline_ms)
    }
}

// ---------------------------------------------------------------------------
// Backend Selection
// ---------------------------------------------------------------------------

/// Which implementation backs each boundary. Chosen once at startup.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    pub storage: StorageBackend,
    pub kms: KmsBackend,
    pub cache: CacheBackend,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StorageBackend {
    /// Everything is forgotten on restart. Tests and throwaway nodes.
    #[default]
    Memory,
    /// Embedded sled database at `path`.
    Sled { path: PathBuf },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum KmsBackend {
    /// Key held in process memory. With no `secret_key_hex`, a fresh
    /// identity is generated at startup, which is fine for devnets and
    /// nothing else.
    Memory {
        #[serde(default)]
        secret_key_hex: Option<String>,
    },
    /// Hex-encoded Ed25519 secret read from a file written by `init`.
    KeyFile { path: PathBuf },
}

impl Default for KmsBackend {
    fn default() -> Self {
        Self::Memory {
            secret_key_hex: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CacheBackend {
    /// Bounded in-process map with per-entry expiry.
    Memory { capacity: usize },
}

impl Default for CacheBackend {
    fn default() -> Self {
        Self::Memory { capacity: 16_384 }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        GatewayConfig::default().validate().unwrap();
    }

    #[test]
    fn neutral_score_is_midpoint() {
        assert!((NEUTRAL_SCORE - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn rejects_ema_factor_out_of_range() {
        let mut config = GatewayConfig::default();
        config.scoring.ema_factor = 0.0;
        assert!(config.validate().is_err());
        config.scoring.ema_factor = 1.5;
        assert!(config.validate().is_err());
        config.scoring.ema_factor = 1.0;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn rejects_unanswered_sample_out_of_range() {
        let mut config = GatewayConfig::default();
        config.scoring.unanswered_sample = -0.1;
        assert!(config.validate().is_err());
        config.scoring.unanswered_sample = f64::NAN;
        assert!(config.validate().is_err());
        config.scoring.unanswered_sample = 0.0;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn rejects_impossible_difficulty() {
        let mut config = GatewayConfig::default();
        config.admission.default_difficulty = MAX_DIFFICULTY + 1;
        assert!(config.validate().is_err());

        let mut config = GatewayConfig::default();
        config.admission.max_solve_difficulty = MAX_DIFFICULTY + 1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn liveness_window_scales_with_threshold() {
        let config = ConnectionConfig {
            heartbeat_interval_ms: 1_000,
            missed_heartbeats: 3,
            ..Default::default()
        };
        assert_eq!(config.liveness_window(), Duration::from_secs(3));
    }

    #[test]
    fn backend_sections_deserialize_from_tagged_tables() {
        let json = r#"{
            "storage": { "kind": "sled", "path": "/var/lib/dedi" },
            "kms": { "kind": "memory" },
            "cache": { "kind": "memory", "capacity": 8 }
        }"#;
        let backends: BackendConfig = serde_json::from_str(json).unwrap();
        assert_eq!(
            backends.storage,
            StorageBackend::Sled {
                path: PathBuf::from("/var/lib/dedi")
            }
        );
        assert_eq!(
            backends.kms,
            KmsBackend::Memory {
                secret_key_hex: None
            }
        );
        assert_eq!(backends.cache, CacheBackend::Memory { capacity: 8 });
    }
}
