//! # Peer Transports
//!
//! A session with a peer is a pair of message queues. How the bytes move
//! underneath is a [`Connector`]'s business:
//!
//! ```text
//! websocket.rs   primary: one persistent bidirectional WebSocket
//! sse.rs         fallback: server-sent events down, POST requests up
//! memory.rs      in-process hub, for tests and local loops
//! ```
//!
//! The accepting side of every transport hands its queues to a
//! [`SessionHost`], which runs the host half of the handshake and then
//! answers requests through the [`MessageDispatcher`].

pub mod dispatch;
pub mod handshake;
pub mod host;
pub mod memory;
pub mod message;
pub mod sse;
pub mod websocket;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::model::{PeerRecord, TransportKind};

pub use dispatch::MessageDispatcher;
pub use handshake::{Expectation, HandshakeError, HandshakeProof};
pub use host::SessionHost;
pub use memory::{MemoryConnector, MemoryHub};
pub use message::{DataBody, DataFrame, DataRequest, PeerMessage};
pub use sse::{SseConnector, SseSessions};
pub use websocket::WsConnector;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connect failed: {0}")]
    Connect(String),

    #[error("session closed")]
    Closed,

    #[error("malformed frame: {0}")]
    Codec(String),

    #[error("http error: {0}")]
    Http(String),
}

/// Both directions of an open session.
#[derive(Debug)]
pub struct Channel {
    pub outbound: mpsc::Sender<PeerMessage>,
    pub inbound: mpsc::Receiver<PeerMessage>,
}

/// Opens raw sessions to a peer's endpoint. Handshaking happens on top.
#[async_trait]
pub trait Connector: Send + Sync {
    fn kind(&self) -> TransportKind;

    async fn open(&self, peer: &PeerRecord) -> Result<Channel, TransportError>;
}

/// `http://host` becomes `ws://host/path`, `https` becomes `wss`.
pub(crate) fn websocket_url(endpoint: &str, path: &str) -> String {
    let base = endpoint.trim_end_matches('/');
    let base = if let Some(rest) = base.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = base.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        base.to_string()
    };
    format!("{base}{path}")
}

pub(crate) fn http_url(endpoint: &str, path: &str) -> String {
    format!("{}{}", endpoint.trim_end_matches('/'), path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn websocket_urls_follow_the_scheme() {
        assert_eq!(
            websocket_url("http://a.example:8720/", "/service/websocket"),
            "ws://a.example:8720/service/websocket"
        );
        assert_eq!(
            websocket_url("https://a.example", "/x"),
            "wss://a.example/x"
        );
        assert_eq!(websocket_url("ws://raw", "/x"), "ws://raw/x");
    }

    #[test]
    fn http_urls_do_not_double_slash() {
        assert_eq!(http_url("http://a/", "/service/events"), "http://a/service/events");
    }
}
