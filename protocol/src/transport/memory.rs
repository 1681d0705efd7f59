//! In-process transport. Gateways register their [`SessionHost`] under
//! their endpoint string and dial each other through a shared hub without
//! touching the network. Used by the integration tests and by anyone
//! embedding several gateways in one process.

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use super::host::SessionHost;
use super::message::PeerMessage;
use super::{Channel, Connector, TransportError};
use crate::config::SESSION_QUEUE_DEPTH;
use crate::model::{PeerRecord, TransportKind};

#[derive(Clone, Default)]
pub struct MemoryHub {
    hosts: Arc<DashMap<String, Arc<SessionHost>>>,
    /// Extra delay applied to data frames travelling towards an endpoint.
    latency: Arc<DashMap<String, Duration>>,
}

impl MemoryHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, endpoint: impl Into<String>, host: Arc<SessionHost>) {
        self.hosts.insert(endpoint.into(), host);
    }

    pub fn unregister(&self, endpoint: &str) {
        self.hosts.remove(endpoint);
    }

    /// Make the node at `endpoint` slow to answer data requests.
    pub fn set_latency(&self, endpoint: impl Into<String>, latency: Duration) {
        self.latency.insert(endpoint.into(), latency);
    }

    pub fn connector(&self, kind: TransportKind) -> MemoryConnector {
        MemoryConnector {
            hub: self.clone(),
            kind,
            disabled: Arc::new(AtomicBool::new(false)),
        }
    }
}

/// Dials hosts registered on a [`MemoryHub`]. Can be switched off to
/// simulate a transport that never comes up.
#[derive(Clone)]
pub struct MemoryConnector {
    hub: MemoryHub,
    kind: TransportKind,
    disabled: Arc<AtomicBool>,
}

impl MemoryConnector {
    pub fn set_disabled(&self, disabled: bool) {
        self.disabled.store(disabled, Ordering::SeqCst);
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    fn kind(&self) -> TransportKind {
        self.kind
    }

    async fn open(&self, peer: &PeerRecord) -> Result<Channel, TransportError> {
        if self.disabled.load(Ordering::SeqCst) {
            return Err(TransportError::Connect(format!("{} transport is down", self.kind)));
        }
        let host = self
            .hub
            .hosts
            .get(&peer.endpoint)
            .map(|h| h.value().clone())
            .ok_or_else(|| TransportError::Connect(format!("nothing listening at {}", peer.endpoint)))?;

        let (dialer_tx, mut relay_rx) = mpsc::channel::<PeerMessage>(SESSION_QUEUE_DEPTH);
        let (host_in_tx, host_in_rx) = mpsc::channel::<PeerMessage>(SESSION_QUEUE_DEPTH);
        let (host_out_tx, dialer_rx) = mpsc::channel::<PeerMessage>(SESSION_QUEUE_DEPTH);

        // Relay dialer -> host, applying the configured latency to data.
        let latency = self.hub.latency.clone();
        let endpoint = peer.endpoint.clone();
        tokio::spawn(async move {
            while let Some(message) = relay_rx.recv().await {
                if matches!(message, PeerMessage::Data(_)) {
                    let delay = latency.get(&endpoint).map(|d| *d.value());
                    if let Some(delay) = delay {
                        tokio::time::sleep(delay).await;
                    }
                }
                if host_in_tx.send(message).await.is_err() {
                    break;
                }
            }
        });

        tokio::spawn(host.serve(self.kind, host_in_rx, host_out_tx));

        Ok(Channel {
            outbound: dialer_tx,
            inbound: dialer_rx,
        })
    }
}
