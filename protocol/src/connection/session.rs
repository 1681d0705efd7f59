//! A live, handshaken session with one peer.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;

use super::ConnectionError;
use crate::model::{PeerKey, TransportKind};
use crate::transport::message::{DataBody, DataFrame, DataRequest, PeerMessage};
use crate::transport::TransportError;

/// Snapshot for status output.
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub id: u64,
    pub transport: TransportKind,
    pub opened_at: DateTime<Utc>,
    pub idle_ms: u64,
    pub in_flight: usize,
}

/// Owned by the connection manager. The read side of the channel lives in
/// the manager's reader task; this struct holds the write side and the
/// table of requests waiting for a reply.
pub struct Session {
    id: u64,
    key: PeerKey,
    transport: TransportKind,
    outbound: mpsc::Sender<PeerMessage>,
    pending: Mutex<HashMap<u64, oneshot::Sender<DataBody>>>,
    next_frame: AtomicU64,
    last_inbound: Mutex<Instant>,
    last_active: Mutex<Instant>,
    opened_at: DateTime<Utc>,
    closed: watch::Sender<bool>,
}

/// Removes a pending entry when a request is abandoned, so a caller that
/// gives up (or is cancelled) leaves nothing behind in the session.
struct PendingGuard<'a> {
    session: &'a Session,
    frame: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.session.pending.lock().remove(&self.frame);
    }
}

impl Session {
    pub(crate) fn new(
        id: u64,
        key: PeerKey,
        transport: TransportKind,
        outbound: mpsc::Sender<PeerMessage>,
    ) -> Self {
        let now = Instant::now();
        let (closed, _) = watch::channel(false);
        Self {
            id,
            key,
            transport,
            outbound,
            pending: Mutex::new(HashMap::new()),
            next_frame: AtomicU64::new(1),
            last_inbound: Mutex::new(now),
            last_active: Mutex::new(now),
            opened_at: Utc::now(),
            closed,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn key(&self) -> &PeerKey {
        &self.key
    }

    pub fn transport(&self) -> TransportKind {
        self.transport
    }

    /// Something arrived from the peer.
    pub(crate) fn touch_inbound(&self) {
        let now = Instant::now();
        *self.last_inbound.lock() = now;
        *self.last_active.lock() = now;
    }

    /// Time since the peer last sent anything.
    pub fn idle_for(&self) -> Duration {
        self.last_inbound.lock().elapsed()
    }

    /// Last time the session was used in either direction. Eviction
    /// picks the oldest.
    pub fn last_active(&self) -> Instant {
        *self.last_active.lock()
    }

    /// Forward a request and wait for the matching reply.
    pub async fn request(
        &self,
        request: DataRequest,
        timeout: Duration,
    ) -> Result<Value, ConnectionError> {
        if self.is_closed() {
            return Err(TransportError::Closed.into());
        }
        let frame = self.next_frame.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(frame, tx);
        let _guard = PendingGuard {
            session: self,
            frame,
        };
        *self.last_active.lock() = Instant::now();

        let exchange = async {
            self.outbound
                .send(PeerMessage::Data(DataFrame {
                    id: frame,
                    reply_to: None,
                    body: DataBody::Request(request),
                }))
                .await
                .map_err(|_| TransportError::Closed)?;
            rx.await.map_err(|_| TransportError::Closed)
        };

        match tokio::time::timeout(timeout, exchange).await {
            Err(_) => Err(ConnectionError::Timeout),
            Ok(Err(e)) => Err(e.into()),
            Ok(Ok(DataBody::Response { payload })) => Ok(payload),
            Ok(Ok(DataBody::Error { message })) => Err(ConnectionError::Remote(message)),
            Ok(Ok(DataBody::Request(_))) => Err(ConnectionError::Remote(
                "peer answered with a request".to_string(),
            )),
        }
    }

    /// Route a reply to whoever is waiting for `reply_to`. False if nobody is.
    pub(crate) fn complete(&self, reply_to: u64, body: DataBody) -> bool {
        match self.pending.lock().remove(&reply_to) {
            Some(waiter) => waiter.send(body).is_ok(),
            None => false,
        }
    }

    pub(crate) async fn send(&self, message: PeerMessage) -> Result<(), TransportError> {
        self.outbound
            .send(message)
            .await
            .map_err(|_| TransportError::Closed)
    }

    /// Mark closed and fail every in-flight request.
    pub(crate) fn close(&self) {
        self.closed.send_replace(true);
        self.pending.lock().clear();
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    pub(crate) fn closed_signal(&self) -> watch::Receiver<bool> {
        self.closed.subscribe()
    }

    pub fn info(&self) -> SessionInfo {
        SessionInfo {
            id: self.id,
            transport: self.transport,
            opened_at: self.opened_at,
            idle_ms: self.idle_for().as_millis() as u64,
            in_flight: self.pending.lock().len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::keys::NodeKeypair;
    use serde_json::json;
    use std::sync::Arc;

    fn session() -> (Arc<Session>, mpsc::Receiver<PeerMessage>) {
        let (tx, rx) = mpsc::channel(8);
        let key = PeerKey::new("net", NodeKeypair::generate().peer_id());
        (Arc::new(Session::new(1, key, TransportKind::Primary, tx)), rx)
    }

    fn request() -> DataRequest {
        DataRequest {
            network_id: "net".into(),
            address: "a".into(),
            payload: Value::Null,
        }
    }

    #[tokio::test]
    async fn reply_completes_request() {
        let (session, mut wire) = session();
        let s = session.clone();
        let call = tokio::spawn(async move { s.request(request(), Duration::from_secs(1)).await });

        let Some(PeerMessage::Data(frame)) = wire.recv().await else {
            panic!("expected request frame");
        };
        assert!(session.complete(
            frame.id,
            DataBody::Response {
                payload: json!(7)
            }
        ));
        assert_eq!(call.await.unwrap().unwrap(), json!(7));
        assert_eq!(session.info().in_flight, 0);
    }

    #[tokio::test]
    async fn timeout_leaves_no_pending_entry() {
        let (session, _wire) = session();
        let result = session.request(request(), Duration::from_millis(20)).await;
        assert!(matches!(result, Err(ConnectionError::Timeout)));
        assert_eq!(session.info().in_flight, 0);
        assert!(!session.complete(1, DataBody::Response { payload: json!(1) }));
    }

    #[tokio::test]
    async fn remote_errors_are_distinguished() {
        let (session, mut wire) = session();
        let s = session.clone();
        let call = tokio::spawn(async move { s.request(request(), Duration::from_secs(1)).await });
        let Some(PeerMessage::Data(frame)) = wire.recv().await else {
            panic!("expected request frame");
        };
        session.complete(
            frame.id,
            DataBody::Error {
                message: "no record".into(),
            },
        );
        assert!(matches!(
            call.await.unwrap(),
            Err(ConnectionError::Remote(m)) if m == "no record"
        ));
    }

    #[tokio::test]
    async fn close_fails_in_flight_requests() {
        let (session, mut wire) = session();
        let s = session.clone();
        let call = tokio::spawn(async move { s.request(request(), Duration::from_secs(5)).await });
        wire.recv().await.unwrap();
        session.close();
        assert!(matches!(
            call.await.unwrap(),
            Err(ConnectionError::Transport(TransportError::Closed))
        ));
        assert!(session.is_closed());
    }
}
