//! # Fallback Transport
//!
//! When a WebSocket cannot be established the session runs over plain
//! HTTP instead:
//!
//! - `GET  {endpoint}/service/events?session=<id>` is a server-sent event
//!   stream carrying host -> dialer messages, one JSON message per `data:`
//!   event.
//! - `POST {endpoint}/service/messages?session=<id>` carries each
//!   dialer -> host message as a JSON body.
//!
//! The dialer picks the session id. [`SseSessions`] is the host-side table
//! the HTTP handlers use to route POSTed messages into the right session.

use async_trait::async_trait;
use dashmap::DashMap;
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::host::SessionHost;
use super::message::PeerMessage;
use super::{http_url, Channel, Connector, TransportError};
use crate::config::{
    SERVICE_EVENTS_PATH, SERVICE_MESSAGES_PATH, SESSION_QUERY_PARAM, SESSION_QUEUE_DEPTH,
};
use crate::model::{PeerRecord, TransportKind};

// ---------------------------------------------------------------------------
// Dialer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct SseConnector {
    client: reqwest::Client,
}

impl SseConnector {
    pub fn new() -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .build()
            .map_err(|e| TransportError::Http(e.to_string()))?;
        Ok(Self { client })
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Connector for SseConnector {
    fn kind(&self) -> TransportKind {
        TransportKind::Fallback
    }

    async fn open(&self, peer: &PeerRecord) -> Result<Channel, TransportError> {
        let session_id = uuid::Uuid::new_v4().to_string();
        let events_url = http_url(&peer.endpoint, SERVICE_EVENTS_PATH);
        let messages_url = http_url(&peer.endpoint, SERVICE_MESSAGES_PATH);

        let response = self
            .client
            .get(&events_url)
            .query(&[(SESSION_QUERY_PARAM, session_id.as_str())])
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .send()
            .await
            .map_err(|e| TransportError::Connect(format!("{events_url}: {e}")))?;
        if !response.status().is_success() {
            return Err(TransportError::Connect(format!(
                "{events_url}: status {}",
                response.status()
            )));
        }
        debug!(peer = %peer.key(), session = %session_id, "event stream open");

        let (outbound_tx, mut outbound_rx) = mpsc::channel::<PeerMessage>(SESSION_QUEUE_DEPTH);
        let (inbound_tx, inbound_rx) = mpsc::channel::<PeerMessage>(SESSION_QUEUE_DEPTH);

        // Events -> inbound queue.
        let key = peer.key();
        let mut stream = response.bytes_stream();
        tokio::spawn(async move {
            let mut buffer = Vec::new();
            while let Some(chunk) = stream.next().await {
                let chunk = match chunk {
                    Ok(chunk) => chunk,
                    Err(e) => {
                        debug!(peer = %key, error = %e, "event stream error");
                        break;
                    }
                };
                buffer.extend_from_slice(&chunk);
                for data in drain_events(&mut buffer) {
                    match PeerMessage::from_json(&data) {
                        Ok(message) => {
                            if inbound_tx.send(message).await.is_err() {
                                return;
                            }
                        }
                        Err(e) => warn!(peer = %key, error = %e, "malformed event"),
                    }
                }
            }
        });

        // Outbound queue -> POSTs, in order.
        let client = self.client.clone();
        tokio::spawn(async move {
            while let Some(message) = outbound_rx.recv().await {
                let result = client
                    .post(&messages_url)
                    .query(&[(SESSION_QUERY_PARAM, session_id.as_str())])
                    .json(&message)
                    .send()
                    .await;
                match result {
                    Ok(response) if response.status().is_success() => {}
                    Ok(response) => {
                        debug!(status = %response.status(), "message channel rejected post");
                        break;
                    }
                    Err(e) => {
                        debug!(error = %e, "message channel failed");
                        break;
                    }
                }
            }
        });

        Ok(Channel {
            outbound: outbound_tx,
            inbound: inbound_rx,
        })
    }
}

/// Pull every complete event out of `buffer` and return their `data`
/// payloads. A trailing partial event stays in the buffer as raw bytes.
///
/// Chunk boundaries fall anywhere, including inside a UTF-8 sequence, so
/// text is only decoded once an event is complete.
pub(crate) fn drain_events(buffer: &mut Vec<u8>) -> Vec<String> {
    buffer.retain(|b| *b != b'\r');
    let mut out = Vec::new();
    let mut start = 0;
    while let Some(end) = find_event_end(&buffer[start..]) {
        let event = String::from_utf8_lossy(&buffer[start..start + end]);
        let data: Vec<&str> = event
            .lines()
            .filter_map(|line| line.strip_prefix("data:"))
            .map(|value| value.strip_prefix(' ').unwrap_or(value))
            .collect();
        if !data.is_empty() {
            out.push(data.join("\n"));
        }
        start += end + 2;
    }
    buffer.drain(..start);
    out
}

fn find_event_end(bytes: &[u8]) -> Option<usize> {
    bytes.windows(2).position(|pair| pair == b"\n\n")
}

// ---------------------------------------------------------------------------
// Host side
// ---------------------------------------------------------------------------

/// Open fallback sessions on the hosting node, by dialer-chosen id.
#[derive(Clone, Default)]
pub struct SseSessions {
    inner: Arc<DashMap<String, mpsc::Sender<PeerMessage>>>,
}

impl SseSessions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start hosting session `session_id`. Returns the queue of messages
    /// to stream back as events. The session is forgotten when the host
    /// finishes with it.
    pub fn open(
        &self,
        host: Arc<SessionHost>,
        session_id: String,
    ) -> Result<mpsc::Receiver<PeerMessage>, TransportError> {
        let (inbound_tx, inbound_rx) = mpsc::channel(SESSION_QUEUE_DEPTH);
        let (outbound_tx, outbound_rx) = mpsc::channel(SESSION_QUEUE_DEPTH);

        match self.inner.entry(session_id.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                return Err(TransportError::Connect(format!(
                    "session {session_id} already open"
                )))
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(inbound_tx);
            }
        }

        let sessions = self.inner.clone();
        tokio::spawn(async move {
            host.serve(TransportKind::Fallback, inbound_rx, outbound_tx)
                .await;
            sessions.remove(&session_id);
        });
        Ok(outbound_rx)
    }

    /// Hand a POSTed message to its session.
    pub async fn deliver(
        &self,
        session_id: &str,
        message: PeerMessage,
    ) -> Result<(), TransportError> {
        let sender = self
            .inner
            .get(session_id)
            .map(|s| s.value().clone())
            .ok_or(TransportError::Closed)?;
        sender.send(message).await.map_err(|_| TransportError::Closed)
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn complete_events_are_drained() {
        let mut buffer =
            b"data: {\"a\":1}\n\n: comment\n\ndata: {\"b\":\ndata: 2}\n\ndata: {\"c\"".to_vec();
        let events = drain_events(&mut buffer);
        assert_eq!(events, vec!["{\"a\":1}".to_string(), "{\"b\":\n2}".to_string()]);
        assert_eq!(buffer, b"data: {\"c\"".to_vec());

        buffer.extend_from_slice(b":3}\r\n\r\n");
        assert_eq!(drain_events(&mut buffer), vec!["{\"c\":3}".to_string()]);
        assert!(buffer.is_empty());
    }

    #[test]
    fn multibyte_characters_survive_a_split_chunk() {
        let event = "data: {\"name\":\"café ☕\"}\n\n".as_bytes();
        // Cut inside the two-byte "é".
        let cut = event.iter().position(|b| *b == 0xC3).unwrap() + 1;

        let mut buffer = event[..cut].to_vec();
        assert!(drain_events(&mut buffer).is_empty());
        buffer.extend_from_slice(&event[cut..]);
        assert_eq!(
            drain_events(&mut buffer),
            vec!["{\"name\":\"café ☕\"}".to_string()]
        );
        assert!(buffer.is_empty());
    }

    #[test]
    fn crlf_split_across_chunks_still_ends_the_event() {
        let mut buffer = b"data: 1\r\n\r".to_vec();
        assert!(drain_events(&mut buffer).is_empty());
        buffer.extend_from_slice(b"\n");
        assert_eq!(drain_events(&mut buffer), vec!["1".to_string()]);
    }

    #[tokio::test]
    async fn delivering_to_unknown_session_fails() {
        let sessions = SseSessions::new();
        assert!(sessions.is_empty());
        let result = sessions.deliver("nope", PeerMessage::ping()).await;
        assert!(matches!(result, Err(TransportError::Closed)));
    }
}
