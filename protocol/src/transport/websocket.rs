//! Primary transport: one WebSocket per session, JSON text frames.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message};
use tracing::{debug, trace, warn};

use super::message::PeerMessage;
use super::{websocket_url, Channel, Connector, TransportError};
use crate::config::{SERVICE_WEBSOCKET_PATH, SESSION_QUEUE_DEPTH};
use crate::model::{PeerRecord, TransportKind};

#[derive(Debug, Clone, Default)]
pub struct WsConnector;

impl WsConnector {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Connector for WsConnector {
    fn kind(&self) -> TransportKind {
        TransportKind::Primary
    }

    async fn open(&self, peer: &PeerRecord) -> Result<Channel, TransportError> {
        let url = websocket_url(&peer.endpoint, SERVICE_WEBSOCKET_PATH);
        let (socket, _) = connect_async(url.as_str())
            .await
            .map_err(|e| TransportError::Connect(format!("{url}: {e}")))?;
        debug!(peer = %peer.key(), %url, "websocket open");

        let (mut sink, mut stream) = socket.split();
        let (outbound_tx, mut outbound_rx) = mpsc::channel::<PeerMessage>(SESSION_QUEUE_DEPTH);
        let (inbound_tx, inbound_rx) = mpsc::channel::<PeerMessage>(SESSION_QUEUE_DEPTH);

        // Writer: queue -> socket. Ends when the session drops its sender.
        tokio::spawn(async move {
            while let Some(message) = outbound_rx.recv().await {
                let text = match message.to_json() {
                    Ok(text) => text,
                    Err(e) => {
                        warn!(error = %e, "dropping unencodable message");
                        continue;
                    }
                };
                if sink.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
            let _ = sink.close().await;
        });

        // Reader: socket -> queue. Dropping `inbound_tx` signals the close.
        let key = peer.key();
        tokio::spawn(async move {
            while let Some(frame) = stream.next().await {
                match frame {
                    Ok(Message::Text(text)) => match PeerMessage::from_json(&text) {
                        Ok(message) => {
                            if inbound_tx.send(message).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => warn!(peer = %key, error = %e, "malformed frame"),
                    },
                    Ok(Message::Close(frame)) => {
                        trace!(peer = %key, ?frame, "websocket closed by peer");
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        debug!(peer = %key, error = %e, "websocket error");
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
