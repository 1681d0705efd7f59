//! Per-type handling of messages arriving on an established session.
//!
//! Both ends of a session run the same table: a ping gets a pong, a data
//! request gets answered from the local resolver, and anything that only
//! makes sense during the handshake is dropped.

use std::sync::Arc;
use tracing::{debug, trace};

use super::message::{DataBody, DataFrame, DataRequest, HeartbeatKind, PeerMessage};
use crate::model::PeerKey;
use crate::routing::LocalResolver;

pub struct MessageDispatcher {
    resolver: Arc<dyn LocalResolver>,
}

impl MessageDispatcher {
    pub fn new(resolver: Arc<dyn LocalResolver>) -> Self {
        Self { resolver }
    }

    /// Handle one inbound message from `peer`. Returns the reply to send
    /// back, if any.
    pub fn dispatch(&self, peer: &PeerKey, message: PeerMessage) -> Option<PeerMessage> {
        match message {
            PeerMessage::Heartbeat(beat) => match beat.kind {
                HeartbeatKind::Ping => Some(PeerMessage::pong()),
                HeartbeatKind::Pong => None,
            },
            PeerMessage::Data(frame) => self.on_data(peer, frame),
            other => {
                debug!(peer = %peer, kind = %other.kind(), "ignoring message on established session");
                None
            }
        }
    }

    fn on_data(&self, peer: &PeerKey, frame: DataFrame) -> Option<PeerMessage> {
        let DataBody::Request(request) = frame.body else {
            // A reply nobody is waiting for any more.
            trace!(peer = %peer, frame = frame.id, "unsolicited data reply");
            return None;
        };
        let body = self.answer(peer, &request);
        Some(PeerMessage::Data(DataFrame {
            id: frame.id,
            reply_to: Some(frame.id),
            body,
        }))
    }

    fn answer(&self, peer: &PeerKey, request: &DataRequest) -> DataBody {
        if request.network_id != peer.network_id {
            return DataBody::Error {
                message: format!(
                    "request for network {} on a session bound to {}",
                    request.network_id, peer.network_id
                ),
            };
        }
        match self.resolver.resolve(request) {
            Some(payload) => {
                trace!(peer = %peer, address = %request.address, "answered data request");
                DataBody::Response { payload }
            }
            None => DataBody::Error {
                message: format!("no record at {}", request.address),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::keys::NodeKeypair;
    use crate::routing::DataIndex;
    use serde_json::{json, Value};

    fn setup() -> (MessageDispatcher, PeerKey) {
        let index = Arc::new(DataIndex::new());
        index.publish("net", "books/1", json!({"title": "Solaris"}));
        let key = PeerKey::new("net", NodeKeypair::generate().peer_id());
        (MessageDispatcher::new(index), key)
    }

    fn request(network: &str, address: &str) -> PeerMessage {
        PeerMessage::Data(DataFrame {
            id: 4,
            reply_to: None,
            body: DataBody::Request(DataRequest {
                network_id: network.into(),
                address: address.into(),
                payload: Value::Null,
            }),
        })
    }

    #[test]
    fn ping_gets_pong() {
        let (dispatcher, key) = setup();
        let reply = dispatcher.dispatch(&key, PeerMessage::ping()).unwrap();
        assert!(matches!(
            reply,
            PeerMessage::Heartbeat(b) if b.kind == HeartbeatKind::Pong
        ));
        assert!(dispatcher.dispatch(&key, PeerMessage::pong()).is_none());
    }

    #[test]
    fn data_request_is_answered_from_index() {
        let (dispatcher, key) = setup();
        let Some(PeerMessage::Data(frame)) = dispatcher.dispatch(&key, request("net", "books/1"))
        else {
            panic!("expected data reply");
        };
        assert_eq!(frame.reply_to, Some(4));
        assert_eq!(
            frame.body,
            DataBody::Response {
                payload: json!({"title": "Solaris"})
            }
        );
    }

    #[test]
    fn misses_and_foreign_networks_are_errors() {
        let (dispatcher, key) = setup();
        for message in [request("net", "books/2"), request("other", "books/1")] {
            let Some(PeerMessage::Data(frame)) = dispatcher.dispatch(&key, message) else {
                panic!("expected data reply");
            };
            assert!(matches!(frame.body, DataBody::Error { .. }));
        }
    }

    #[test]
    fn replies_are_not_answered() {
        let (dispatcher, key) = setup();
        let reply = PeerMessage::Data(DataFrame {
            id: 1,
            reply_to: Some(1),
            body: DataBody::Response {
                payload: Value::Null,
            },
        });
        assert!(dispatcher.dispatch(&key, reply).is_none());
    }
}
