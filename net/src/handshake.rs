//! The `version`/`verack` handshake, driven through the same
//! `ConversationTopicHandler` abstraction `bitmagier-p2p-bitcoin-handshake`
//! used for its one-shot demo, generalized to the protocol's
//! order-sensitive roles (spec.md §4.5).

use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::time::{timeout, Duration};
use tokio_util::codec::Framed;

use crate::conversation::{ConversationAction, ConversationTopicHandler};
use crate::error::{PeerError, PeerResult};
use crate::wire_protocol::{Frame, MessageCodec, ProtocolMessage, VersionMessage};

pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(20);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Role {
    Initiator,
    Responder,
}

/// Drives one side of the handshake to completion or rejection. Outcome is
/// the remote's validated `version` message.
pub struct Handshake {
    role: Role,
    our_version: VersionMessage,
    sent_version: bool,
    sent_verack: bool,
    received_verack: bool,
    received_version: Option<VersionMessage>,
}

impl Handshake {
    pub fn initiator(our_version: VersionMessage) -> Self {
        Handshake {
            role: Role::Initiator,
            our_version,
            sent_version: false,
            sent_verack: false,
            received_verack: false,
            received_version: None,
        }
    }

    pub fn responder(our_version: VersionMessage) -> Self {
        Handshake {
            role: Role::Responder,
            our_version,
            sent_version: false,
            sent_verack: false,
            received_verack: false,
            received_version: None,
        }
    }

    fn reject_remote(&self, remote: &VersionMessage) -> Option<&'static str> {
        if remote.nonce == self.our_version.nonce {
            return Some("self-connection: nonce matches our own");
        }
        if remote.version < 3 {
            return Some("unsupported protocol version");
        }
        if remote.stream_numbers != [1] {
            return Some("unsupported stream numbers");
        }
        if !remote.node_network() {
            return Some("peer does not advertise NodeNetwork service");
        }
        None
    }
}

impl ConversationTopicHandler for Handshake {
    type Outcome = VersionMessage;

    fn initial_action(&mut self) -> ConversationAction {
        match self.role {
            Role::Initiator => {
                self.sent_version = true;
                ConversationAction::single(ProtocolMessage::Version(self.our_version.clone()))
            }
            Role::Responder => ConversationAction::nop(),
        }
    }

    fn on_message(&mut self, message: ProtocolMessage) -> PeerResult<ConversationAction> {
        match message {
            ProtocolMessage::Version(remote) => {
                if self.received_version.is_some() {
                    return Err(PeerError::Violation("duplicate version message".to_string()));
                }
                if let Some(reason) = self.reject_remote(&remote) {
                    return Err(PeerError::Violation(reason.to_string()));
                }
                self.received_version = Some(remote);
                match self.role {
                    Role::Initiator => {
                        if !self.received_verack {
                            return Err(PeerError::Violation("version arrived before verack".to_string()));
                        }
                        self.sent_verack = true;
                        Ok(ConversationAction { messages: vec![ProtocolMessage::Verack], topic_finished: true })
                    }
                    Role::Responder => {
                        self.sent_verack = true;
                        self.sent_version = true;
                        Ok(ConversationAction {
                            messages: vec![ProtocolMessage::Verack, ProtocolMessage::Version(self.our_version.clone())],
                            topic_finished: false,
                        })
                    }
                }
            }
            ProtocolMessage::Verack => {
                if !self.sent_version {
                    return Err(PeerError::Violation("verack arrived before we sent our version".to_string()));
                }
                self.received_verack = true;
                let topic_finished = self.received_version.is_some() && self.sent_verack;
                Ok(ConversationAction { messages: Vec::new(), topic_finished })
            }
            other => Err(PeerError::Violation(format!("unexpected {} message during handshake", other.command()))),
        }
    }

    fn outcome(self) -> PeerResult<VersionMessage> {
        self.received_version.ok_or_else(|| PeerError::Violation("handshake ended without a version message".to_string()))
    }
}

/// Drives `handler` to completion over `framed`, under one overall deadline
/// (the handshaking state has a single 20s timeout, unlike the steady
/// state's per-iteration reset).
pub async fn run_handshake<H: ConversationTopicHandler<Outcome = VersionMessage>>(
    framed: &mut Framed<TcpStream, MessageCodec>,
    handler: H,
) -> PeerResult<VersionMessage> {
    timeout(HANDSHAKE_TIMEOUT, drive(framed, handler))
        .await
        .map_err(|_| PeerError::Violation("handshake timed out".to_string()))?
}

async fn drive<H: ConversationTopicHandler<Outcome = VersionMessage>>(
    framed: &mut Framed<TcpStream, MessageCodec>,
    mut handler: H,
) -> PeerResult<VersionMessage> {
    let initial = handler.initial_action();
    for message in initial.messages {
        log::debug!("sending {:?}", message);
        framed.send(message).await?;
    }
    if initial.topic_finished {
        return handler.outcome();
    }

    loop {
        let frame = framed.next().await.ok_or(PeerError::RemoteClosed)??;
        let message = match frame {
            Frame::Message(message) => message,
            Frame::Raw(raw) => {
                log::debug!("ignoring unrecognized {} message during handshake", raw.command_type);
                continue;
            }
        };
        log::debug!("received {:?}", message);
        let action = handler.on_message(message)?;
        for reply in action.messages {
            log::debug!("sending {:?}", reply);
            framed.send(reply).await?;
        }
        if action.topic_finished {
            return handler.outcome();
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::wire_protocol::{Address, SERVICE_NODE_NETWORK};

    fn version(nonce: u64) -> VersionMessage {
        VersionMessage {
            version: 3,
            services: SERVICE_NODE_NETWORK,
            timestamp: 1_700_000_000,
            addr_recv: Address { services: SERVICE_NODE_NETWORK, ip: [0u8; 16], port: 8444 },
            addr_from: Address { services: SERVICE_NODE_NETWORK, ip: [0u8; 16], port: 8444 },
            nonce,
            user_agent: "/test:1.0/".to_string(),
            stream_numbers: vec![1],
        }
    }

    #[test]
    fn initiator_happy_path() {
        let mut h = Handshake::initiator(version(1));
        let initial = h.initial_action();
        assert_eq!(initial.messages, vec![ProtocolMessage::Version(version(1))]);
        assert!(!initial.topic_finished);

        let a = h.on_message(ProtocolMessage::Verack).unwrap();
        assert!(a.messages.is_empty());
        assert!(!a.topic_finished);

        let a = h.on_message(ProtocolMessage::Version(version(2))).unwrap();
        assert_eq!(a.messages, vec![ProtocolMessage::Verack]);
        assert!(a.topic_finished);
        assert_eq!(h.outcome().unwrap(), version(2));
    }

    #[test]
    fn responder_happy_path() {
        let mut h = Handshake::responder(version(1));
        let initial = h.initial_action();
        assert!(initial.messages.is_empty());

        let a = h.on_message(ProtocolMessage::Version(version(2))).unwrap();
        assert_eq!(a.messages, vec![ProtocolMessage::Verack, ProtocolMessage::Version(version(1))]);
        assert!(!a.topic_finished);

        let a = h.on_message(ProtocolMessage::Verack).unwrap();
        assert!(a.messages.is_empty());
        assert!(a.topic_finished);
        assert_eq!(h.outcome().unwrap(), version(2));
    }

    #[test]
    fn rejects_self_connection_nonce() {
        let mut h = Handshake::initiator(version(7));
        h.initial_action();
        let err = h.on_message(ProtocolMessage::Version(version(7))).unwrap_err();
        assert!(matches!(err, PeerError::Violation(_)));
    }

    #[test]
    fn rejects_old_protocol_version() {
        let mut h = Handshake::responder(version(1));
        let mut remote = version(2);
        remote.version = 2;
        let err = h.on_message(ProtocolMessage::Version(remote)).unwrap_err();
        assert!(matches!(err, PeerError::Violation(_)));
    }

    #[test]
    fn rejects_wrong_stream_numbers() {
        let mut h = Handshake::responder(version(1));
        let mut remote = version(2);
        remote.stream_numbers = vec![1, 2];
        let err = h.on_message(ProtocolMessage::Version(remote)).unwrap_err();
        assert!(matches!(err, PeerError::Violation(_)));
    }

    #[test]
    fn rejects_missing_node_network_service() {
        let mut h = Handshake::responder(version(1));
        let mut remote = version(2);
        remote.services = 0;
        let err = h.on_message(ProtocolMessage::Version(remote)).unwrap_err();
        assert!(matches!(err, PeerError::Violation(_)));
    }

    #[test]
    fn verack_before_version_sent_is_a_violation() {
        let mut h = Handshake::responder(version(1));
        let err = h.on_message(ProtocolMessage::Verack).unwrap_err();
        assert!(matches!(err, PeerError::Violation(_)));
    }
}
