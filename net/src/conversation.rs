use crate::error::PeerResult;
use crate::wire_protocol::ProtocolMessage;

/// Zero or more outgoing messages plus whether the conversation is done.
/// A `Vec` rather than a single `Option<ProtocolMessage>` because the
/// handshake's responder role must answer one incoming `version` with two
/// outgoing messages (`verack` then its own `version`) in the same step.
pub struct ConversationAction {
    pub messages: Vec<ProtocolMessage>,
    pub topic_finished: bool,
}

impl ConversationAction {
    pub fn nop() -> Self {
        ConversationAction {
            messages: Vec::new(),
            topic_finished: false,
        }
    }

    pub fn single(message: ProtocolMessage) -> Self {
        ConversationAction {
            messages: vec![message],
            topic_finished: false,
        }
    }
}

/// Drives one self-contained exchange of messages over a connection, such
/// as the handshake. Kept separate from the steady-state reader/dispatcher
/// split in `connection.rs`, which runs once a `ConversationTopicHandler`
/// has finished.
pub trait ConversationTopicHandler {
    type Outcome;

    fn initial_action(&mut self) -> ConversationAction;
    fn on_message(&mut self, message: ProtocolMessage) -> PeerResult<ConversationAction>;
    /// the result of this conversation, once it's finished
    fn outcome(self) -> PeerResult<Self::Outcome>;
}
