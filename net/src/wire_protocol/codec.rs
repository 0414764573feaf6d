//! A Tokio codec mapping a byte stream to Bitmessage message frames.
//!
//! Modeled after the header/body split used by Bitcoin-family codecs in the
//! wider ecosystem: the decoder first waits for the fixed-size header, then
//! waits for exactly `length` payload bytes before producing a frame.

use bytes::{Buf, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::WireError;
use crate::wire_protocol::message::{
    checksum, decode_command, encode_command, RawMessage, HEADER_LEN, KNOWN_COMMANDS, MAGIC, MAX_PAYLOAD_LEN,
};
use crate::wire_protocol::types::ProtocolMessage;

/// A decoded frame: either a message this node understands, or an opaque
/// one it doesn't.
#[derive(Clone, Debug, PartialEq)]
pub enum Frame {
    Message(ProtocolMessage),
    Raw(RawMessage),
}

#[derive(Clone, Copy, Debug)]
struct Head {
    command: [u8; 12],
    len: usize,
    checksum: [u8; 4],
}

#[derive(Clone, Copy, Debug)]
enum DecodeState {
    Head,
    Body(Head),
}

pub struct MessageCodec {
    state: DecodeState,
}

impl Default for MessageCodec {
    fn default() -> Self {
        MessageCodec { state: DecodeState::Head }
    }
}

impl MessageCodec {
    pub fn new() -> Self {
        Self::default()
    }

    fn parse_head(&mut self, src: &mut BytesMut) -> Result<Option<Head>, WireError> {
        if src.len() < HEADER_LEN {
            src.reserve(HEADER_LEN - src.len());
            return Ok(None);
        }
        let magic = u32::from_be_bytes(src[0..4].try_into().unwrap());
        if magic != MAGIC {
            return Err(WireError::BadMagic { expected: MAGIC, got: magic });
        }
        let mut command = [0u8; 12];
        command.copy_from_slice(&src[4..16]);
        let len = u32::from_be_bytes(src[16..20].try_into().unwrap()) as usize;
        if len > MAX_PAYLOAD_LEN {
            return Err(WireError::TooLong { field: "payload" });
        }
        let mut csum = [0u8; 4];
        csum.copy_from_slice(&src[20..24]);
        src.advance(HEADER_LEN);
        Ok(Some(Head { command, len, checksum: csum }))
    }
}

impl Decoder for MessageCodec {
    type Item = Frame;
    type Error = WireError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let head = match self.state {
            DecodeState::Head => match self.parse_head(src)? {
                Some(head) => {
                    self.state = DecodeState::Body(head);
                    head
                }
                None => return Ok(None),
            },
            DecodeState::Body(head) => head,
        };

        if src.len() < head.len {
            src.reserve(head.len - src.len());
            return Ok(None);
        }

        let payload = src.split_to(head.len).freeze().to_vec();
        self.state = DecodeState::Head;

        if checksum(&payload) != head.checksum {
            return Err(WireError::BadChecksum);
        }

        let command = decode_command(&head.command);
        if KNOWN_COMMANDS.contains(&command.as_str()) {
            match ProtocolMessage::decode(&command, &payload)? {
                Some(message) => Ok(Some(Frame::Message(message))),
                None => unreachable!("command is in KNOWN_COMMANDS"),
            }
        } else {
            Ok(Some(Frame::Raw(RawMessage { command_type: command, payload })))
        }
    }
}

impl Encoder<ProtocolMessage> for MessageCodec {
    type Error = WireError;

    fn encode(&mut self, item: ProtocolMessage, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let command = encode_command(item.command()).expect("built-in command names fit in 12 bytes");
        let payload = item.encode_payload();
        if payload.len() > MAX_PAYLOAD_LEN {
            return Err(WireError::TooLong { field: "payload" });
        }
        dst.reserve(HEADER_LEN + payload.len());
        dst.extend_from_slice(&MAGIC.to_be_bytes());
        dst.extend_from_slice(&command);
        dst.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        dst.extend_from_slice(&checksum(&payload));
        dst.extend_from_slice(&payload);
        Ok(())
    }
}
