mod codec;
mod message;
mod types;

pub use codec::{Frame, MessageCodec};
pub use message::{checksum, RawMessage, HEADER_LEN, KNOWN_COMMANDS, MAGIC, MAX_PAYLOAD_LEN};
pub use types::{
    Address, AddrMessage, FullAddress, GetDataMessage, InvMessage, InventoryVector, ObjectMessage,
    ProtocolMessage, VersionMessage, SERVICE_NODE_NETWORK,
};
