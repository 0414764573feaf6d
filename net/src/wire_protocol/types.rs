use sha2::{Digest, Sha512};

use crate::error::{WireError, WireResult};
use crate::varint;

/// Content identifier of an object: the first 32 bytes of the double-SHA-512
/// of its serialized body. Ordering is lexicographic over the 32 bytes,
/// which falls directly out of deriving `Ord` on a `[u8; 32]` newtype.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct InventoryVector(pub [u8; 32]);

impl InventoryVector {
    pub const LEN: usize = 32;

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// First 32 bytes of `SHA512(SHA512(body))`.
    pub fn of_object_body(body: &[u8]) -> Self {
        let first = Sha512::digest(body);
        let second = Sha512::digest(first);
        let mut out = [0u8; 32];
        out.copy_from_slice(&second[..32]);
        InventoryVector(out)
    }
}

impl std::fmt::Debug for InventoryVector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for byte in &self.0 {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

/// Only `NodeNetwork` is a recognized bit; every other bit is preserved
/// verbatim across a decode/encode round-trip.
pub const SERVICE_NODE_NETWORK: u64 = 0x1;

/// `(services, ip, port)`, 26 bytes on the wire, big-endian throughout.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Address {
    pub services: u64,
    pub ip: [u8; 16],
    pub port: u16,
}

impl Address {
    pub const ENCODED_LEN: usize = 8 + 16 + 2;

    pub fn node_network(&self) -> bool {
        self.services & SERVICE_NODE_NETWORK != 0
    }

    pub fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.services.to_be_bytes());
        out.extend_from_slice(&self.ip);
        out.extend_from_slice(&self.port.to_be_bytes());
    }

    pub fn decode(buf: &[u8]) -> WireResult<Self> {
        let b = buf.get(..Self::ENCODED_LEN).ok_or(WireError::UnexpectedEof)?;
        let services = u64::from_be_bytes(b[0..8].try_into().unwrap());
        let mut ip = [0u8; 16];
        ip.copy_from_slice(&b[8..24]);
        let port = u16::from_be_bytes(b[24..26].try_into().unwrap());
        Ok(Address { services, ip, port })
    }
}

/// `Address` plus a timestamp and stream number, used only in `addr` gossip.
///
/// Fixed at 34 bytes (4-byte timestamp, 4-byte stream, 26-byte `Address`).
/// The source this protocol is modeled on carries two mutually inconsistent
/// `FullAddress` layouts; this is the one consistent with the unambiguous
/// 26-byte `Address` width used inside `version` (see DESIGN.md).
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct FullAddress {
    pub time: u32,
    pub stream: u32,
    pub address: Address,
}

impl FullAddress {
    pub const ENCODED_LEN: usize = 4 + 4 + Address::ENCODED_LEN;

    pub fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.time.to_be_bytes());
        out.extend_from_slice(&self.stream.to_be_bytes());
        self.address.encode(out);
    }

    pub fn decode(buf: &[u8]) -> WireResult<Self> {
        let b = buf.get(..Self::ENCODED_LEN).ok_or(WireError::UnexpectedEof)?;
        let time = u32::from_be_bytes(b[0..4].try_into().unwrap());
        let stream = u32::from_be_bytes(b[4..8].try_into().unwrap());
        let address = Address::decode(&b[8..])?;
        Ok(FullAddress { time, stream, address })
    }
}

/// `version` message: protocol version, services, timestamp, both
/// endpoints' addresses, a handshake nonce, a user agent, and the stream
/// numbers the sender participates in.
#[derive(Clone, Debug, PartialEq)]
pub struct VersionMessage {
    pub version: i32,
    pub services: u64,
    pub timestamp: i64,
    pub addr_recv: Address,
    pub addr_from: Address,
    pub nonce: u64,
    pub user_agent: String,
    pub stream_numbers: Vec<u64>,
}

impl VersionMessage {
    pub const MIN_LEN: usize = 80;

    pub fn node_network(&self) -> bool {
        self.services & SERVICE_NODE_NETWORK != 0
    }

    pub fn encode_payload(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(128);
        out.extend_from_slice(&self.version.to_be_bytes());
        out.extend_from_slice(&self.services.to_be_bytes());
        out.extend_from_slice(&self.timestamp.to_be_bytes());
        self.addr_recv.encode(&mut out);
        self.addr_from.encode(&mut out);
        out.extend_from_slice(&self.nonce.to_be_bytes());
        out.extend_from_slice(&varint::encode_varstr(&self.user_agent));
        out.extend_from_slice(&varint::encode_uvarint_list(&self.stream_numbers));
        out
    }

    pub fn decode_payload(b: &[u8]) -> WireResult<Self> {
        if b.len() < Self::MIN_LEN {
            return Err(WireError::UnexpectedEof);
        }
        let version = i32::from_be_bytes(b[0..4].try_into().unwrap());
        let services = u64::from_be_bytes(b[4..12].try_into().unwrap());
        let timestamp = i64::from_be_bytes(b[12..20].try_into().unwrap());
        let addr_recv = Address::decode(&b[20..46])?;
        let addr_from = Address::decode(&b[46..72])?;
        let nonce = u64::from_be_bytes(b[72..80].try_into().unwrap());
        let (user_agent, consumed) = varint::decode_varstr(&b[80..])?;
        let (stream_numbers, _) = varint::decode_uvarint_list(&b[80 + consumed..])?;
        Ok(VersionMessage {
            version,
            services,
            timestamp,
            addr_recv,
            addr_from,
            nonce,
            user_agent,
            stream_numbers,
        })
    }
}

/// `addr`: a list of gossiped peer addresses, capped at 1000 entries.
#[derive(Clone, Debug, PartialEq)]
pub struct AddrMessage {
    pub addresses: Vec<FullAddress>,
}

impl AddrMessage {
    pub const MAX_ENTRIES: usize = 1000;

    pub fn encode_payload(&self) -> Vec<u8> {
        let truncated = &self.addresses[..self.addresses.len().min(Self::MAX_ENTRIES)];
        let mut out = varint::encode_tagged(truncated.len() as u64);
        for addr in truncated {
            addr.encode(&mut out);
        }
        out
    }

    pub fn decode_payload(b: &[u8]) -> WireResult<Self> {
        let (count, mut pos) = varint::decode_tagged(b)?;
        if count as usize > Self::MAX_ENTRIES {
            return Err(WireError::TooLong { field: "addr" });
        }
        let mut addresses = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let entry = FullAddress::decode(&b[pos..])?;
            pos += FullAddress::ENCODED_LEN;
            addresses.push(entry);
        }
        Ok(AddrMessage { addresses })
    }
}

fn encode_vector_list(vectors: &[InventoryVector]) -> Vec<u8> {
    let mut out = varint::encode_tagged(vectors.len() as u64);
    for v in vectors {
        out.extend_from_slice(&v.0);
    }
    out
}

fn decode_vector_list(b: &[u8]) -> WireResult<Vec<InventoryVector>> {
    let (count, pos) = varint::decode_tagged(b)?;
    let remaining = b.len() - pos;
    let needed = count as usize * InventoryVector::LEN;
    if needed > remaining {
        return Err(WireError::BadLength { got: needed, max: remaining });
    }
    let mut vectors = Vec::with_capacity(count as usize);
    for i in 0..count as usize {
        let start = pos + i * InventoryVector::LEN;
        let mut v = [0u8; 32];
        v.copy_from_slice(&b[start..start + InventoryVector::LEN]);
        vectors.push(InventoryVector(v));
    }
    Ok(vectors)
}

/// `inv`: inventory vectors the sender holds.
#[derive(Clone, Debug, PartialEq)]
pub struct InvMessage {
    pub vectors: Vec<InventoryVector>,
}

impl InvMessage {
    pub fn encode_payload(&self) -> Vec<u8> {
        encode_vector_list(&self.vectors)
    }

    pub fn decode_payload(b: &[u8]) -> WireResult<Self> {
        Ok(InvMessage { vectors: decode_vector_list(b)? })
    }
}

/// `getdata`: a request for the bodies of the listed inventory vectors.
#[derive(Clone, Debug, PartialEq)]
pub struct GetDataMessage {
    pub vectors: Vec<InventoryVector>,
}

impl GetDataMessage {
    pub fn encode_payload(&self) -> Vec<u8> {
        encode_vector_list(&self.vectors)
    }

    pub fn decode_payload(b: &[u8]) -> WireResult<Self> {
        Ok(GetDataMessage { vectors: decode_vector_list(b)? })
    }
}

/// `object`: a fixed prefix (PoW nonce, expiration, type, version, stream)
/// followed by an opaque payload the codec never interprets. The payload
/// of the envelope this message decodes from *is* the object's serialized
/// body as defined by the data model: storing it verbatim is sufficient to
/// reconstruct the object later.
#[derive(Clone, Debug, PartialEq)]
pub struct ObjectMessage {
    pub nonce: [u8; 8],
    pub expiration: i64,
    pub object_type: u32,
    pub object_version: u64,
    pub stream: u64,
    pub payload: Vec<u8>,
}

impl ObjectMessage {
    pub const FIXED_PREFIX_LEN: usize = 8 + 8 + 4;

    pub fn encode_payload(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::FIXED_PREFIX_LEN + self.payload.len());
        out.extend_from_slice(&self.nonce);
        out.extend_from_slice(&self.expiration.to_be_bytes());
        out.extend_from_slice(&self.object_type.to_be_bytes());
        out.extend_from_slice(&varint::encode_tagged(self.object_version));
        out.extend_from_slice(&varint::encode_tagged(self.stream));
        out.extend_from_slice(&self.payload);
        out
    }

    pub fn decode_payload(b: &[u8]) -> WireResult<Self> {
        if b.len() < Self::FIXED_PREFIX_LEN {
            return Err(WireError::UnexpectedEof);
        }
        let mut nonce = [0u8; 8];
        nonce.copy_from_slice(&b[0..8]);
        let expiration = i64::from_be_bytes(b[8..16].try_into().unwrap());
        let object_type = u32::from_be_bytes(b[16..20].try_into().unwrap());
        let (object_version, n1) = varint::decode_tagged(&b[20..])?;
        let (stream, n2) = varint::decode_tagged(&b[20 + n1..])?;
        let payload = b[20 + n1 + n2..].to_vec();
        Ok(ObjectMessage {
            nonce,
            expiration,
            object_type,
            object_version,
            stream,
            payload,
        })
    }
}

/// The typed sum of every message this node understands, plus an opaque
/// fallback for anything it doesn't.
#[derive(Clone, Debug, PartialEq)]
pub enum ProtocolMessage {
    Version(VersionMessage),
    Verack,
    Addr(AddrMessage),
    Inv(InvMessage),
    GetData(GetDataMessage),
    Object(ObjectMessage),
}

impl ProtocolMessage {
    pub fn command(&self) -> &'static str {
        match self {
            ProtocolMessage::Version(_) => "version",
            ProtocolMessage::Verack => "verack",
            ProtocolMessage::Addr(_) => "addr",
            ProtocolMessage::Inv(_) => "inv",
            ProtocolMessage::GetData(_) => "getdata",
            ProtocolMessage::Object(_) => "object",
        }
    }

    pub fn encode_payload(&self) -> Vec<u8> {
        match self {
            ProtocolMessage::Version(m) => m.encode_payload(),
            ProtocolMessage::Verack => Vec::new(),
            ProtocolMessage::Addr(m) => m.encode_payload(),
            ProtocolMessage::Inv(m) => m.encode_payload(),
            ProtocolMessage::GetData(m) => m.encode_payload(),
            ProtocolMessage::Object(m) => m.encode_payload(),
        }
    }

    pub fn decode(command: &str, payload: &[u8]) -> WireResult<Option<Self>> {
        Ok(Some(match command {
            "version" => ProtocolMessage::Version(VersionMessage::decode_payload(payload)?),
            "verack" => ProtocolMessage::Verack,
            "addr" => ProtocolMessage::Addr(AddrMessage::decode_payload(payload)?),
            "inv" => ProtocolMessage::Inv(InvMessage::decode_payload(payload)?),
            "getdata" => ProtocolMessage::GetData(GetDataMessage::decode_payload(payload)?),
            "object" => ProtocolMessage::Object(ObjectMessage::decode_payload(payload)?),
            _ => return Ok(None),
        }))
    }
}
