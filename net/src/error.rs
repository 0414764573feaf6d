use thiserror::Error;

pub type WireResult<T> = Result<T, WireError>;
pub type PeerResult<T> = Result<T, PeerError>;
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors raised by the varint codec and the message framing layer.
#[derive(Error, Debug)]
pub enum WireError {
    #[error("{field} exceeds its maximum length")]
    TooLong { field: &'static str },

    #[error("varint overflow (larger than 64 bits)")]
    VarIntOverflow,

    #[error("unexpected end of buffer")]
    UnexpectedEof,

    #[error("bad magic value: expected 0x{expected:08x}, got 0x{got:08x}")]
    BadMagic { expected: u32, got: u32 },

    #[error("checksum mismatch")]
    BadChecksum,

    #[error("bad message length: {got} exceeds max {max}")]
    BadLength { got: usize, max: usize },

    /// Reserved for dispatch over a closed set of known object types; unused
    /// on the wire-codec read path itself, where unknown commands become an
    /// opaque `RawMessage` rather than an error.
    #[error("unknown type: {0}")]
    UnknownType(u32),

    /// Required so `tokio_util::codec::Framed` can fold socket I/O errors
    /// into the same error type it threads through `Decoder`/`Encoder`.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Errors raised by the object store (`sled` backend).
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("store backend error: {0}")]
    Backend(#[from] sled::Error),
}

/// Errors raised while driving a peer connection (handshake + steady state).
#[derive(Error, Debug)]
pub enum PeerError {
    #[error(transparent)]
    Wire(#[from] WireError),

    #[error("protocol violation: {0}")]
    Violation(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("remote peer hung up")]
    RemoteClosed,
}

impl From<String> for PeerError {
    fn from(msg: String) -> Self {
        PeerError::Violation(msg)
    }
}

impl From<&str> for PeerError {
    fn from(msg: &str) -> Self {
        PeerError::Violation(msg.to_string())
    }
}
