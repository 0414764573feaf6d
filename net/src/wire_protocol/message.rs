use sha2::{Digest, Sha512};

/// Magic value marking the start of a message envelope.
pub const MAGIC: u32 = 0xE9BE_B4D9;

/// Maximum payload size, the framing header excluded.
pub const MAX_PAYLOAD_LEN: usize = 1_600_003;

/// Fixed header size: 4-byte magic, 12-byte command, 4-byte length, 4-byte checksum.
pub const HEADER_LEN: usize = 4 + 12 + 4 + 4;

/// Commands this node decodes into a typed `ProtocolMessage`. Anything else
/// arrives as an opaque `RawMessage` — an unrecognized command is not a
/// protocol error.
pub const KNOWN_COMMANDS: &[&str] = &["version", "verack", "addr", "inv", "getdata", "object"];

/// First 4 bytes of SHA-512(payload).
pub fn checksum(payload: &[u8]) -> [u8; 4] {
    let digest = Sha512::digest(payload);
    let mut out = [0u8; 4];
    out.copy_from_slice(&digest[..4]);
    out
}

/// NUL-pads (or truncates, which the caller must never rely on) a command
/// name into the 12-byte header field.
pub fn encode_command(command: &str) -> Option<[u8; 12]> {
    let bytes = command.as_bytes();
    if bytes.len() > 12 {
        return None;
    }
    let mut out = [0u8; 12];
    out[..bytes.len()].copy_from_slice(bytes);
    Some(out)
}

/// Parses a 12-byte command field as ASCII up to the first NUL byte (or all
/// 12 bytes if there's no NUL).
pub fn decode_command(field: &[u8; 12]) -> String {
    let end = field.iter().position(|&b| b == 0).unwrap_or(12);
    String::from_utf8_lossy(&field[..end]).into_owned()
}

/// A message whose command isn't one this node decodes into a typed
/// variant. The upper layer is free to ignore it.
#[derive(Clone, Debug, PartialEq)]
pub struct RawMessage {
    pub command_type: String,
    pub payload: Vec<u8>,
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn command_round_trips_short_name() {
        let encoded = encode_command("inv").unwrap();
        assert_eq!(decode_command(&encoded), "inv");
    }

    #[test]
    fn command_rejects_over_12_bytes() {
        assert!(encode_command("thisistoolongforsure").is_none());
    }

    #[test]
    fn command_without_nul_uses_full_width() {
        let field = *b"123456789012";
        assert_eq!(decode_command(&field), "123456789012");
    }

    #[test]
    fn checksum_is_first_four_sha512_bytes() {
        let payload = b"hello world";
        let full = Sha512::digest(payload);
        assert_eq!(checksum(payload), full[..4]);
    }
}
