//! Two unrelated integer encodings coexist on the wire.
//!
//! The *standard* unsigned varint (LEB128-style, 7-bit groups, continuation
//! in the MSB) is used only inside `version`, for the user-agent length
//! prefix and the stream-number list. Everything else (`addr`, `inv`,
//! `getdata`, `object` fields) uses the protocol's own *prefix-tagged*
//! varint, which looks nothing like LEB128.

use crate::error::{WireError, WireResult};

const MAX_VARINT_LEN_64: usize = 10;

/// Decodes a standard LEB128-style unsigned varint, returning the value and
/// the number of bytes consumed.
pub fn decode_uvarint(buf: &[u8]) -> WireResult<(u64, usize)> {
    let mut x: u64 = 0;
    let mut shift: u32 = 0;
    for i in 0..MAX_VARINT_LEN_64 + 1 {
        let b = *buf.get(i).ok_or(WireError::UnexpectedEof)?;
        if i == MAX_VARINT_LEN_64 {
            return Err(WireError::VarIntOverflow);
        }
        if b < 0x80 {
            if i == MAX_VARINT_LEN_64 - 1 && b > 1 {
                return Err(WireError::VarIntOverflow);
            }
            x |= (b as u64) << shift;
            return Ok((x, i + 1));
        }
        x |= ((b & 0x7f) as u64) << shift;
        shift += 7;
    }
    unreachable!()
}

/// Encodes a standard LEB128-style unsigned varint (minimal length).
pub fn encode_uvarint(value: u64) -> Vec<u8> {
    let mut buf = Vec::with_capacity(MAX_VARINT_LEN_64);
    let mut x = value;
    while x >= 0x80 {
        buf.push((x as u8) | 0x80);
        x >>= 7;
    }
    buf.push(x as u8);
    buf
}

/// Decodes a length-prefixed string: `uvarint(len) ++ bytes`. Rejects
/// user-agent strings longer than 5000 bytes.
pub fn decode_varstr(buf: &[u8]) -> WireResult<(String, usize)> {
    let (len, prefix_len) = decode_uvarint(buf)?;
    if len > 5000 {
        return Err(WireError::TooLong { field: "user_agent" });
    }
    let len = len as usize;
    let total = prefix_len + len;
    let bytes = buf.get(prefix_len..total).ok_or(WireError::UnexpectedEof)?;
    let s = String::from_utf8_lossy(bytes).into_owned();
    Ok((s, total))
}

/// Encodes a length-prefixed string.
pub fn encode_varstr(s: &str) -> Vec<u8> {
    let mut out = encode_uvarint(s.len() as u64);
    out.extend_from_slice(s.as_bytes());
    out
}

/// Decodes a list of standard varints: `uvarint(count) ++ uvarint(v1) ++
/// ...`. Rejects lists longer than 160,000 entries (used for
/// `version.stream_numbers`).
pub fn decode_uvarint_list(buf: &[u8]) -> WireResult<(Vec<u64>, usize)> {
    let (count, mut pos) = decode_uvarint(buf)?;
    if count > 160_000 {
        return Err(WireError::TooLong { field: "stream_numbers" });
    }
    let mut values = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let (v, n) = decode_uvarint(&buf[pos..])?;
        values.push(v);
        pos += n;
    }
    Ok((values, pos))
}

/// Encodes a list of standard varints.
pub fn encode_uvarint_list(values: &[u64]) -> Vec<u8> {
    let mut out = encode_uvarint(values.len() as u64);
    for v in values {
        out.extend_from_slice(&encode_uvarint(*v));
    }
    out
}

/// Decodes the protocol's prefix-tagged varint (`0x00..=0xfc` single byte,
/// `0xfd` + 2 BE bytes, `0xfe` + 4 BE bytes, `0xff` + 8 BE bytes). Any
/// in-range encoding is accepted on decode, even a non-canonical one.
pub fn decode_tagged(buf: &[u8]) -> WireResult<(u64, usize)> {
    let tag = *buf.first().ok_or(WireError::UnexpectedEof)?;
    match tag {
        0x00..=0xfc => Ok((tag as u64, 1)),
        0xfd => {
            let b = buf.get(1..3).ok_or(WireError::UnexpectedEof)?;
            Ok((u16::from_be_bytes(b.try_into().unwrap()) as u64, 3))
        }
        0xfe => {
            let b = buf.get(1..5).ok_or(WireError::UnexpectedEof)?;
            Ok((u32::from_be_bytes(b.try_into().unwrap()) as u64, 5))
        }
        0xff => {
            let b = buf.get(1..9).ok_or(WireError::UnexpectedEof)?;
            Ok((u64::from_be_bytes(b.try_into().unwrap()), 9))
        }
    }
}

/// Encodes a value using the smallest (canonical) tagged-varint form.
pub fn encode_tagged(value: u64) -> Vec<u8> {
    if value <= 0xfc {
        vec![value as u8]
    } else if value <= 0xffff {
        let mut out = vec![0xfd];
        out.extend_from_slice(&(value as u16).to_be_bytes());
        out
    } else if value <= 0xffff_ffff {
        let mut out = vec![0xfe];
        out.extend_from_slice(&(value as u32).to_be_bytes());
        out
    } else {
        let mut out = vec![0xff];
        out.extend_from_slice(&value.to_be_bytes());
        out
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(0x00, 1)]
    #[case(0xfc, 1)]
    #[case(0xfd, 3)]
    #[case(0xffff, 3)]
    #[case(0x10000, 5)]
    #[case(0xffff_ffff, 5)]
    #[case(0x1_0000_0000, 9)]
    #[case(u64::MAX, 9)]
    fn tagged_canonical_length(#[case] value: u64, #[case] expected_len: usize) {
        let encoded = encode_tagged(value);
        assert_eq!(encoded.len(), expected_len);
        let (decoded, consumed) = decode_tagged(&encoded).unwrap();
        assert_eq!(decoded, value);
        assert_eq!(consumed, expected_len);
    }

    #[test]
    fn tagged_leading_byte_matches_spec_table() {
        assert_eq!(encode_tagged(0xfd)[0], 0xfd);
        assert_eq!(encode_tagged(0x10000)[0], 0xfe);
        assert_eq!(encode_tagged(0x1_0000_0000)[0], 0xff);
    }

    #[test]
    fn tagged_accepts_non_canonical_decode() {
        // 0xfd followed by a value that would fit in the single-byte form.
        let buf = [0xfdu8, 0x00, 0x05];
        let (v, n) = decode_tagged(&buf).unwrap();
        assert_eq!(v, 5);
        assert_eq!(n, 3);
    }

    #[rstest]
    #[case(0)]
    #[case(1)]
    #[case(127)]
    #[case(128)]
    #[case(16384)]
    #[case(u32::MAX as u64)]
    #[case(u64::MAX)]
    fn uvarint_round_trip(#[case] value: u64) {
        let encoded = encode_uvarint(value);
        let (decoded, consumed) = decode_uvarint(&encoded).unwrap();
        assert_eq!(decoded, value);
        assert_eq!(consumed, encoded.len());
    }

    #[test]
    fn uvarint_eof_on_truncated_continuation() {
        let buf = [0x80u8];
        assert!(matches!(decode_uvarint(&buf), Err(WireError::UnexpectedEof)));
    }

    #[test]
    fn uvarint_overflow_past_ten_bytes() {
        let buf = [0xffu8; 11];
        assert!(matches!(decode_uvarint(&buf), Err(WireError::VarIntOverflow)));
    }

    #[test]
    fn varstr_round_trip() {
        let s = "/bitmessage:3.0/".to_string();
        let encoded = encode_varstr(&s);
        let (decoded, consumed) = decode_varstr(&encoded).unwrap();
        assert_eq!(decoded, s);
        assert_eq!(consumed, encoded.len());
    }

    #[test]
    fn varstr_rejects_too_long() {
        let s = "a".repeat(5001);
        let encoded = encode_varstr(&s);
        assert!(matches!(decode_varstr(&encoded), Err(WireError::TooLong { field: "user_agent" })));
    }

    #[test]
    fn intlist_round_trip() {
        let values = vec![1u64];
        let encoded = encode_uvarint_list(&values);
        let (decoded, consumed) = decode_uvarint_list(&encoded).unwrap();
        assert_eq!(decoded, values);
        assert_eq!(consumed, encoded.len());
    }

    #[test]
    fn intlist_rejects_too_long() {
        let values = vec![0u64; 160_001];
        let encoded = encode_uvarint_list(&values);
        assert!(matches!(decode_uvarint_list(&encoded), Err(WireError::TooLong { field: "stream_numbers" })));
    }
}
