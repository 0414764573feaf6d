//! Proof-of-work admission control for stored objects.
//!
//! The hash composition follows `Shion-Kamoto-BTPC2`'s
//! `crypto::sha512::DoubleSha512` idiom: plain `sha2::Sha512::digest`
//! chained twice, nothing more exotic. Bitmessage's own POW mixes the trial
//! nonce in a third round rather than double-hashing the whole body, so the
//! composition here is adapted to that shape rather than copied verbatim.

use sha2::{Digest, Sha512};

/// Computes the POW value for a serialized object body. `body[0..8]` is the
/// trial nonce; `body[8..]` is the rest of the object (expiration, type,
/// version, stream, payload).
pub fn get_pow_value(body: &[u8]) -> u64 {
    let initial = Sha512::digest(&body[8..]);
    let mut first_input = Vec::with_capacity(8 + initial.len());
    first_input.extend_from_slice(&body[0..8]);
    first_input.extend_from_slice(&initial);
    let hash1 = Sha512::digest(&first_input);
    let hash2 = Sha512::digest(&hash1);
    u64::from_be_bytes(hash2[0..8].try_into().unwrap())
}

/// Finds and writes into `body[0..8]` the smallest nonce (scanned from 0
/// upward) for which `get_pow_value(body) <= target`, returning that nonce.
///
/// The Go original starts its trial counter at a literal that doesn't fit a
/// u64 (see `DESIGN.md`); here the search still covers the entire nonce
/// space `[0, u64::MAX]` by construction, so that resolution changes no
/// observable behavior.
pub fn do_pow(body: &mut [u8], target: u64) -> u64 {
    let mut nonce: u64 = 0;
    loop {
        body[0..8].copy_from_slice(&nonce.to_be_bytes());
        if get_pow_value(body) <= target {
            return nonce;
        }
        nonce = nonce.checked_add(1).expect("POW target satisfied before nonce space exhausted");
    }
}

/// `true` iff the object body's embedded nonce already satisfies `target`.
pub fn check_pow(body: &[u8], target: u64) -> bool {
    get_pow_value(body) <= target
}
