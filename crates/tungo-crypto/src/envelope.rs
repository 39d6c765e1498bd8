//! Handshake wire envelope.
//!
//! Every handshake message is wrapped in a fixed envelope outside the Noise
//! byte stream: a version byte, a type byte, the Noise message, a 16-byte
//! MAC1, and (for `init` only) a 16-byte MAC2 slot. All layouts are fixed
//! size, so a single length check validates the whole frame:
//!
//! ```text
//! init:         01 01 | noise[96] | mac1[16] | mac2[16]        = 130 bytes
//! response:     01 02 | noise[48] | mac1[16]                   =  66 bytes
//! cookie-reply: 01 03 | nonce[24] | sealed cookie[32]          =  58 bytes
//! ```
//!
//! MAC1 is a keyed BLAKE3 MAC (truncated to 16 bytes) over all preceding
//! bytes of the message, keyed by `BLAKE3("mac1--" || responder static
//! public key)`. A responder MUST verify MAC1 before allocating per-message
//! state, running any DH, or parsing anything past the type byte; the
//! functions here are laid out so that discipline is the natural call order.

use subtle::ConstantTimeEq;

use crate::error::CryptoError;

/// Protocol version carried in the first envelope byte.
pub const ENVELOPE_VERSION: u8 = 0x01;

/// Length of the MAC1/MAC2 trailers.
pub const MAC_LEN: usize = 16;

/// Noise_IK message 1: e(32) || enc(s)(32+16) || enc(empty)(16).
pub const INIT_NOISE_LEN: usize = 96;

/// Noise_IK message 2: e(32) || enc(empty)(16).
pub const RESP_NOISE_LEN: usize = 48;

/// Cookie reply body: XChaCha nonce(24) || ciphertext(16) || tag(16).
pub const COOKIE_REPLY_BODY_LEN: usize = 56;

/// Total wire length of an `init` envelope.
pub const INIT_LEN: usize = 2 + INIT_NOISE_LEN + 2 * MAC_LEN;

/// Total wire length of a `response` envelope.
pub const RESP_LEN: usize = 2 + RESP_NOISE_LEN + MAC_LEN;

/// Total wire length of a `cookie-reply` envelope.
pub const COOKIE_REPLY_LEN: usize = 2 + COOKIE_REPLY_BODY_LEN;

const MAC1_LABEL: &[u8] = b"mac1--";

/// Handshake message types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MsgType {
    /// Noise_IK initiator message.
    Init = 0x01,
    /// Noise_IK responder message.
    Response = 0x02,
    /// Encrypted cookie for MAC2 retry.
    CookieReply = 0x03,
}

impl TryFrom<u8> for MsgType {
    type Error = CryptoError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(Self::Init),
            0x02 => Ok(Self::Response),
            0x03 => Ok(Self::CookieReply),
            other => Err(CryptoError::UnknownMessageType(other)),
        }
    }
}

impl MsgType {
    /// Fixed total envelope length for this message type.
    #[must_use]
    pub fn wire_len(self) -> usize {
        match self {
            Self::Init => INIT_LEN,
            Self::Response => RESP_LEN,
            Self::CookieReply => COOKIE_REPLY_LEN,
        }
    }
}

/// A parsed (but not yet authenticated) envelope view.
#[derive(Debug)]
pub enum Envelope<'a> {
    /// Initiator handshake message.
    Init {
        /// The 96-byte Noise message.
        noise: &'a [u8],
        /// MAC2 trailer (all zero when no cookie is in force).
        mac2: [u8; MAC_LEN],
    },
    /// Responder handshake message.
    Response {
        /// The 48-byte Noise message.
        noise: &'a [u8],
    },
    /// Encrypted cookie.
    CookieReply {
        /// nonce || sealed cookie.
        body: &'a [u8],
    },
}

/// Check only the version and type bytes, without touching the rest.
///
/// This is the one parse step permitted before MAC1 verification. The total
/// length is validated here too since it is a pure function of the type.
///
/// # Errors
///
/// Returns `Truncated`, `UnsupportedVersion`, or `UnknownMessageType`.
pub fn peek_type(data: &[u8]) -> Result<MsgType, CryptoError> {
    if data.len() < 2 {
        return Err(CryptoError::Truncated {
            expected: 2,
            actual: data.len(),
        });
    }
    if data[0] != ENVELOPE_VERSION {
        return Err(CryptoError::UnsupportedVersion(data[0]));
    }
    let ty = MsgType::try_from(data[1])?;
    if data.len() != ty.wire_len() {
        return Err(CryptoError::Truncated {
            expected: ty.wire_len(),
            actual: data.len(),
        });
    }
    Ok(ty)
}

/// Derive the MAC1 key for a given responder static public key.
#[must_use]
pub fn mac1_key(responder_public: &[u8; 32]) -> [u8; 32] {
    let mut hasher = blake3::Hasher::new();
    hasher.update(MAC1_LABEL);
    hasher.update(responder_public);
    *hasher.finalize().as_bytes()
}

/// Keyed 16-byte MAC over a message region.
#[must_use]
pub fn keyed_mac(key: &[u8; 32], data: &[u8]) -> [u8; MAC_LEN] {
    let full = blake3::keyed_hash(key, data);
    let mut out = [0u8; MAC_LEN];
    out.copy_from_slice(&full.as_bytes()[..MAC_LEN]);
    out
}

fn mac1_region(ty: MsgType) -> usize {
    // MAC1 covers everything before its own offset.
    match ty {
        MsgType::Init => 2 + INIT_NOISE_LEN,
        MsgType::Response => 2 + RESP_NOISE_LEN,
        MsgType::CookieReply => unreachable!("cookie replies carry no MAC1"),
    }
}

/// Verify MAC1 on an `init` or `response` envelope, constant time.
///
/// `data` must already have passed [`peek_type`]. Cookie replies carry no
/// MAC1 and always fail here.
#[must_use]
pub fn verify_mac1(ty: MsgType, data: &[u8], key: &[u8; 32]) -> bool {
    if ty == MsgType::CookieReply {
        return false;
    }
    let covered = mac1_region(ty);
    let expected = keyed_mac(key, &data[..covered]);
    expected
        .ct_eq(&data[covered..covered + MAC_LEN])
        .unwrap_u8()
        == 1
}

/// Parse an envelope whose type and length were validated by [`peek_type`].
#[must_use]
pub fn parse(ty: MsgType, data: &[u8]) -> Envelope<'_> {
    match ty {
        MsgType::Init => {
            let mut mac2 = [0u8; MAC_LEN];
            mac2.copy_from_slice(&data[INIT_LEN - MAC_LEN..]);
            Envelope::Init {
                noise: &data[2..2 + INIT_NOISE_LEN],
                mac2,
            }
        }
        MsgType::Response => Envelope::Response {
            noise: &data[2..2 + RESP_NOISE_LEN],
        },
        MsgType::CookieReply => Envelope::CookieReply { body: &data[2..] },
    }
}

/// Build an `init` envelope around a Noise message.
///
/// MAC2 is filled from the cookie when one is in force, zero otherwise.
///
/// # Panics
///
/// Panics if `noise` is not exactly [`INIT_NOISE_LEN`] bytes; the Noise_IK
/// pattern fixes that length.
#[must_use]
pub fn seal_init(noise: &[u8], mac1_key: &[u8; 32], cookie: Option<&[u8; 16]>) -> Vec<u8> {
    assert_eq!(noise.len(), INIT_NOISE_LEN);
    let mut msg = Vec::with_capacity(INIT_LEN);
    msg.push(ENVELOPE_VERSION);
    msg.push(MsgType::Init as u8);
    msg.extend_from_slice(noise);
    let mac1 = keyed_mac(mac1_key, &msg);
    msg.extend_from_slice(&mac1);
    match cookie {
        Some(cookie) => {
            let key = mac2_key(cookie);
            let mac2 = keyed_mac(&key, &msg);
            msg.extend_from_slice(&mac2);
        }
        None => msg.extend_from_slice(&[0u8; MAC_LEN]),
    }
    msg
}

/// Build a `response` envelope around a Noise message.
///
/// # Panics
///
/// Panics if `noise` is not exactly [`RESP_NOISE_LEN`] bytes.
#[must_use]
pub fn seal_response(noise: &[u8], mac1_key: &[u8; 32]) -> Vec<u8> {
    assert_eq!(noise.len(), RESP_NOISE_LEN);
    let mut msg = Vec::with_capacity(RESP_LEN);
    msg.push(ENVELOPE_VERSION);
    msg.push(MsgType::Response as u8);
    msg.extend_from_slice(noise);
    let mac1 = keyed_mac(mac1_key, &msg);
    msg.extend_from_slice(&mac1);
    msg
}

/// Build a `cookie-reply` envelope around an already-sealed body.
///
/// # Panics
///
/// Panics if `body` is not exactly [`COOKIE_REPLY_BODY_LEN`] bytes.
#[must_use]
pub fn seal_cookie_reply(body: &[u8]) -> Vec<u8> {
    assert_eq!(body.len(), COOKIE_REPLY_BODY_LEN);
    let mut msg = Vec::with_capacity(COOKIE_REPLY_LEN);
    msg.push(ENVELOPE_VERSION);
    msg.push(MsgType::CookieReply as u8);
    msg.extend_from_slice(body);
    msg
}

/// Expand a 16-byte cookie into a 32-byte MAC2 key.
///
/// BLAKE3 keyed mode wants exactly 32 key bytes; both ends expand the same
/// way so the choice is invisible on the wire.
#[must_use]
pub fn mac2_key(cookie: &[u8; 16]) -> [u8; 32] {
    let mut hasher = blake3::Hasher::new();
    hasher.update(b"mac2--");
    hasher.update(cookie);
    *hasher.finalize().as_bytes()
}

/// The region of an `init` envelope covered by MAC2.
#[must_use]
pub fn mac2_region(data: &[u8]) -> &[u8] {
    &data[..INIT_LEN - MAC_LEN]
}

/// Extract the MAC1 trailer of an `init` or `response` envelope.
///
/// # Panics
///
/// Panics for cookie replies, which carry no MAC1.
#[must_use]
pub fn mac1_bytes(ty: MsgType, data: &[u8]) -> [u8; MAC_LEN] {
    let offset = mac1_region(ty);
    let mut mac1 = [0u8; MAC_LEN];
    mac1.copy_from_slice(&data[offset..offset + MAC_LEN]);
    mac1
}

/// Extract the initiator's ephemeral public key from a verified `init`.
///
/// Only valid after MAC1 has been checked; the ephemeral is the first field
/// of the Noise message.
#[must_use]
pub fn init_ephemeral(data: &[u8]) -> [u8; 32] {
    let mut eph = [0u8; 32];
    eph.copy_from_slice(&data[2..34]);
    eph
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mac_key() -> [u8; 32] {
        mac1_key(&[7u8; 32])
    }

    #[test]
    fn init_roundtrip() {
        let noise = [0xAB; INIT_NOISE_LEN];
        let msg = seal_init(&noise, &mac_key(), None);
        assert_eq!(msg.len(), INIT_LEN);

        let ty = peek_type(&msg).unwrap();
        assert_eq!(ty, MsgType::Init);
        assert!(verify_mac1(ty, &msg, &mac_key()));

        match parse(ty, &msg) {
            Envelope::Init { noise: n, mac2 } => {
                assert_eq!(n, &noise[..]);
                assert_eq!(mac2, [0u8; MAC_LEN]);
            }
            other => panic!("unexpected envelope: {other:?}"),
        }
    }

    #[test]
    fn response_roundtrip() {
        let noise = [0xCD; RESP_NOISE_LEN];
        let msg = seal_response(&noise, &mac_key());
        let ty = peek_type(&msg).unwrap();
        assert_eq!(ty, MsgType::Response);
        assert!(verify_mac1(ty, &msg, &mac_key()));
    }

    #[test]
    fn mac1_rejects_tamper() {
        let mut msg = seal_init(&[0u8; INIT_NOISE_LEN], &mac_key(), None);
        msg[10] ^= 0x01;
        let ty = peek_type(&msg).unwrap();
        assert!(!verify_mac1(ty, &msg, &mac_key()));
    }

    #[test]
    fn mac1_rejects_wrong_key() {
        let msg = seal_init(&[0u8; INIT_NOISE_LEN], &mac_key(), None);
        let ty = peek_type(&msg).unwrap();
        let other = mac1_key(&[8u8; 32]);
        assert!(!verify_mac1(ty, &msg, &other));
    }

    #[test]
    fn peek_rejects_bad_version() {
        let mut msg = seal_init(&[0u8; INIT_NOISE_LEN], &mac_key(), None);
        msg[0] = 0x02;
        assert_eq!(peek_type(&msg), Err(CryptoError::UnsupportedVersion(0x02)));
    }

    #[test]
    fn peek_rejects_bad_length() {
        let msg = seal_init(&[0u8; INIT_NOISE_LEN], &mac_key(), None);
        assert!(matches!(
            peek_type(&msg[..msg.len() - 1]),
            Err(CryptoError::Truncated { .. })
        ));
    }

    #[test]
    fn peek_rejects_unknown_type() {
        let msg = vec![ENVELOPE_VERSION, 0x09];
        assert_eq!(peek_type(&msg), Err(CryptoError::UnknownMessageType(0x09)));
    }

    #[test]
    fn cookie_fills_mac2() {
        let cookie = [9u8; 16];
        let msg = seal_init(&[0u8; INIT_NOISE_LEN], &mac_key(), Some(&cookie));
        let ty = peek_type(&msg).unwrap();
        let Envelope::Init { mac2, .. } = parse(ty, &msg) else {
            panic!("not init");
        };
        let expected = keyed_mac(&mac2_key(&cookie), mac2_region(&msg));
        assert_eq!(mac2, expected);
    }

    #[test]
    fn ephemeral_extraction() {
        let mut noise = [0u8; INIT_NOISE_LEN];
        noise[..32].copy_from_slice(&[0x42; 32]);
        let msg = seal_init(&noise, &mac_key(), None);
        assert_eq!(init_ephemeral(&msg), [0x42; 32]);
    }
}
