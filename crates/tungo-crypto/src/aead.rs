//! Data-plane AEAD engine.
//!
//! `ChaCha20-Poly1305` with 256-bit keys and the 96-bit nonce laid out as
//! `epoch(4, big-endian) || counter(8, big-endian)`. Associated data is empty.
//!
//! Both operations work in place on a caller-owned buffer shaped
//! `[nonce(12) | payload | tag(16)]`, so the hot path allocates nothing: the
//! session worker reads an IP packet into the payload region, seals it, and
//! hands the whole prefix to the transport.

use chacha20poly1305::aead::generic_array::GenericArray;
use chacha20poly1305::{AeadInPlace, ChaCha20Poly1305, KeyInit};

use crate::error::CryptoError;

/// Nonce length: 4-byte epoch || 8-byte counter.
pub const NONCE_LEN: usize = 12;

/// Poly1305 tag length.
pub const TAG_LEN: usize = 16;

/// Total per-frame AEAD overhead.
pub const OVERHEAD: usize = NONCE_LEN + TAG_LEN;

/// Send counters stop here, far below the 2^64 nonce limit.
pub const COUNTER_CEILING: u64 = 1 << 63;

/// Compose a wire nonce from epoch and counter.
#[must_use]
pub fn nonce_bytes(epoch: u32, counter: u64) -> [u8; NONCE_LEN] {
    let mut nonce = [0u8; NONCE_LEN];
    nonce[..4].copy_from_slice(&epoch.to_be_bytes());
    nonce[4..].copy_from_slice(&counter.to_be_bytes());
    nonce
}

/// Read the advertised epoch and counter off a received frame.
///
/// # Errors
///
/// Returns `Truncated` if the frame cannot even hold nonce and tag.
pub fn parse_nonce(frame: &[u8]) -> Result<(u32, u64), CryptoError> {
    if frame.len() < OVERHEAD {
        return Err(CryptoError::Truncated {
            expected: OVERHEAD,
            actual: frame.len(),
        });
    }
    let epoch = u32::from_be_bytes([frame[0], frame[1], frame[2], frame[3]]);
    let counter = u64::from_be_bytes([
        frame[4], frame[5], frame[6], frame[7], frame[8], frame[9], frame[10], frame[11],
    ]);
    Ok((epoch, counter))
}

/// One direction's cipher for one epoch.
pub struct PacketCipher {
    cipher: ChaCha20Poly1305,
}

impl PacketCipher {
    /// Wrap a 256-bit key.
    #[must_use]
    pub fn new(key: &[u8; 32]) -> Self {
        Self {
            cipher: ChaCha20Poly1305::new(key.into()),
        }
    }

    /// Encrypt in place.
    ///
    /// `buf[NONCE_LEN..NONCE_LEN + payload_len]` holds the plaintext on
    /// entry. On success the nonce prefix and tag suffix are written and the
    /// whole frame occupies `buf[..NONCE_LEN + payload_len + TAG_LEN]`; that
    /// total length is returned.
    ///
    /// # Errors
    ///
    /// Returns `BufferTooSmall` or `EncryptionFailed`.
    pub fn seal_in_place(
        &self,
        epoch: u32,
        counter: u64,
        buf: &mut [u8],
        payload_len: usize,
    ) -> Result<usize, CryptoError> {
        let total = NONCE_LEN + payload_len + TAG_LEN;
        if buf.len() < total {
            return Err(CryptoError::BufferTooSmall {
                need: total,
                have: buf.len(),
            });
        }
        let nonce = nonce_bytes(epoch, counter);
        buf[..NONCE_LEN].copy_from_slice(&nonce);

        let (_, rest) = buf.split_at_mut(NONCE_LEN);
        let (payload, tail) = rest.split_at_mut(payload_len);
        let tag = self
            .cipher
            .encrypt_in_place_detached(GenericArray::from_slice(&nonce), b"", payload)
            .map_err(|_| CryptoError::EncryptionFailed)?;
        tail[..TAG_LEN].copy_from_slice(&tag);
        Ok(total)
    }

    /// Decrypt in place.
    ///
    /// Returns the advertised epoch and counter and the plaintext slice
    /// inside `frame`. The caller is responsible for replay policy; this
    /// only authenticates.
    ///
    /// # Errors
    ///
    /// Returns `Truncated` or `DecryptionFailed`.
    pub fn open_in_place<'a>(
        &self,
        frame: &'a mut [u8],
    ) -> Result<(u32, u64, &'a mut [u8]), CryptoError> {
        let (epoch, counter) = parse_nonce(frame)?;
        let (nonce, rest) = frame.split_at_mut(NONCE_LEN);
        let ct_len = rest.len() - TAG_LEN;
        let (ciphertext, tag) = rest.split_at_mut(ct_len);
        self.cipher
            .decrypt_in_place_detached(
                GenericArray::from_slice(nonce),
                b"",
                ciphertext,
                GenericArray::from_slice(tag),
            )
            .map_err(|_| CryptoError::DecryptionFailed)?;
        Ok((epoch, counter, ciphertext))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: [u8; 32] = [0x42; 32];

    fn frame_with(payload: &[u8]) -> (Vec<u8>, usize) {
        let cipher = PacketCipher::new(&KEY);
        let mut buf = vec![0u8; NONCE_LEN + payload.len() + TAG_LEN];
        buf[NONCE_LEN..NONCE_LEN + payload.len()].copy_from_slice(payload);
        let len = cipher.seal_in_place(3, 77, &mut buf, payload.len()).unwrap();
        (buf, len)
    }

    #[test]
    fn seal_open_roundtrip() {
        let payload = b"ip packet bytes";
        let (mut frame, len) = frame_with(payload);
        assert_eq!(len, frame.len());

        let cipher = PacketCipher::new(&KEY);
        let (epoch, counter, plain) = cipher.open_in_place(&mut frame).unwrap();
        assert_eq!(epoch, 3);
        assert_eq!(counter, 77);
        assert_eq!(plain, payload);
    }

    #[test]
    fn nonce_layout_is_big_endian() {
        let nonce = nonce_bytes(0x0102_0304, 0x0506_0708_090A_0B0C);
        assert_eq!(
            nonce,
            [0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, 0x09, 0x0A, 0x0B, 0x0C]
        );
        let mut frame = nonce.to_vec();
        frame.extend_from_slice(&[0u8; TAG_LEN]);
        assert_eq!(
            parse_nonce(&frame).unwrap(),
            (0x0102_0304, 0x0506_0708_090A_0B0C)
        );
    }

    #[test]
    fn tampered_tag_fails() {
        let (mut frame, _) = frame_with(b"payload");
        let last = frame.len() - 1;
        frame[last] ^= 0x01;
        let cipher = PacketCipher::new(&KEY);
        assert_eq!(
            cipher.open_in_place(&mut frame).unwrap_err(),
            CryptoError::DecryptionFailed
        );
    }

    #[test]
    fn tampered_nonce_fails() {
        let (mut frame, _) = frame_with(b"payload");
        frame[5] ^= 0x01;
        let cipher = PacketCipher::new(&KEY);
        assert!(cipher.open_in_place(&mut frame).is_err());
    }

    #[test]
    fn wrong_key_fails() {
        let (mut frame, _) = frame_with(b"payload");
        let other = PacketCipher::new(&[0x43; 32]);
        assert!(other.open_in_place(&mut frame).is_err());
    }

    #[test]
    fn short_frame_is_truncated() {
        let cipher = PacketCipher::new(&KEY);
        let mut tiny = [0u8; OVERHEAD - 1];
        assert!(matches!(
            cipher.open_in_place(&mut tiny),
            Err(CryptoError::Truncated { .. })
        ));
    }

    #[test]
    fn undersized_buffer_rejected() {
        let cipher = PacketCipher::new(&KEY);
        let mut buf = [0u8; NONCE_LEN + 4];
        assert!(matches!(
            cipher.seal_in_place(0, 0, &mut buf, 4),
            Err(CryptoError::BufferTooSmall { .. })
        ));
    }

    #[test]
    fn empty_payload_roundtrip() {
        let (mut frame, len) = frame_with(b"");
        assert_eq!(len, OVERHEAD);
        let cipher = PacketCipher::new(&KEY);
        let (_, _, plain) = cipher.open_in_place(&mut frame).unwrap();
        assert!(plain.is_empty());
    }
}
