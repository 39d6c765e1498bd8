//! Stateless cookies for handshake-flood protection.
//!
//! When the responder is under load it refuses to do DH work for an `init`
//! until the initiator proves it can receive traffic at its claimed source
//! address. The proof is a cookie: a short MAC over the source IP, a coarse
//! time bucket, and the initiator's ephemeral key, keyed by a secret that
//! only the responder knows. The cookie travels back inside an encrypted
//! `cookie-reply`; the initiator echoes it as MAC2 on its retry.
//!
//! The secret rotates every two minutes. The previous secret stays valid for
//! one extra interval so a cookie minted just before rotation still verifies.

use std::net::IpAddr;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{XChaCha20Poly1305, XNonce};
use subtle::ConstantTimeEq;

use crate::envelope::MAC_LEN;
use crate::error::CryptoError;
use crate::random::{random_24, random_32};

/// Cookie length on the wire.
pub const COOKIE_LEN: usize = 16;

/// Cookie secret rotation interval.
pub const ROTATE_INTERVAL: Duration = Duration::from_secs(120);

/// Cookies are only honoured this long after minting.
pub const COOKIE_LIFETIME: Duration = Duration::from_secs(120);

const COOKIE_LABEL: &[u8] = b"cookie--";

/// Seconds per time bucket; cookies bind to the bucket they were minted in.
const BUCKET_SECS: u64 = 120;

fn current_bucket() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() / BUCKET_SECS)
        .unwrap_or(0)
}

fn ip_octets(ip: IpAddr) -> Vec<u8> {
    match ip {
        IpAddr::V4(v4) => v4.octets().to_vec(),
        IpAddr::V6(v6) => v6.octets().to_vec(),
    }
}

fn cookie_mac(secret: &[u8; 32], ip: IpAddr, bucket: u64, ephemeral: &[u8; 32]) -> [u8; COOKIE_LEN] {
    let mut hasher = blake3::Hasher::new_keyed(secret);
    hasher.update(&ip_octets(ip));
    hasher.update(&bucket.to_be_bytes());
    hasher.update(ephemeral);
    let full = hasher.finalize();
    let mut out = [0u8; COOKIE_LEN];
    out.copy_from_slice(&full.as_bytes()[..COOKIE_LEN]);
    out
}

/// Responder-side rotating cookie secrets.
pub struct CookieSecrets {
    current: [u8; 32],
    previous: Option<[u8; 32]>,
    rotated_at: Instant,
}

impl CookieSecrets {
    /// Create with a fresh random secret.
    ///
    /// # Errors
    ///
    /// Returns `RandomFailed` if the OS CSPRNG is unavailable.
    pub fn new() -> Result<Self, CryptoError> {
        Ok(Self {
            current: random_32()?,
            previous: None,
            rotated_at: Instant::now(),
        })
    }

    /// Rotate if the interval has elapsed. Called from the control tick.
    pub fn maybe_rotate(&mut self) -> Result<(), CryptoError> {
        if self.rotated_at.elapsed() >= ROTATE_INTERVAL {
            self.previous = Some(self.current);
            self.current = random_32()?;
            self.rotated_at = Instant::now();
        }
        Ok(())
    }

    /// Mint a cookie for a source address and initiator ephemeral.
    #[must_use]
    pub fn mint(&self, src_ip: IpAddr, ephemeral: &[u8; 32]) -> [u8; COOKIE_LEN] {
        cookie_mac(&self.current, src_ip, current_bucket(), ephemeral)
    }

    /// Verify an `init`'s MAC2 against every cookie this responder would
    /// currently honour: both secrets, current and previous time bucket.
    #[must_use]
    pub fn verify_mac2(
        &self,
        covered: &[u8],
        mac2: &[u8; MAC_LEN],
        src_ip: IpAddr,
        ephemeral: &[u8; 32],
    ) -> bool {
        let bucket = current_bucket();
        let mut secrets = vec![self.current];
        if let Some(prev) = self.previous {
            secrets.push(prev);
        }
        for secret in &secrets {
            for b in [bucket, bucket.saturating_sub(1)] {
                let cookie = cookie_mac(secret, src_ip, b, ephemeral);
                let key = crate::envelope::mac2_key(&cookie);
                let expected = crate::envelope::keyed_mac(&key, covered);
                if expected.ct_eq(mac2).unwrap_u8() == 1 {
                    return true;
                }
            }
        }
        false
    }
}

/// Derive the symmetric key that seals a cookie reply.
///
/// The responder cannot know the initiator's static key before any DH has
/// run, so the KDF anchors on the responder's own public key (which the
/// initiator knows by configuration) and mixes in the received MAC1 to bind
/// the reply to the exact `init` it answers.
#[must_use]
pub fn reply_key(responder_public: &[u8; 32], mac1: &[u8; MAC_LEN]) -> [u8; 32] {
    let mut hasher = blake3::Hasher::new();
    hasher.update(COOKIE_LABEL);
    hasher.update(responder_public);
    let anchor = *hasher.finalize().as_bytes();
    *blake3::Hasher::new_keyed(&anchor)
        .update(mac1)
        .finalize()
        .as_bytes()
}

/// Seal a cookie into the 56-byte `cookie-reply` body.
///
/// # Errors
///
/// Returns `RandomFailed` or `EncryptionFailed`.
pub fn seal_reply(key: &[u8; 32], cookie: &[u8; COOKIE_LEN]) -> Result<Vec<u8>, CryptoError> {
    let nonce = random_24()?;
    let cipher = XChaCha20Poly1305::new(key.into());
    let sealed = cipher
        .encrypt(XNonce::from_slice(&nonce), cookie.as_slice())
        .map_err(|_| CryptoError::EncryptionFailed)?;
    let mut body = Vec::with_capacity(24 + sealed.len());
    body.extend_from_slice(&nonce);
    body.extend_from_slice(&sealed);
    Ok(body)
}

/// Open a `cookie-reply` body.
///
/// # Errors
///
/// Returns `Truncated` or `DecryptionFailed`.
pub fn open_reply(key: &[u8; 32], body: &[u8]) -> Result<[u8; COOKIE_LEN], CryptoError> {
    if body.len() != 24 + COOKIE_LEN + 16 {
        return Err(CryptoError::Truncated {
            expected: 24 + COOKIE_LEN + 16,
            actual: body.len(),
        });
    }
    let (nonce, sealed) = body.split_at(24);
    let cipher = XChaCha20Poly1305::new(key.into());
    let plain = cipher
        .decrypt(XNonce::from_slice(nonce), sealed)
        .map_err(|_| CryptoError::DecryptionFailed)?;
    let mut cookie = [0u8; COOKIE_LEN];
    cookie.copy_from_slice(&plain);
    Ok(cookie)
}

/// Initiator-side storage for the most recent cookie.
#[derive(Default)]
pub struct CookieJar {
    stored: Option<([u8; COOKIE_LEN], Instant)>,
}

impl CookieJar {
    /// Empty jar.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a freshly decrypted cookie.
    pub fn store(&mut self, cookie: [u8; COOKIE_LEN]) {
        self.stored = Some((cookie, Instant::now()));
    }

    /// The stored cookie, if still within its lifetime.
    #[must_use]
    pub fn cookie(&self) -> Option<&[u8; COOKIE_LEN]> {
        match &self.stored {
            Some((cookie, at)) if at.elapsed() < COOKIE_LIFETIME => Some(cookie),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::{self, INIT_NOISE_LEN, MsgType};

    #[test]
    fn mint_is_deterministic_within_bucket() {
        let secrets = CookieSecrets::new().unwrap();
        let ip: IpAddr = "192.0.2.7".parse().unwrap();
        let eph = [5u8; 32];
        assert_eq!(secrets.mint(ip, &eph), secrets.mint(ip, &eph));
    }

    #[test]
    fn mint_binds_source_ip() {
        let secrets = CookieSecrets::new().unwrap();
        let eph = [5u8; 32];
        let a = secrets.mint("192.0.2.7".parse().unwrap(), &eph);
        let b = secrets.mint("192.0.2.8".parse().unwrap(), &eph);
        assert_ne!(a, b);
    }

    #[test]
    fn mac2_roundtrip() {
        let secrets = CookieSecrets::new().unwrap();
        let ip: IpAddr = "198.51.100.1".parse().unwrap();
        let mac1_key = envelope::mac1_key(&[1u8; 32]);

        let mut noise = [0u8; INIT_NOISE_LEN];
        noise[..32].copy_from_slice(&[3u8; 32]);
        let eph = [3u8; 32];

        let cookie = secrets.mint(ip, &eph);
        let msg = envelope::seal_init(&noise, &mac1_key, Some(&cookie));
        let ty = envelope::peek_type(&msg).unwrap();
        assert_eq!(ty, MsgType::Init);
        let envelope::Envelope::Init { mac2, .. } = envelope::parse(ty, &msg) else {
            panic!("not init");
        };

        assert!(secrets.verify_mac2(envelope::mac2_region(&msg), &mac2, ip, &eph));
        // Wrong source address must not verify.
        assert!(!secrets.verify_mac2(
            envelope::mac2_region(&msg),
            &mac2,
            "198.51.100.2".parse().unwrap(),
            &eph
        ));
    }

    #[test]
    fn mac2_survives_one_rotation() {
        let mut secrets = CookieSecrets::new().unwrap();
        let ip: IpAddr = "203.0.113.9".parse().unwrap();
        let eph = [9u8; 32];
        let cookie = secrets.mint(ip, &eph);

        let covered = [0xAA; 64];
        let key = envelope::mac2_key(&cookie);
        let mac2 = envelope::keyed_mac(&key, &covered);

        // Force a rotation; the previous secret must still honour the cookie.
        secrets.previous = Some(secrets.current);
        secrets.current = random_32().unwrap();
        assert!(secrets.verify_mac2(&covered, &mac2, ip, &eph));

        // After a second rotation the cookie dies.
        secrets.previous = Some(secrets.current);
        secrets.current = random_32().unwrap();
        assert!(!secrets.verify_mac2(&covered, &mac2, ip, &eph));
    }

    #[test]
    fn reply_seal_open() {
        let key = reply_key(&[1u8; 32], &[2u8; MAC_LEN]);
        let cookie = [7u8; COOKIE_LEN];
        let body = seal_reply(&key, &cookie).unwrap();
        assert_eq!(body.len(), crate::envelope::COOKIE_REPLY_BODY_LEN);
        assert_eq!(open_reply(&key, &body).unwrap(), cookie);
    }

    #[test]
    fn reply_rejects_wrong_key() {
        let key = reply_key(&[1u8; 32], &[2u8; MAC_LEN]);
        let wrong = reply_key(&[1u8; 32], &[3u8; MAC_LEN]);
        let body = seal_reply(&key, &[7u8; COOKIE_LEN]).unwrap();
        assert_eq!(
            open_reply(&wrong, &body),
            Err(CryptoError::DecryptionFailed)
        );
    }

    #[test]
    fn jar_expiry_is_checked() {
        let mut jar = CookieJar::new();
        assert!(jar.cookie().is_none());
        jar.store([1u8; COOKIE_LEN]);
        assert!(jar.cookie().is_some());
    }
}
