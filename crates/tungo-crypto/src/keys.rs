//! X25519 static identities.
//!
//! A peer's identity is its long-term X25519 key pair; nothing else. The
//! private half is zeroized on drop by the underlying `StaticSecret`.

use sha2::{Digest, Sha256};
use x25519_dalek::{PublicKey, StaticSecret};

/// X25519 key length in bytes.
pub const KEY_LEN: usize = 32;

/// A static X25519 key pair used as a long-term identity.
#[derive(Clone)]
pub struct StaticKeypair {
    secret: StaticSecret,
    public: PublicKey,
}

impl std::fmt::Debug for StaticKeypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StaticKeypair")
            .field("public", &self.public)
            .field("secret", &"<redacted>")
            .finish()
    }
}

impl StaticKeypair {
    /// Generate a fresh random key pair.
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(rand_core::OsRng);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    /// Reconstruct a key pair from a stored private key.
    pub fn from_private(private: [u8; KEY_LEN]) -> Self {
        let secret = StaticSecret::from(private);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    /// The public key bytes.
    #[must_use]
    pub fn public_bytes(&self) -> [u8; KEY_LEN] {
        self.public.to_bytes()
    }

    /// The private key bytes.
    ///
    /// # Security
    ///
    /// Handle with care - this is the long-term identity key.
    #[must_use]
    pub fn private_bytes(&self) -> [u8; KEY_LEN] {
        self.secret.to_bytes()
    }

    /// X25519 with a remote public key.
    #[must_use]
    pub fn dh(&self, remote_public: &[u8; KEY_LEN]) -> [u8; 32] {
        let remote = PublicKey::from(*remote_public);
        *self.secret.diffie_hellman(&remote).as_bytes()
    }
}

/// Short peer identifier for logs: first 8 bytes of SHA-256 of the public
/// key, hex-encoded. Never log the key itself.
#[must_use]
pub fn fingerprint(public: &[u8; KEY_LEN]) -> String {
    let digest = Sha256::digest(public);
    hex::encode(&digest[..8])
}
