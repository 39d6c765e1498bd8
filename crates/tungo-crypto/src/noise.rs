//! Noise_IK handshake.
//!
//! ```text
//! Noise_IK(s, rs):
//!   <- s                    # Responder's static key known to Initiator
//!   ...
//!   -> e, es, s, ss         # msg1: ephemeral + encrypted static
//!   <- e, ee, se            # msg2: ephemeral, completes DH
//! ```
//!
//! Two messages, mutual static-key authentication, the initiator's identity
//! hidden from passive observers. The responder deterministically generates a
//! fresh ephemeral for every `init` it answers, so replaying a captured msg1
//! yields a response the replayer cannot use: the derived keys differ.
//!
//! Session keys come from snow's raw HKDF split of the final chaining key -
//! not from a KDF over the handshake hash, which is transcript-public. The
//! chain key kept for rekeying is bound to both split keys and therefore
//! secret.

use hkdf::Hkdf;
use sha2::{Digest, Sha256};
use snow::{Builder, HandshakeState};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::CryptoError;
use crate::keys::StaticKeypair;

/// Noise protocol pattern used by TunGo.
pub const NOISE_PATTERN: &str = "Noise_IK_25519_ChaChaPoly_SHA256";

const CHAIN_LABEL: &[u8] = b"tungo v1 chain";

/// Role in the handshake; also fixes key directions for the session's life.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    /// Sent msg1 (the client).
    Initiator,
    /// Answered msg1 (the server).
    Responder,
}

/// Everything a completed handshake yields.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct HandshakeOutcome {
    /// SHA-256 of the final handshake transcript hash; names the session.
    pub session_id: [u8; 32],
    /// AEAD key for our sending direction.
    pub send_key: [u8; 32],
    /// AEAD key for our receiving direction.
    pub recv_key: [u8; 32],
    /// Secret chain key mixed into every rekey derivation.
    pub chain_key: [u8; 32],
}

fn build<'a>() -> Result<Builder<'a>, CryptoError> {
    NOISE_PATTERN
        .parse()
        .map(Builder::new)
        .map_err(|_| CryptoError::HandshakeFailed("pattern parse failed".to_string()))
}

fn split(mut state: HandshakeState, role: Role) -> Result<HandshakeOutcome, CryptoError> {
    let hash = state.get_handshake_hash();
    let session_id: [u8; 32] = Sha256::digest(hash).into();

    let (k_i2r, k_r2i) = state.dangerously_get_raw_split();

    let mut ikm = [0u8; 64];
    ikm[..32].copy_from_slice(&k_i2r);
    ikm[32..].copy_from_slice(&k_r2i);
    let hk = Hkdf::<Sha256>::new(None, &ikm);
    let mut chain_key = [0u8; 32];
    hk.expand(CHAIN_LABEL, &mut chain_key)
        .map_err(|_| CryptoError::KeyDerivationFailed)?;
    ikm.zeroize();

    let (send_key, recv_key) = match role {
        Role::Initiator => (k_i2r, k_r2i),
        Role::Responder => (k_r2i, k_i2r),
    };

    Ok(HandshakeOutcome {
        session_id,
        send_key,
        recv_key,
        chain_key,
    })
}

/// Initiator (client) side of the handshake.
pub struct IkInitiator {
    state: HandshakeState,
}

impl IkInitiator {
    /// Create an initiator aimed at a known responder static key.
    ///
    /// # Errors
    ///
    /// Returns `HandshakeFailed` if snow rejects the keys.
    pub fn new(local: &StaticKeypair, responder_public: &[u8; 32]) -> Result<Self, CryptoError> {
        let private = local.private_bytes();
        let state = build()?
            .local_private_key(&private)
            .map_err(|e| CryptoError::HandshakeFailed(e.to_string()))?
            .remote_public_key(responder_public)
            .map_err(|e| CryptoError::HandshakeFailed(e.to_string()))?
            .build_initiator()
            .map_err(|e| CryptoError::HandshakeFailed(e.to_string()))?;
        Ok(Self { state })
    }

    /// Produce the msg1 Noise bytes (`e, es, s, ss`, empty payload).
    ///
    /// # Errors
    ///
    /// Returns `HandshakeFailed` on a snow state error.
    pub fn write_init(&mut self) -> Result<Vec<u8>, CryptoError> {
        let mut buf = vec![0u8; 256];
        let len = self
            .state
            .write_message(&[], &mut buf)
            .map_err(|e| CryptoError::HandshakeFailed(e.to_string()))?;
        buf.truncate(len);
        Ok(buf)
    }

    /// Consume the responder's msg2 and derive the session keys.
    ///
    /// # Errors
    ///
    /// Returns `HandshakeFailed` if the message fails to authenticate.
    pub fn read_response(mut self, noise_msg: &[u8]) -> Result<HandshakeOutcome, CryptoError> {
        let mut payload = vec![0u8; 256];
        self.state
            .read_message(noise_msg, &mut payload)
            .map_err(|e| CryptoError::HandshakeFailed(e.to_string()))?;
        split(self.state, Role::Initiator)
    }
}

/// Responder (server) side of the handshake.
pub struct IkResponder {
    state: HandshakeState,
}

impl IkResponder {
    /// Create a responder around the server's static key.
    ///
    /// # Errors
    ///
    /// Returns `HandshakeFailed` if snow rejects the key.
    pub fn new(local: &StaticKeypair) -> Result<Self, CryptoError> {
        let private = local.private_bytes();
        let state = build()?
            .local_private_key(&private)
            .map_err(|e| CryptoError::HandshakeFailed(e.to_string()))?
            .build_responder()
            .map_err(|e| CryptoError::HandshakeFailed(e.to_string()))?;
        Ok(Self { state })
    }

    /// Consume msg1 and return the initiator's static public key.
    ///
    /// Costs two DH operations. The caller looks the key up in the peer
    /// policy before answering; unknown peers get silence, not a response.
    ///
    /// # Errors
    ///
    /// Returns `HandshakeFailed` if decryption of the static key fails.
    pub fn read_init(&mut self, noise_msg: &[u8]) -> Result<[u8; 32], CryptoError> {
        let mut payload = vec![0u8; 256];
        self.state
            .read_message(noise_msg, &mut payload)
            .map_err(|e| CryptoError::HandshakeFailed(e.to_string()))?;

        let remote = self
            .state
            .get_remote_static()
            .ok_or_else(|| CryptoError::HandshakeFailed("no remote static key".into()))?;
        let mut public = [0u8; 32];
        public.copy_from_slice(remote);
        Ok(public)
    }

    /// Produce msg2 (`e, ee, se`) and derive the session keys.
    ///
    /// # Errors
    ///
    /// Returns `HandshakeFailed` on a snow state error.
    pub fn write_response(mut self) -> Result<(Vec<u8>, HandshakeOutcome), CryptoError> {
        let mut buf = vec![0u8; 256];
        let len = self
            .state
            .write_message(&[], &mut buf)
            .map_err(|e| CryptoError::HandshakeFailed(e.to_string()))?;
        buf.truncate(len);
        let outcome = split(self.state, Role::Responder)?;
        Ok((buf, outcome))
    }
}
