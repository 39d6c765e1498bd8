//! Error types for the crypto layer.

use thiserror::Error;

/// Errors raised by the cryptographic session layer.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CryptoError {
    /// Handshake failed (snow error, bad DH, AEAD open failure).
    #[error("handshake failed: {0}")]
    HandshakeFailed(String),

    /// Envelope carries an unsupported protocol version.
    #[error("unsupported protocol version: {0:#04x}")]
    UnsupportedVersion(u8),

    /// Envelope carries an unknown message type.
    #[error("unknown handshake message type: {0:#04x}")]
    UnknownMessageType(u8),

    /// Message shorter than its fixed wire layout requires.
    #[error("truncated message: expected {expected} bytes, got {actual}")]
    Truncated {
        /// Bytes required by the wire layout.
        expected: usize,
        /// Bytes actually received.
        actual: usize,
    },

    /// MAC1 or MAC2 verification failed.
    #[error("message authenticator mismatch")]
    MacMismatch,

    /// AEAD encryption failed.
    #[error("AEAD encryption failed")]
    EncryptionFailed,

    /// AEAD decryption failed (bad tag or corrupted ciphertext).
    #[error("AEAD decryption failed")]
    DecryptionFailed,

    /// Inbound counter already accepted or below the window.
    #[error("replay detected")]
    ReplayDetected,

    /// Received frame under an epoch we hold no key for.
    #[error("no key for epoch {0}")]
    UnknownEpoch(u32),

    /// Send counter reached its ceiling; the epoch must rotate.
    #[error("send counter exhausted for current epoch")]
    CounterExhausted,

    /// Epoch counter itself can no longer advance; the session must die.
    #[error("epoch space exhausted")]
    EpochExhausted,

    /// Key derivation failed.
    #[error("key derivation failed")]
    KeyDerivationFailed,

    /// Caller-supplied buffer too small for the requested operation.
    #[error("buffer too small: need {need} bytes, have {have}")]
    BufferTooSmall {
        /// Bytes the operation requires.
        need: usize,
        /// Bytes available in the buffer.
        have: usize,
    },

    /// OS CSPRNG failure.
    #[error("system randomness unavailable")]
    RandomFailed,
}
