//! Cryptographic session layer for TunGo.
//!
//! This crate implements the security core of the protocol:
//! - `Noise_IK_25519_ChaChaPoly_SHA256` handshake (two messages, mutual
//!   static-key authentication) via the snow library
//! - MAC1 gating and the stateless cookie/MAC2 mechanism that deflects
//!   handshake floods before any allocation or DH work
//! - Data-plane `ChaCha20-Poly1305` with an epoch || counter nonce, in-place
//!   encryption into caller-owned buffers
//! - Sliding-window replay protection
//! - The epoch key schedule used by rekeying
//!
//! Everything here is transport-agnostic and synchronous; the async plumbing
//! lives in `tungo-core` and `tungo-transport`.

pub mod aead;
pub mod cookie;
pub mod envelope;
pub mod error;
pub mod keys;
pub mod noise;
pub mod random;
pub mod replay;
pub mod session;

pub use aead::{NONCE_LEN, PacketCipher, TAG_LEN};
pub use cookie::{COOKIE_LEN, CookieJar, CookieSecrets};
pub use envelope::{Envelope, MsgType};
pub use error::CryptoError;
pub use keys::{KEY_LEN, StaticKeypair, fingerprint};
pub use noise::{HandshakeOutcome, IkInitiator, IkResponder, Role};
pub use replay::{ReplayWindow, WINDOW_STREAM, WINDOW_UDP};
pub use session::{OpenResult, RecvState, SendState};
