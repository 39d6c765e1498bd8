//! Per-direction transport crypto with epoch rotation.
//!
//! A session's two pipelines each own exactly one half of this module:
//! the outbound task owns a [`SendState`], the inbound task owns a
//! [`RecvState`]. Nothing here is shared, so no locking is needed on the
//! data path.
//!
//! During a rekey the receive side briefly holds up to three epoch keys:
//! the current one, a pending next-epoch key installed when the rekey
//! control frames are exchanged, and the retained previous-epoch key that
//! absorbs in-flight traffic for a short overlap after the switch. The
//! epoch field of each frame's nonce routes it to the right key; there is
//! no trial decryption.

use std::time::{Duration, Instant};

use hkdf::Hkdf;
use sha2::Sha256;
use zeroize::Zeroize;

use crate::aead::{COUNTER_CEILING, PacketCipher};
use crate::error::CryptoError;
use crate::noise::Role;
use crate::replay::ReplayWindow;

/// How long the previous epoch's receive key survives after the first
/// authenticated frame of the new epoch.
pub const OLD_KEY_RETENTION: Duration = Duration::from_secs(1);

const REKEY_LABEL: &[u8] = b"tungo v1 rekey";

/// Sending half: one key, one epoch, a strictly monotonic counter.
pub struct SendState {
    cipher: PacketCipher,
    epoch: u32,
    counter: u64,
    bytes: u64,
}

impl SendState {
    /// Start at epoch 0 with the handshake-derived key.
    #[must_use]
    pub fn new(key: &[u8; 32]) -> Self {
        Self {
            cipher: PacketCipher::new(key),
            epoch: 0,
            counter: 0,
            bytes: 0,
        }
    }

    /// Seal the next outbound frame in place; see
    /// [`PacketCipher::seal_in_place`] for the buffer contract.
    ///
    /// # Errors
    ///
    /// Returns `CounterExhausted` once the per-epoch counter ceiling is
    /// reached; the caller must block sends until a rekey commits.
    pub fn seal_next(&mut self, buf: &mut [u8], payload_len: usize) -> Result<usize, CryptoError> {
        if self.counter >= COUNTER_CEILING {
            return Err(CryptoError::CounterExhausted);
        }
        let len = self
            .cipher
            .seal_in_place(self.epoch, self.counter, buf, payload_len)?;
        self.counter += 1;
        self.bytes += len as u64;
        Ok(len)
    }

    /// Swap in the new epoch's key; counters restart at zero.
    pub fn install(&mut self, key: &[u8; 32], epoch: u32) {
        self.cipher = PacketCipher::new(key);
        self.epoch = epoch;
        self.counter = 0;
        self.bytes = 0;
    }

    /// Current send epoch.
    #[must_use]
    pub fn epoch(&self) -> u32 {
        self.epoch
    }

    /// Frames sent this epoch.
    #[must_use]
    pub fn counter(&self) -> u64 {
        self.counter
    }

    /// Bytes sealed this epoch; feeds the rekey byte-threshold trigger.
    #[must_use]
    pub fn bytes(&self) -> u64 {
        self.bytes
    }
}

struct EpochKey {
    epoch: u32,
    cipher: PacketCipher,
    replay: ReplayWindow,
}

impl EpochKey {
    fn new(key: &[u8; 32], epoch: u32, width: usize) -> Self {
        Self {
            epoch,
            cipher: PacketCipher::new(key),
            replay: ReplayWindow::new(width),
        }
    }
}

/// A successfully opened inbound frame.
#[derive(Debug)]
pub struct OpenResult<'a> {
    /// Decrypted payload, in place inside the received frame.
    pub plaintext: &'a mut [u8],
    /// Epoch the frame was sealed under.
    pub epoch: u32,
    /// Counter the frame was sealed under.
    pub counter: u64,
    /// True exactly once per rekey: this frame was the first to
    /// authenticate under the pending epoch, which is now current.
    pub committed: bool,
}

/// Receiving half: current epoch key plus the rekey-overlap keys.
pub struct RecvState {
    width: usize,
    current: EpochKey,
    pending: Option<EpochKey>,
    previous: Option<(EpochKey, Instant)>,
}

enum Slot {
    Current,
    Pending,
    Previous,
}

impl RecvState {
    /// Start at epoch 0 with the handshake-derived key and the window
    /// width appropriate for the transport.
    #[must_use]
    pub fn new(key: &[u8; 32], width: usize) -> Self {
        Self {
            width,
            current: EpochKey::new(key, 0, width),
            pending: None,
            previous: None,
        }
    }

    /// Current receive epoch.
    #[must_use]
    pub fn current_epoch(&self) -> u32 {
        self.current.epoch
    }

    /// Stage the next epoch's key. Frames under it will authenticate
    /// immediately; the switch commits on the first success.
    pub fn install_pending(&mut self, key: &[u8; 32], epoch: u32) {
        self.pending = Some(EpochKey::new(key, epoch, self.width));
    }

    /// Drop a staged key after a rekey abort.
    pub fn cancel_pending(&mut self) {
        self.pending = None;
    }

    /// Decrypt an inbound frame in place, routing by the nonce's epoch and
    /// enforcing replay policy.
    ///
    /// # Errors
    ///
    /// `UnknownEpoch` if no held key matches, `ReplayDetected` for
    /// duplicate or too-old counters, `DecryptionFailed` for bad tags.
    pub fn open<'a>(&mut self, frame: &'a mut [u8]) -> Result<OpenResult<'a>, CryptoError> {
        let (epoch, counter) = crate::aead::parse_nonce(frame)?;

        if let Some((_, retired_at)) = &self.previous {
            if retired_at.elapsed() >= OLD_KEY_RETENTION {
                self.previous = None;
            }
        }

        let slot = if epoch == self.current.epoch {
            Slot::Current
        } else if self.pending.as_ref().is_some_and(|p| p.epoch == epoch) {
            Slot::Pending
        } else if self.previous.as_ref().is_some_and(|(p, _)| p.epoch == epoch) {
            Slot::Previous
        } else {
            return Err(CryptoError::UnknownEpoch(epoch));
        };

        let key = match slot {
            Slot::Current => &mut self.current,
            Slot::Pending => self.pending.as_mut().expect("slot routed"),
            Slot::Previous => &mut self.previous.as_mut().expect("slot routed").0,
        };

        // Replay check precedes the tag check; the window only commits
        // after authentication so forged counters cannot poison it.
        if key.replay.is_replay(counter) {
            return Err(CryptoError::ReplayDetected);
        }
        let (_, _, plaintext) = key.cipher.open_in_place(frame)?;
        key.replay.check_and_update(counter)?;

        let committed = matches!(slot, Slot::Pending);
        if committed {
            let fresh = self.pending.take().expect("slot routed");
            let retired = std::mem::replace(&mut self.current, fresh);
            self.previous = Some((retired, Instant::now()));
        }

        Ok(OpenResult {
            plaintext,
            epoch,
            counter,
            committed,
        })
    }
}

/// Key material for one epoch rotation.
pub struct RekeyedKeys {
    /// Initiator-to-responder key (handshake roles, not rekey roles).
    pub k_i2r: [u8; 32],
    /// Responder-to-initiator key.
    pub k_r2i: [u8; 32],
    /// Next chain key.
    pub chain: [u8; 32],
}

impl RekeyedKeys {
    /// Send/receive assignment for one side's handshake role.
    #[must_use]
    pub fn directed(&self, role: Role) -> ([u8; 32], [u8; 32]) {
        match role {
            Role::Initiator => (self.k_i2r, self.k_r2i),
            Role::Responder => (self.k_r2i, self.k_i2r),
        }
    }
}

impl Drop for RekeyedKeys {
    fn drop(&mut self) {
        self.k_i2r.zeroize();
        self.k_r2i.zeroize();
        self.chain.zeroize();
    }
}

/// Derive the next epoch's keys.
///
/// HKDF-SHA256 with the session chain key as salt and the fresh ephemeral
/// DH result as input keying material; the epoch number is bound through
/// the info string. An attacker needs both the ephemeral exchange and the
/// chain key (rooted in the handshake's split keys) to follow a rotation.
///
/// # Errors
///
/// Returns `KeyDerivationFailed` if HKDF expansion fails.
pub fn derive_rekey_keys(
    chain: &[u8; 32],
    ephemeral_dh: &[u8; 32],
    new_epoch: u32,
) -> Result<RekeyedKeys, CryptoError> {
    let hk = Hkdf::<Sha256>::new(Some(&chain[..]), ephemeral_dh);
    let mut info = Vec::with_capacity(REKEY_LABEL.len() + 4);
    info.extend_from_slice(REKEY_LABEL);
    info.extend_from_slice(&new_epoch.to_be_bytes());

    let mut okm = [0u8; 96];
    hk.expand(&info, &mut okm)
        .map_err(|_| CryptoError::KeyDerivationFailed)?;

    let mut k_i2r = [0u8; 32];
    let mut k_r2i = [0u8; 32];
    let mut next_chain = [0u8; 32];
    k_i2r.copy_from_slice(&okm[..32]);
    k_r2i.copy_from_slice(&okm[32..64]);
    next_chain.copy_from_slice(&okm[64..]);
    okm.zeroize();

    Ok(RekeyedKeys {
        k_i2r,
        k_r2i,
        chain: next_chain,
    })
}
