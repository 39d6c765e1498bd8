//! Epoch rotation state machine.
//!
//! Either side may start a rekey; its triggers are epoch age, bytes sent,
//! or the send counter. The initiator sends a `RekeyInit` service frame
//! with a fresh X25519 public key, the peer answers `RekeyAck` with its
//! own, and both derive the next epoch's keys from the ephemeral DH and
//! the session chain key.
//!
//! Commit is asymmetric by design: each side installs its new *send* key
//! as soon as its half of the exchange completes, but keeps the old
//! *receive* key alongside the staged one until the first frame of the new
//! epoch authenticates (see `tungo_crypto::session::RecvState`). In-flight
//! old-epoch traffic therefore survives the switch for a bounded overlap.
//!
//! Simultaneous initiations tie-break on the static keys: the side with
//! the lexicographically smaller public key keeps the initiator role, the
//! other abandons its attempt and answers as responder.

use std::time::{Duration, Instant};

use x25519_dalek::{PublicKey, StaticSecret};

use tungo_crypto::CryptoError;
use tungo_crypto::noise::Role;
use tungo_crypto::session::derive_rekey_keys;

/// Rekey triggers and retry tuning.
#[derive(Debug, Clone)]
pub struct RekeyConfig {
    /// Rotate after this much time in one epoch.
    pub interval: Duration,
    /// Rotate after this many bytes sent in one epoch.
    pub byte_threshold: u64,
    /// Rotate after this many frames sent in one epoch.
    pub counter_threshold: u64,
    /// How long to wait for a `RekeyAck`.
    pub ack_timeout: Duration,
    /// Send attempts per rotation before declaring it failed.
    pub max_attempts: u32,
    /// Pause before retrying after a failed rotation.
    pub backoff: Duration,
}

impl Default for RekeyConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(120),
            byte_threshold: 1 << 30,
            counter_threshold: 1 << 60,
            ack_timeout: Duration::from_secs(3),
            max_attempts: 3,
            backoff: Duration::from_secs(10),
        }
    }
}

/// Keys for the next epoch, already assigned to this side's directions.
pub struct NewEpochKeys {
    /// The epoch these keys belong to.
    pub epoch: u32,
    /// New sending key.
    pub send_key: [u8; 32],
    /// New receiving key.
    pub recv_key: [u8; 32],
}

enum State {
    Stable { not_before: Option<Instant> },
    AwaitingAck {
        secret: StaticSecret,
        our_public: [u8; 32],
        deadline: Instant,
        attempts: u32,
    },
    Dead,
}

/// What the outbound worker should do after a tick.
#[derive(Debug, PartialEq, Eq)]
pub enum TickAction {
    /// Nothing due.
    None,
    /// Resend `RekeyInit` with this ephemeral public key.
    Resend([u8; 32]),
    /// This rotation failed; backed off, will retry later.
    Failed,
    /// Three consecutive rotations failed; tear the session down.
    Dead,
}

/// Per-session rekey state machine.
pub struct RekeyMachine {
    role: Role,
    local_public: [u8; 32],
    peer_public: [u8; 32],
    chain: [u8; 32],
    epoch: u32,
    epoch_started: Instant,
    state: State,
    config: RekeyConfig,
    consecutive_failures: u32,
}

impl RekeyMachine {
    /// Create for a fresh session at epoch 0.
    #[must_use]
    pub fn new(
        role: Role,
        local_public: [u8; 32],
        peer_public: [u8; 32],
        chain: [u8; 32],
        config: RekeyConfig,
    ) -> Self {
        Self {
            role,
            local_public,
            peer_public,
            chain,
            epoch: 0,
            epoch_started: Instant::now(),
            state: State::Stable { not_before: None },
            config,
            consecutive_failures: 0,
        }
    }

    /// Current agreed epoch.
    #[must_use]
    pub fn epoch(&self) -> u32 {
        self.epoch
    }

    /// Has the machine given up?
    #[must_use]
    pub fn is_dead(&self) -> bool {
        matches!(self.state, State::Dead)
    }

    /// Should this side start a rotation now?
    #[must_use]
    pub fn should_initiate(&self, counter: u64, bytes: u64) -> bool {
        let State::Stable { not_before } = &self.state else {
            return false;
        };
        if not_before.is_some_and(|t| Instant::now() < t) {
            return false;
        }
        self.epoch_started.elapsed() >= self.config.interval
            || bytes >= self.config.byte_threshold
            || counter >= self.config.counter_threshold
    }

    /// Start a rotation; returns the ephemeral public key for `RekeyInit`.
    ///
    /// # Errors
    ///
    /// Returns `EpochExhausted` when the epoch counter cannot advance; the
    /// machine is dead afterwards.
    pub fn initiate(&mut self) -> Result<[u8; 32], CryptoError> {
        if self.epoch == u32::MAX {
            self.state = State::Dead;
            return Err(CryptoError::EpochExhausted);
        }
        let secret = StaticSecret::random_from_rng(rand_core::OsRng);
        let our_public = PublicKey::from(&secret).to_bytes();
        self.state = State::AwaitingAck {
            secret,
            our_public,
            deadline: Instant::now() + self.config.ack_timeout,
            attempts: 1,
        };
        Ok(our_public)
    }

    /// Handle a peer's `RekeyInit`.
    ///
    /// Returns the new keys plus our ephemeral public key for the ack, or
    /// `None` when the frame is ignored (tie-break or dead machine).
    ///
    /// # Errors
    ///
    /// Returns `EpochExhausted` when the epoch counter cannot advance.
    pub fn on_init(
        &mut self,
        peer_ephemeral: &[u8; 32],
    ) -> Result<Option<(NewEpochKeys, [u8; 32])>, CryptoError> {
        match &self.state {
            State::Dead => return Ok(None),
            State::AwaitingAck { .. } => {
                // Simultaneous initiations: the smaller key keeps going.
                if self.local_public < self.peer_public {
                    return Ok(None);
                }
            }
            State::Stable { .. } => {}
        }
        if self.epoch == u32::MAX {
            self.state = State::Dead;
            return Err(CryptoError::EpochExhausted);
        }

        let secret = StaticSecret::random_from_rng(rand_core::OsRng);
        let our_public = PublicKey::from(&secret).to_bytes();
        let dh = secret.diffie_hellman(&PublicKey::from(*peer_ephemeral));
        let keys = self.commit(dh.as_bytes())?;
        Ok(Some((keys, our_public)))
    }

    /// Handle a peer's `RekeyAck`.
    ///
    /// Returns the new keys, or `None` for a stale ack.
    ///
    /// # Errors
    ///
    /// Returns `KeyDerivationFailed` if the KDF fails.
    pub fn on_ack(&mut self, peer_ephemeral: &[u8; 32]) -> Result<Option<NewEpochKeys>, CryptoError> {
        if !matches!(self.state, State::AwaitingAck { .. }) {
            return Ok(None);
        }
        let State::AwaitingAck { secret, .. } = std::mem::replace(
            &mut self.state,
            State::Stable { not_before: None },
        ) else {
            unreachable!("state checked above");
        };
        let dh = secret.diffie_hellman(&PublicKey::from(*peer_ephemeral));
        let keys = self.commit(dh.as_bytes())?;
        Ok(Some(keys))
    }

    /// Drive timeouts; call from the outbound worker's tick.
    pub fn on_tick(&mut self, now: Instant) -> TickAction {
        let State::AwaitingAck {
            our_public,
            deadline,
            attempts,
            ..
        } = &mut self.state
        else {
            return TickAction::None;
        };
        if now < *deadline {
            return TickAction::None;
        }
        if *attempts < self.config.max_attempts {
            *attempts += 1;
            *deadline = now + self.config.ack_timeout;
            return TickAction::Resend(*our_public);
        }

        self.consecutive_failures += 1;
        if self.consecutive_failures >= 3 {
            self.state = State::Dead;
            TickAction::Dead
        } else {
            self.state = State::Stable {
                not_before: Some(now + self.config.backoff),
            };
            TickAction::Failed
        }
    }

    fn commit(&mut self, dh: &[u8; 32]) -> Result<NewEpochKeys, CryptoError> {
        let new_epoch = self.epoch + 1;
        let rekeyed = derive_rekey_keys(&self.chain, dh, new_epoch)?;
        let (send_key, recv_key) = rekeyed.directed(self.role);
        self.chain = rekeyed.chain;
        self.epoch = new_epoch;
        self.epoch_started = Instant::now();
        self.state = State::Stable { not_before: None };
        self.consecutive_failures = 0;
        Ok(NewEpochKeys {
            epoch: new_epoch,
            send_key,
            recv_key,
        })
    }
}
