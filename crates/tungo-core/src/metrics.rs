//! Runtime counters.
//!
//! The data plane never logs per-packet events; it bumps these counters and
//! moves on. The dispatcher logs a snapshot on shutdown and whenever asked.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::RejectReason;

macro_rules! counters {
    ($($(#[$doc:meta])* $name:ident),+ $(,)?) => {
        /// Process-wide atomic counters.
        #[derive(Default)]
        pub struct Counters {
            $($(#[$doc])* pub $name: AtomicU64,)+
        }

        /// Point-in-time copy of every counter.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
        pub struct Snapshot {
            $($(#[$doc])* pub $name: u64,)+
        }

        impl Counters {
            /// Copy all counters at once.
            #[must_use]
            pub fn snapshot(&self) -> Snapshot {
                Snapshot {
                    $($name: self.$name.load(Ordering::Relaxed),)+
                }
            }
        }

        impl std::fmt::Display for Snapshot {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                $(write!(f, concat!(stringify!($name), "={} "), self.$name)?;)+
                Ok(())
            }
        }
    };
}

counters! {
    /// Completed handshakes.
    handshake_ok,
    /// Rejections: malformed envelope.
    handshake_rejected_envelope,
    /// Rejections: MAC1 mismatch.
    handshake_rejected_mac1,
    /// Cookie demanded under load (a cookie reply was sent).
    handshake_rejected_cookie,
    /// Rejections: Noise processing failed.
    handshake_rejected_noise,
    /// Rejections: unknown initiator static key.
    handshake_rejected_unknown,
    /// Rejections: peer present but disabled.
    handshake_rejected_disabled,
    /// Rejections: session limit reached.
    handshake_rejected_limit,
    /// Inbound frames that failed authentication.
    auth_fail,
    /// Inbound frames dropped by the replay window.
    replay_drop,
    /// Inbound packets whose inner source violated AllowedIPs.
    policy_drop,
    /// Inbound plaintext that parsed as neither service frame nor IP packet.
    malformed_drop,
    /// TUN packets with no session for their destination, and UDP datagrams
    /// from unknown sources.
    no_session_drop,
    /// Outbound packets dropped because a session's queue was full.
    backpressure_drop,
    /// Frames diverted because their inner destination sits in the
    /// documentation ranges.
    service_diverted,
    /// Completed epoch rotations.
    rekey_ok,
    /// Failed or aborted epoch rotations.
    rekey_fail,
    /// Live sessions (gauge).
    sessions_active,
}

impl Counters {
    /// Bump one counter.
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Decrement a gauge.
    pub fn dec(counter: &AtomicU64) {
        counter.fetch_sub(1, Ordering::Relaxed);
    }

    /// Record a handshake rejection by reason.
    pub fn reject(&self, reason: RejectReason) {
        let counter = match reason {
            RejectReason::Envelope => &self.handshake_rejected_envelope,
            RejectReason::Mac1 => &self.handshake_rejected_mac1,
            RejectReason::CookieRequired => &self.handshake_rejected_cookie,
            RejectReason::Noise => &self.handshake_rejected_noise,
            RejectReason::UnknownPeer => &self.handshake_rejected_unknown,
            RejectReason::Disabled => &self.handshake_rejected_disabled,
            RejectReason::SessionLimit => &self.handshake_rejected_limit,
        };
        Self::bump(counter);
    }
}
