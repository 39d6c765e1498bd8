//! Error types for the server core.
//!
//! The propagation policy is strict: data-plane problems (bad tags, replays,
//! policy misses) never become `Err` values above the worker loop - they
//! bump counters and the loop continues. Session-fatal errors reach the
//! session table exactly once. Only listener-level failures escape the
//! dispatcher and terminate the process.

use thiserror::Error;
use tungo_crypto::CryptoError;
use tungo_transport::TransportError;

/// Configuration problems; all fatal at startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A key field failed to decode or has the wrong length.
    #[error("invalid key for {context}: expected 32 base64-encoded bytes")]
    InvalidKey {
        /// Which field was malformed.
        context: String,
    },

    /// Two peer entries share a public key.
    #[error("duplicate peer public key (fingerprint {0})")]
    DuplicatePeer(String),

    /// Two peer entries share an internal address.
    #[error("duplicate internal address {0}")]
    DuplicateInternalAddr(std::net::IpAddr),

    /// A peer's internal address is outside its own allowed_ips.
    #[error("peer {fingerprint}: internal address {addr} not covered by allowed_ips")]
    InternalAddrNotAllowed {
        /// Peer fingerprint.
        fingerprint: String,
        /// The offending address.
        addr: std::net::IpAddr,
    },

    /// A peer has an empty allowed_ips set.
    #[error("peer {0}: allowed_ips must not be empty")]
    EmptyAllowedIps(String),

    /// Two enabled peers claim overlapping prefixes.
    #[error("allowed_ips overlap between peers {a} and {b}")]
    AllowedIpsOverlap {
        /// First peer fingerprint.
        a: String,
        /// Second peer fingerprint.
        b: String,
    },

    /// The transport name is not tcp, udp, or ws.
    #[error("unknown transport {0:?}")]
    UnknownTransport(String),

    /// No listener is enabled.
    #[error("no listeners configured")]
    NoListeners,

    /// The document failed to parse.
    #[error("config parse error: {0}")]
    Parse(String),
}

/// Why a handshake was rejected. Every reason maps to a counter; none of
/// them ever produces a response on the wire (except the cookie demand).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    /// Bad version, unknown type, or wrong length.
    Envelope,
    /// MAC1 mismatch.
    Mac1,
    /// Under load and no valid MAC2; a cookie reply was sent instead.
    CookieRequired,
    /// Noise processing failed (DH check or AEAD open).
    Noise,
    /// Initiator static key not in the peer table.
    UnknownPeer,
    /// Initiator static key present but disabled.
    Disabled,
    /// Session limit reached.
    SessionLimit,
}

/// Errors that terminate more than a single loop iteration.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Startup-time configuration failure (exit code 1).
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Crypto failure outside the data plane.
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// Transport failure outside the data plane.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// A listener could not be set up or died unrecoverably (exit code 2).
    #[error("listener failed on {addr}: {reason}")]
    Listener {
        /// The configured listen address.
        addr: std::net::SocketAddr,
        /// What went wrong.
        reason: String,
    },

    /// The TUN device failed; the server cannot run without it.
    #[error("tun device error: {0}")]
    Tun(std::io::Error),

    /// Clean shutdown requested.
    #[error("shutting down")]
    Shutdown,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_errors_render_actionably() {
        let err = ConfigError::InvalidKey {
            context: "server.private_key".into(),
        };
        assert!(err.to_string().contains("server.private_key"));

        let err = ConfigError::AllowedIpsOverlap {
            a: "aabbccdd00112233".into(),
            b: "ddccbbaa33221100".into(),
        };
        assert!(err.to_string().contains("overlap"));
    }
}
