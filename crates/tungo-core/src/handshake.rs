//! Handshake drivers.
//!
//! The responder driver walks the §-ordered gate sequence for every `init`:
//! version and type, MAC1, load gate (MAC2 or cookie reply), Noise, peer
//! policy, admission. Everything before the Noise step is allocation-free;
//! everything that fails is silence on the wire - unknown peers, bad MACs,
//! and failed DH all look identical to a prober.
//!
//! The responder holds no per-handshake state between datagrams: the Noise
//! state is created and consumed within one `handle_init` call, which also
//! makes UDP retries (after a cookie reply) trivially stateless.

use std::net::SocketAddr;
use std::sync::Mutex;

use tracing::debug;

use tungo_crypto::cookie::{self, CookieJar, CookieSecrets};
use tungo_crypto::envelope::{self, Envelope, MsgType};
use tungo_crypto::noise::{HandshakeOutcome, IkInitiator, IkResponder};
use tungo_crypto::{CryptoError, StaticKeypair};

use crate::dos::{LoadConfig, LoadMonitor};
use crate::error::RejectReason;
use crate::peers::{PeerPolicy, PeerRecord};

/// What a completed responder handshake hands to session installation.
pub struct NewSessionKeys {
    /// The authenticated initiator's static key.
    pub peer_public: [u8; 32],
    /// Session id, directional keys, and chain key.
    pub outcome: HandshakeOutcome,
    /// The matched peer record (cloned out of the policy snapshot).
    pub record: PeerRecord,
}

/// Result of processing one `init` message.
pub enum InitOutcome {
    /// Handshake complete: send `response` and install the session.
    Established {
        /// The `response` envelope to send back.
        response: Vec<u8>,
        /// Keys and identity for the new session.
        keys: NewSessionKeys,
    },
    /// Under load: send this cookie reply and forget the exchange.
    CookieReply(Vec<u8>),
    /// Silent drop; the reason feeds a counter, nothing goes on the wire.
    Rejected(RejectReason),
}

/// Server-side handshake state shared by all listeners.
pub struct HandshakeResponder {
    keypair: StaticKeypair,
    public: [u8; 32],
    mac1_key: [u8; 32],
    cookies: Mutex<CookieSecrets>,
    load: LoadMonitor,
}

impl HandshakeResponder {
    /// Create around the server identity.
    ///
    /// # Errors
    ///
    /// Fails only if the OS CSPRNG is unavailable.
    pub fn new(keypair: StaticKeypair, load: LoadConfig) -> Result<Self, CryptoError> {
        let public = keypair.public_bytes();
        Ok(Self {
            keypair,
            public,
            mac1_key: envelope::mac1_key(&public),
            cookies: Mutex::new(CookieSecrets::new()?),
            load: LoadMonitor::new(load),
        })
    }

    /// The server's static public key.
    #[must_use]
    pub fn public(&self) -> [u8; 32] {
        self.public
    }

    /// Control-tick maintenance: rotate the cookie secret, expire idle
    /// per-IP load entries.
    pub fn tick(&self) {
        if let Ok(mut cookies) = self.cookies.lock() {
            let _ = cookies.maybe_rotate();
        }
        self.load.sweep();
    }

    /// Process one `init` message.
    #[must_use]
    pub fn handle_init(
        &self,
        data: &[u8],
        src: SocketAddr,
        policy: &PeerPolicy,
        at_capacity: bool,
    ) -> InitOutcome {
        let Ok(ty) = envelope::peek_type(data) else {
            return InitOutcome::Rejected(RejectReason::Envelope);
        };
        if ty != MsgType::Init {
            return InitOutcome::Rejected(RejectReason::Envelope);
        }
        if !envelope::verify_mac1(ty, data, &self.mac1_key) {
            return InitOutcome::Rejected(RejectReason::Mac1);
        }

        // The ephemeral may be read now that MAC1 holds.
        let initiator_ephemeral = envelope::init_ephemeral(data);

        if self.load.observe_init(src.ip()) {
            let Envelope::Init { mac2, .. } = envelope::parse(ty, data) else {
                return InitOutcome::Rejected(RejectReason::Envelope);
            };
            let cookies = self.cookies.lock().expect("cookie lock poisoned");
            let mac2_ok = mac2 != [0u8; envelope::MAC_LEN]
                && cookies.verify_mac2(
                    envelope::mac2_region(data),
                    &mac2,
                    src.ip(),
                    &initiator_ephemeral,
                );
            if !mac2_ok {
                let cookie = cookies.mint(src.ip(), &initiator_ephemeral);
                drop(cookies);
                let mac1 = envelope::mac1_bytes(ty, data);
                let key = cookie::reply_key(&self.public, &mac1);
                return match cookie::seal_reply(&key, &cookie) {
                    Ok(body) => InitOutcome::CookieReply(envelope::seal_cookie_reply(&body)),
                    Err(_) => InitOutcome::Rejected(RejectReason::CookieRequired),
                };
            }
        }

        let Envelope::Init { noise, .. } = envelope::parse(ty, data) else {
            return InitOutcome::Rejected(RejectReason::Envelope);
        };
        let Ok(mut responder) = IkResponder::new(&self.keypair) else {
            return InitOutcome::Rejected(RejectReason::Noise);
        };
        let Ok(peer_public) = responder.read_init(noise) else {
            return InitOutcome::Rejected(RejectReason::Noise);
        };

        let Some(record) = policy.lookup_key(&peer_public) else {
            // At most two DH operations were spent on this stranger.
            return if policy.lookup_key_any(&peer_public).is_some() {
                InitOutcome::Rejected(RejectReason::Disabled)
            } else {
                InitOutcome::Rejected(RejectReason::UnknownPeer)
            };
        };
        if at_capacity {
            return InitOutcome::Rejected(RejectReason::SessionLimit);
        }

        let Ok((noise_resp, outcome)) = responder.write_response() else {
            return InitOutcome::Rejected(RejectReason::Noise);
        };
        debug!(peer = %record.fingerprint(), %src, "handshake complete");
        InitOutcome::Established {
            response: envelope::seal_response(&noise_resp, &self.mac1_key),
            keys: NewSessionKeys {
                peer_public,
                outcome,
                record: record.clone(),
            },
        }
    }
}

/// What the initiator does with a reply.
pub enum ReplyOutcome {
    /// Handshake complete.
    Established(HandshakeOutcome),
    /// Got a cookie; resend this retry `init` and keep waiting.
    Retry(Vec<u8>),
}

/// Client-side handshake driver with cookie retry.
pub struct HandshakeInitiator {
    keypair: StaticKeypair,
    server_public: [u8; 32],
    mac1_key: [u8; 32],
    jar: CookieJar,
    state: Option<IkInitiator>,
    noise_msg: Vec<u8>,
    last_mac1: [u8; 16],
}

impl HandshakeInitiator {
    /// Create aimed at a known server key.
    #[must_use]
    pub fn new(keypair: StaticKeypair, server_public: [u8; 32]) -> Self {
        Self {
            keypair,
            mac1_key: envelope::mac1_key(&server_public),
            server_public,
            jar: CookieJar::new(),
            state: None,
            noise_msg: Vec::new(),
            last_mac1: [0u8; 16],
        }
    }

    /// Build the `init` envelope (with MAC2 when a cookie is stored).
    ///
    /// # Errors
    ///
    /// Returns `HandshakeFailed` if snow rejects the keys.
    pub fn initial_message(&mut self) -> Result<Vec<u8>, CryptoError> {
        let mut ik = IkInitiator::new(&self.keypair, &self.server_public)?;
        self.noise_msg = ik.write_init()?;
        self.state = Some(ik);
        Ok(self.seal_current())
    }

    fn seal_current(&mut self) -> Vec<u8> {
        let msg = envelope::seal_init(&self.noise_msg, &self.mac1_key, self.jar.cookie());
        self.last_mac1 = envelope::mac1_bytes(MsgType::Init, &msg);
        msg
    }

    /// Process a reply envelope: either the response or a cookie demand.
    ///
    /// # Errors
    ///
    /// Envelope, MAC, and Noise failures all abort the handshake; the
    /// caller starts over or gives up.
    pub fn handle_reply(&mut self, data: &[u8]) -> Result<ReplyOutcome, CryptoError> {
        match envelope::peek_type(data)? {
            MsgType::Response => {
                if !envelope::verify_mac1(MsgType::Response, data, &self.mac1_key) {
                    return Err(CryptoError::MacMismatch);
                }
                let Envelope::Response { noise } = envelope::parse(MsgType::Response, data) else {
                    return Err(CryptoError::MacMismatch);
                };
                let ik = self
                    .state
                    .take()
                    .ok_or_else(|| CryptoError::HandshakeFailed("no handshake in flight".into()))?;
                Ok(ReplyOutcome::Established(ik.read_response(noise)?))
            }
            MsgType::CookieReply => {
                let Envelope::CookieReply { body } = envelope::parse(MsgType::CookieReply, data)
                else {
                    return Err(CryptoError::MacMismatch);
                };
                let key = cookie::reply_key(&self.server_public, &self.last_mac1);
                let cookie = cookie::open_reply(&key, body)?;
                self.jar.store(cookie);
                Ok(ReplyOutcome::Retry(self.seal_current()))
            }
            MsgType::Init => Err(CryptoError::UnknownMessageType(MsgType::Init as u8)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peers::PeerPolicy;
    use std::net::IpAddr;

    fn policy_with(peer: &StaticKeypair, enabled: bool) -> PeerPolicy {
        PeerPolicy::new(vec![PeerRecord {
            public_key: peer.public_bytes(),
            enabled,
            internal_addr: "10.8.0.2".parse().unwrap(),
            allowed_ips: vec!["10.8.0.2/32".parse().unwrap()],
        }])
        .unwrap()
    }

    fn responder(server: &StaticKeypair) -> HandshakeResponder {
        HandshakeResponder::new(server.clone(), LoadConfig::default()).unwrap()
    }

    fn src() -> SocketAddr {
        "198.51.100.10:40000".parse().unwrap()
    }

    #[test]
    fn full_dance_establishes_matching_keys() {
        let server = StaticKeypair::generate();
        let client = StaticKeypair::generate();
        let responder = responder(&server);
        let policy = policy_with(&client, true);

        let mut initiator = HandshakeInitiator::new(client.clone(), server.public_bytes());
        let init = initiator.initial_message().unwrap();

        let InitOutcome::Established { response, keys } =
            responder.handle_init(&init, src(), &policy, false)
        else {
            panic!("handshake rejected");
        };
        assert_eq!(keys.peer_public, client.public_bytes());
        assert_eq!(keys.record.internal_addr, "10.8.0.2".parse::<IpAddr>().unwrap());

        let ReplyOutcome::Established(client_out) = initiator.handle_reply(&response).unwrap()
        else {
            panic!("expected established");
        };
        assert_eq!(client_out.session_id, keys.outcome.session_id);
        assert_eq!(client_out.send_key, keys.outcome.recv_key);
        assert_eq!(client_out.recv_key, keys.outcome.send_key);
    }

    #[test]
    fn unknown_peer_is_silently_rejected() {
        let server = StaticKeypair::generate();
        let stranger = StaticKeypair::generate();
        let authorised = StaticKeypair::generate();
        let responder = responder(&server);
        let policy = policy_with(&authorised, true);

        let mut initiator = HandshakeInitiator::new(stranger, server.public_bytes());
        let init = initiator.initial_message().unwrap();
        assert!(matches!(
            responder.handle_init(&init, src(), &policy, false),
            InitOutcome::Rejected(RejectReason::UnknownPeer)
        ));
    }

    #[test]
    fn disabled_peer_is_rejected_as_disabled() {
        let server = StaticKeypair::generate();
        let client = StaticKeypair::generate();
        let responder = responder(&server);
        let policy = policy_with(&client, false);

        let mut initiator = HandshakeInitiator::new(client, server.public_bytes());
        let init = initiator.initial_message().unwrap();
        assert!(matches!(
            responder.handle_init(&init, src(), &policy, false),
            InitOutcome::Rejected(RejectReason::Disabled)
        ));
    }

    #[test]
    fn bad_mac1_is_rejected_before_noise() {
        let server = StaticKeypair::generate();
        let client = StaticKeypair::generate();
        let responder = responder(&server);
        let policy = policy_with(&client, true);

        let mut initiator = HandshakeInitiator::new(client, server.public_bytes());
        let mut init = initiator.initial_message().unwrap();
        init[50] ^= 0x01;
        assert!(matches!(
            responder.handle_init(&init, src(), &policy, false),
            InitOutcome::Rejected(RejectReason::Mac1)
        ));
    }

    #[test]
    fn capacity_limit_rejects_after_authentication() {
        let server = StaticKeypair::generate();
        let client = StaticKeypair::generate();
        let responder = responder(&server);
        let policy = policy_with(&client, true);

        let mut initiator = HandshakeInitiator::new(client, server.public_bytes());
        let init = initiator.initial_message().unwrap();
        assert!(matches!(
            responder.handle_init(&init, src(), &policy, true),
            InitOutcome::Rejected(RejectReason::SessionLimit)
        ));
    }

    #[test]
    fn cookie_dance_under_load() {
        let server = StaticKeypair::generate();
        let client = StaticKeypair::generate();
        // Per-IP threshold of zero: every init demands a cookie until MAC2.
        let responder = HandshakeResponder::new(
            server.clone(),
            LoadConfig {
                per_ip_threshold: 0.0,
                ..LoadConfig::default()
            },
        )
        .unwrap();
        let policy = policy_with(&client, true);

        let mut initiator = HandshakeInitiator::new(client, server.public_bytes());
        let init = initiator.initial_message().unwrap();

        let InitOutcome::CookieReply(reply) = responder.handle_init(&init, src(), &policy, false)
        else {
            panic!("expected cookie demand");
        };
        let ReplyOutcome::Retry(retry) = initiator.handle_reply(&reply).unwrap() else {
            panic!("expected retry");
        };
        let InitOutcome::Established { response, .. } =
            responder.handle_init(&retry, src(), &policy, false)
        else {
            panic!("retry with MAC2 should establish");
        };
        assert!(matches!(
            initiator.handle_reply(&response).unwrap(),
            ReplyOutcome::Established(_)
        ));
    }

    #[test]
    fn cookie_from_other_source_ip_fails_mac2() {
        let server = StaticKeypair::generate();
        let client = StaticKeypair::generate();
        let responder = HandshakeResponder::new(
            server.clone(),
            LoadConfig {
                per_ip_threshold: 0.0,
                ..LoadConfig::default()
            },
        )
        .unwrap();
        let policy = policy_with(&client, true);

        let mut initiator = HandshakeInitiator::new(client, server.public_bytes());
        let init = initiator.initial_message().unwrap();
        let InitOutcome::CookieReply(reply) = responder.handle_init(&init, src(), &policy, false)
        else {
            panic!("expected cookie demand");
        };
        let ReplyOutcome::Retry(retry) = initiator.handle_reply(&reply).unwrap() else {
            panic!("expected retry");
        };
        // Replay the retry from a different source: MAC2 no longer matches.
        let other: SocketAddr = "198.51.100.99:40000".parse().unwrap();
        assert!(matches!(
            responder.handle_init(&retry, other, &policy, false),
            InitOutcome::CookieReply(_)
        ));
    }
}
