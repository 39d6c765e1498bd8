//! Server and client configuration.
//!
//! The on-disk format is TOML; every 32-byte key is base64. Parsing is
//! two-phase: serde deserialises the raw document, then `validate`
//! cross-checks it into the runtime types, failing fast with one
//! actionable diagnostic per problem.

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use tungo_crypto::StaticKeypair;
use tungo_transport::TransportKind;

use crate::dos::LoadConfig;
use crate::error::ConfigError;
use crate::peers::{PeerPolicy, PeerRecord};
use crate::rekey::RekeyConfig;

/// Decode a base64 32-byte key field.
///
/// # Errors
///
/// Returns `InvalidKey` naming the offending field.
pub fn decode_key(value: &str, context: &str) -> Result<[u8; 32], ConfigError> {
    let bytes = BASE64.decode(value).map_err(|_| ConfigError::InvalidKey {
        context: context.to_string(),
    })?;
    <[u8; 32]>::try_from(bytes.as_slice()).map_err(|_| ConfigError::InvalidKey {
        context: context.to_string(),
    })
}

/// Encode a 32-byte key for storage.
#[must_use]
pub fn encode_key(key: &[u8; 32]) -> String {
    BASE64.encode(key)
}

/// Raw server document as it appears on disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfigFile {
    /// Identity and addressing.
    pub server: ServerSection,
    /// One address per enabled transport.
    pub listeners: ListenersSection,
    /// Operational limits; every field has a default.
    #[serde(default)]
    pub limits: LimitsSection,
    /// Authorised peers.
    #[serde(default)]
    pub peers: Vec<PeerEntry>,
}

/// `[server]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSection {
    /// Server static private key, base64.
    pub private_key: String,
    /// TUN subnet the inner addresses live in.
    pub subnet: IpNet,
}

/// `[listeners]` section.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListenersSection {
    /// UDP listen address.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub udp: Option<SocketAddr>,
    /// TCP listen address.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tcp: Option<SocketAddr>,
    /// WebSocket listen address.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ws: Option<SocketAddr>,
}

/// `[limits]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsSection {
    /// Maximum concurrent sessions.
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,
    /// Data-plane MTU.
    #[serde(default = "default_mtu")]
    pub mtu: usize,
    /// Handshake completion deadline, seconds.
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout_secs: u64,
    /// Idle timeout for UDP sessions, seconds.
    #[serde(default = "default_idle_udp")]
    pub idle_timeout_udp_secs: u64,
    /// Idle timeout for TCP/WS sessions, seconds.
    #[serde(default = "default_idle_stream")]
    pub idle_timeout_stream_secs: u64,
    /// Keepalive interval on stream transports, seconds.
    #[serde(default = "default_keepalive")]
    pub keepalive_secs: u64,
}

fn default_max_sessions() -> usize {
    256
}
fn default_mtu() -> usize {
    1420
}
fn default_handshake_timeout() -> u64 {
    5
}
fn default_idle_udp() -> u64 {
    120
}
fn default_idle_stream() -> u64 {
    180
}
fn default_keepalive() -> u64 {
    30
}

impl Default for LimitsSection {
    fn default() -> Self {
        Self {
            max_sessions: default_max_sessions(),
            mtu: default_mtu(),
            handshake_timeout_secs: default_handshake_timeout(),
            idle_timeout_udp_secs: default_idle_udp(),
            idle_timeout_stream_secs: default_idle_stream(),
            keepalive_secs: default_keepalive(),
        }
    }
}

/// `[[peers]]` entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerEntry {
    /// Peer static public key, base64.
    pub public_key: String,
    /// Disabled peers stay listed but cannot connect.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// The peer's single inner address.
    pub internal_addr: IpAddr,
    /// Prefixes the peer may source packets from.
    pub allowed_ips: Vec<IpNet>,
}

fn default_true() -> bool {
    true
}

/// Validated runtime configuration.
#[derive(Debug)]
pub struct ServerConfig {
    /// Server identity.
    pub keypair: StaticKeypair,
    /// TUN subnet.
    pub subnet: IpNet,
    /// Listen addresses.
    pub listeners: ListenersSection,
    /// Limits with durations resolved.
    pub limits: Limits,
    /// Validated peer table.
    pub policy: PeerPolicy,
    /// Rekey tuning; defaults unless overridden programmatically.
    pub rekey: RekeyConfig,
    /// Handshake load thresholds; defaults unless overridden
    /// programmatically.
    pub load: LoadConfig,
}

/// Resolved operational limits.
#[derive(Debug, Clone)]
pub struct Limits {
    /// Maximum concurrent sessions.
    pub max_sessions: usize,
    /// Data-plane MTU.
    pub mtu: usize,
    /// Handshake completion deadline.
    pub handshake_timeout: Duration,
    /// Idle timeout for UDP sessions.
    pub idle_timeout_udp: Duration,
    /// Idle timeout for stream sessions.
    pub idle_timeout_stream: Duration,
    /// Keepalive interval on stream transports.
    pub keepalive: Duration,
}

impl Limits {
    /// Idle timeout for a given transport.
    #[must_use]
    pub fn idle_timeout(&self, kind: TransportKind) -> Duration {
        match kind {
            TransportKind::Udp => self.idle_timeout_udp,
            TransportKind::Tcp | TransportKind::WebSocket => self.idle_timeout_stream,
        }
    }
}

impl From<&LimitsSection> for Limits {
    fn from(s: &LimitsSection) -> Self {
        Self {
            max_sessions: s.max_sessions,
            mtu: s.mtu,
            handshake_timeout: Duration::from_secs(s.handshake_timeout_secs),
            idle_timeout_udp: Duration::from_secs(s.idle_timeout_udp_secs),
            idle_timeout_stream: Duration::from_secs(s.idle_timeout_stream_secs),
            keepalive: Duration::from_secs(s.keepalive_secs),
        }
    }
}

impl ServerConfigFile {
    /// Parse the TOML text.
    ///
    /// # Errors
    ///
    /// Returns `Parse` with the deserialiser's diagnostic.
    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        toml::from_str(text).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Cross-check the document into a runtime [`ServerConfig`].
    ///
    /// # Errors
    ///
    /// Surfaces the first invariant violation; see [`ConfigError`].
    pub fn validate(&self) -> Result<ServerConfig, ConfigError> {
        if self.listeners.udp.is_none() && self.listeners.tcp.is_none() && self.listeners.ws.is_none()
        {
            return Err(ConfigError::NoListeners);
        }

        let private = decode_key(&self.server.private_key, "server.private_key")?;
        let keypair = StaticKeypair::from_private(private);

        let mut records = Vec::with_capacity(self.peers.len());
        for (i, entry) in self.peers.iter().enumerate() {
            let public_key = decode_key(&entry.public_key, &format!("peers[{i}].public_key"))?;
            records.push(PeerRecord {
                public_key,
                enabled: entry.enabled,
                internal_addr: entry.internal_addr,
                allowed_ips: entry.allowed_ips.clone(),
            });
        }
        let policy = PeerPolicy::new(records)?;

        Ok(ServerConfig {
            keypair,
            subnet: self.server.subnet,
            listeners: self.listeners.clone(),
            limits: Limits::from(&self.limits),
            policy,
            rekey: RekeyConfig::default(),
            load: LoadConfig::default(),
        })
    }
}

/// Client-side configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfigFile {
    /// Client static private key, base64.
    pub private_key: String,
    /// Server static public key, base64.
    pub server_public_key: String,
    /// Server address and port.
    pub server_addr: SocketAddr,
    /// Transport: "udp", "tcp", or "ws".
    pub transport: String,
    /// Data-plane MTU.
    #[serde(default = "default_mtu")]
    pub mtu: usize,
}

/// Validated client configuration.
pub struct ClientConfig {
    /// Client identity.
    pub keypair: StaticKeypair,
    /// Server static public key.
    pub server_public: [u8; 32],
    /// Server endpoint.
    pub server_addr: SocketAddr,
    /// Chosen transport.
    pub transport: TransportKind,
    /// Data-plane MTU.
    pub mtu: usize,
}

impl ClientConfigFile {
    /// Parse the TOML text.
    ///
    /// # Errors
    ///
    /// Returns `Parse` with the deserialiser's diagnostic.
    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        toml::from_str(text).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Cross-check into a runtime [`ClientConfig`].
    ///
    /// # Errors
    ///
    /// Returns `InvalidKey` or `UnknownTransport`.
    pub fn validate(&self) -> Result<ClientConfig, ConfigError> {
        let transport = match self.transport.as_str() {
            "udp" => TransportKind::Udp,
            "tcp" => TransportKind::Tcp,
            "ws" => TransportKind::WebSocket,
            other => return Err(ConfigError::UnknownTransport(other.to_string())),
        };
        Ok(ClientConfig {
            keypair: StaticKeypair::from_private(decode_key(&self.private_key, "private_key")?),
            server_public: decode_key(&self.server_public_key, "server_public_key")?,
            server_addr: self.server_addr,
            transport,
            mtu: self.mtu,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_toml(peer_key: &str) -> String {
        let server_key = encode_key(&StaticKeypair::generate().private_bytes());
        format!(
            r#"
[server]
private_key = "{server_key}"
subnet = "10.8.0.0/24"

[listeners]
udp = "0.0.0.0:51820"

[[peers]]
public_key = "{peer_key}"
internal_addr = "10.8.0.2"
allowed_ips = ["10.8.0.2/32"]
"#
        )
    }

    #[test]
    fn valid_document_loads() {
        let peer_key = encode_key(&StaticKeypair::generate().public_bytes());
        let file = ServerConfigFile::from_toml(&sample_toml(&peer_key)).unwrap();
        let config = file.validate().unwrap();
        assert_eq!(config.limits.max_sessions, 256);
        assert_eq!(config.limits.mtu, 1420);
        assert_eq!(config.policy.records().len(), 1);
        assert!(config.listeners.udp.is_some());
    }

    #[test]
    fn short_key_fails_with_field_name() {
        let file = ServerConfigFile::from_toml(&sample_toml("AAAA")).unwrap();
        let err = file.validate().unwrap_err();
        assert!(err.to_string().contains("peers[0].public_key"));
    }

    #[test]
    fn missing_listeners_fail() {
        let server_key = encode_key(&StaticKeypair::generate().private_bytes());
        let text = format!(
            "[server]\nprivate_key = \"{server_key}\"\nsubnet = \"10.8.0.0/24\"\n\n[listeners]\n"
        );
        let file = ServerConfigFile::from_toml(&text).unwrap();
        assert!(matches!(file.validate(), Err(ConfigError::NoListeners)));
    }

    #[test]
    fn client_transport_names() {
        let make = |transport: &str| ClientConfigFile {
            private_key: encode_key(&StaticKeypair::generate().private_bytes()),
            server_public_key: encode_key(&StaticKeypair::generate().public_bytes()),
            server_addr: "127.0.0.1:51820".parse().unwrap(),
            transport: transport.to_string(),
            mtu: 1420,
        };
        assert_eq!(make("udp").validate().unwrap().transport, TransportKind::Udp);
        assert_eq!(make("ws").validate().unwrap().transport, TransportKind::WebSocket);
        assert!(matches!(
            make("quic").validate(),
            Err(ConfigError::UnknownTransport(_))
        ));
    }

    #[test]
    fn key_codec_roundtrip() {
        let key = StaticKeypair::generate().public_bytes();
        assert_eq!(decode_key(&encode_key(&key), "test").unwrap(), key);
    }
}
