//! Builders for two-sided test topologies: a server on ephemeral ports
//! with an in-memory TUN, full clients, and a "raw" client that exposes
//! its crypto state so tests can forge, replay, and rebind frames.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::UdpSocket;

use tungo_core::client::{self, RunningClient};
use tungo_core::config::{ClientConfig, Limits, ListenersSection, ServerConfig};
use tungo_core::dos::LoadConfig;
use tungo_core::handshake::{HandshakeInitiator, ReplyOutcome};
use tungo_core::peers::{PeerPolicy, PeerRecord};
use tungo_core::rekey::RekeyConfig;
use tungo_core::{Server, ServerError};
use tungo_crypto::aead::{NONCE_LEN, TAG_LEN};
use tungo_crypto::noise::HandshakeOutcome;
use tungo_crypto::replay::WINDOW_UDP;
use tungo_crypto::{RecvState, SendState, StaticKeypair};
use tungo_transport::TransportKind;
use tungo_transport::tun::{InMemoryTun, TunHandle};

/// MTU used throughout the suite.
pub const TEST_MTU: usize = 1420;

/// A standard single-address peer record.
pub fn peer_record(keypair: &StaticKeypair, internal: &str) -> PeerRecord {
    PeerRecord {
        public_key: keypair.public_bytes(),
        enabled: true,
        internal_addr: internal.parse().unwrap(),
        allowed_ips: vec![format!("{internal}/32").parse().unwrap()],
    }
}

/// A UDP-only server config on an ephemeral localhost port.
pub fn udp_server_config(server: &StaticKeypair, peers: Vec<PeerRecord>) -> ServerConfig {
    ServerConfig {
        keypair: server.clone(),
        subnet: "10.8.0.0/24".parse().unwrap(),
        listeners: ListenersSection {
            udp: Some("127.0.0.1:0".parse().unwrap()),
            tcp: None,
            ws: None,
        },
        limits: Limits {
            max_sessions: 16,
            mtu: TEST_MTU,
            handshake_timeout: Duration::from_secs(5),
            idle_timeout_udp: Duration::from_secs(120),
            idle_timeout_stream: Duration::from_secs(180),
            keepalive: Duration::from_secs(30),
        },
        policy: PeerPolicy::new(peers).unwrap(),
        rekey: RekeyConfig::default(),
        load: LoadConfig::default(),
    }
}

/// Bind and spawn a server; returns its handle, the live UDP address, and
/// the server-side TUN handle.
pub async fn start_udp_server(config: ServerConfig) -> (Arc<Server>, SocketAddr, TunHandle) {
    let (tun, handle) = InMemoryTun::pair(TEST_MTU, 512);
    let server = Arc::new(Server::new(config, Arc::new(tun)).unwrap());
    let bound = server.bind().await.unwrap();
    let addr = bound.udp_addr().expect("udp listener configured");
    tokio::spawn(server.clone().serve(bound));
    (server, addr, handle)
}

/// Connect a full client over UDP; returns the tunnel and its TUN handle.
pub async fn connect_udp_client(
    keypair: &StaticKeypair,
    server_public: [u8; 32],
    server_addr: SocketAddr,
    rekey: RekeyConfig,
) -> Result<(RunningClient, TunHandle), ServerError> {
    let (tun, handle) = InMemoryTun::pair(TEST_MTU, 512);
    let config = ClientConfig {
        keypair: keypair.clone(),
        server_public,
        server_addr,
        transport: TransportKind::Udp,
        mtu: TEST_MTU,
    };
    let running = client::connect(&config, Arc::new(tun), rekey).await?;
    Ok((running, handle))
}

/// A hand-driven UDP peer exposing its crypto state: what an attacker (or
/// a misbehaving client) works with.
pub struct RawClient {
    /// The socket the handshake ran over.
    pub socket: UdpSocket,
    /// Server address.
    pub server_addr: SocketAddr,
    /// Sending half of the session crypto.
    pub send: SendState,
    /// Receiving half of the session crypto.
    pub recv: RecvState,
    /// The raw handshake outcome.
    pub outcome: HandshakeOutcome,
}

impl RawClient {
    /// Handshake over a fresh socket and surface the derived state.
    pub async fn connect(
        keypair: &StaticKeypair,
        server_public: [u8; 32],
        server_addr: SocketAddr,
    ) -> Self {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let mut initiator = HandshakeInitiator::new(keypair.clone(), server_public);
        let init = initiator.initial_message().unwrap();
        socket.send_to(&init, server_addr).await.unwrap();

        let mut buf = vec![0u8; 4096];
        let outcome = loop {
            let (n, src) = socket.recv_from(&mut buf).await.unwrap();
            assert_eq!(src, server_addr);
            match initiator.handle_reply(&buf[..n]).unwrap() {
                ReplyOutcome::Established(outcome) => break outcome,
                ReplyOutcome::Retry(retry) => {
                    socket.send_to(&retry, server_addr).await.unwrap();
                }
            }
        };

        Self {
            socket,
            server_addr,
            send: SendState::new(&outcome.send_key),
            recv: RecvState::new(&outcome.recv_key, WINDOW_UDP),
            outcome,
        }
    }

    /// Seal a plaintext into a wire frame using this client's send state.
    pub fn seal(&mut self, plaintext: &[u8]) -> Vec<u8> {
        let mut buf = vec![0u8; NONCE_LEN + plaintext.len() + TAG_LEN];
        buf[NONCE_LEN..NONCE_LEN + plaintext.len()].copy_from_slice(plaintext);
        let len = self.send.seal_next(&mut buf, plaintext.len()).unwrap();
        buf.truncate(len);
        buf
    }

    /// Send a frame from this client's own socket.
    pub async fn send_frame(&self, frame: &[u8]) {
        self.socket.send_to(frame, self.server_addr).await.unwrap();
    }
}

/// Wait until `predicate` holds or the deadline lapses.
pub async fn wait_until<F: FnMut() -> bool>(mut predicate: F, deadline: Duration) -> bool {
    let start = tokio::time::Instant::now();
    while start.elapsed() < deadline {
        if predicate() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    predicate()
}
