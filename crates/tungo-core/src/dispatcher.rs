//! The server dispatcher.
//!
//! One acceptor per configured listener, one TUN demux task, one control
//! tick. Connection-oriented transports hand each accepted connection to a
//! deadline-bounded handshake task; the single UDP socket is demultiplexed
//! here - version/type prefix to the handshake path, everything else to
//! `SessionTable::lookup_by_outer`.
//!
//! Shutdown cascades top-down: the flag stops the acceptors, every session
//! is cancelled, and the dispatcher waits a bounded time for the table to
//! drain before returning.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use tungo_crypto::envelope::{ENVELOPE_VERSION, INIT_LEN};
use tungo_crypto::noise::Role;
use tungo_crypto::replay::{WINDOW_STREAM, WINDOW_UDP};
use tungo_crypto::{RecvState, SendState};
use tungo_transport::tun::TunDevice;
use tungo_transport::{FramedPair, TransportKind, tcp, udp, ws};

use crate::config::{Limits, ServerConfig};
use crate::error::{RejectReason, ServerError};
use crate::handshake::{HandshakeResponder, InitOutcome, NewSessionKeys};
use crate::metrics::Counters;
use crate::peers::PolicyHandle;
use crate::rekey::{RekeyConfig, RekeyMachine};
use crate::service;
use crate::session::{CancelFlag, Session};
use crate::table::SessionTable;
use crate::ip;
use crate::worker::{PacketPool, WorkerContext, run_inbound, run_outbound};

/// How long shutdown waits for sessions to drain.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Control tick period.
const TICK_PERIOD: Duration = Duration::from_secs(1);

/// The TunGo server.
pub struct Server {
    limits: Limits,
    listeners: crate::config::ListenersSection,
    rekey: RekeyConfig,
    policy: Arc<PolicyHandle>,
    table: Arc<SessionTable>,
    counters: Arc<Counters>,
    tun: Arc<dyn TunDevice>,
    responder: Arc<HandshakeResponder>,
    shutdown: Arc<CancelFlag>,
    pool: Arc<PacketPool>,
    doc_ranges: Vec<ipnet::IpNet>,
}

/// Sockets bound during startup, before serving begins.
pub struct BoundListeners {
    udp: Option<Arc<UdpSocket>>,
    tcp: Option<TcpListener>,
    ws: Option<TcpListener>,
}

impl BoundListeners {
    /// The UDP socket's actual local address, if UDP is enabled.
    #[must_use]
    pub fn udp_addr(&self) -> Option<SocketAddr> {
        self.udp.as_ref().and_then(|s| s.local_addr().ok())
    }

    /// The TCP listener's actual local address, if TCP is enabled.
    #[must_use]
    pub fn tcp_addr(&self) -> Option<SocketAddr> {
        self.tcp.as_ref().and_then(|l| l.local_addr().ok())
    }

    /// The WebSocket listener's actual local address, if WS is enabled.
    #[must_use]
    pub fn ws_addr(&self) -> Option<SocketAddr> {
        self.ws.as_ref().and_then(|l| l.local_addr().ok())
    }
}

impl Server {
    /// Assemble a server from validated configuration and a TUN device.
    ///
    /// # Errors
    ///
    /// Fails if the OS CSPRNG is unavailable for the cookie secret.
    pub fn new(config: ServerConfig, tun: Arc<dyn TunDevice>) -> Result<Self, ServerError> {
        let counters = Arc::new(Counters::default());
        let responder = HandshakeResponder::new(config.keypair.clone(), config.load)?;
        Ok(Self {
            table: Arc::new(SessionTable::new(counters.clone())),
            policy: Arc::new(PolicyHandle::new(config.policy)),
            pool: Arc::new(PacketPool::new(64, config.limits.mtu)),
            limits: config.limits,
            listeners: config.listeners,
            rekey: config.rekey,
            counters,
            tun,
            responder: Arc::new(responder),
            shutdown: Arc::new(CancelFlag::default()),
            doc_ranges: service::doc_ranges(),
        })
    }

    /// Runtime counters.
    #[must_use]
    pub fn counters(&self) -> Arc<Counters> {
        self.counters.clone()
    }

    /// The peer policy handle (revocation goes through here).
    #[must_use]
    pub fn policy(&self) -> Arc<PolicyHandle> {
        self.policy.clone()
    }

    /// The session table.
    #[must_use]
    pub fn table(&self) -> Arc<SessionTable> {
        self.table.clone()
    }

    /// Handle that stops the server when cancelled.
    #[must_use]
    pub fn shutdown_handle(&self) -> Arc<CancelFlag> {
        self.shutdown.clone()
    }

    /// Bind every configured listener. Startup errors surface here, before
    /// any traffic is served.
    ///
    /// # Errors
    ///
    /// Returns `Listener` for each bind failure.
    pub async fn bind(&self) -> Result<BoundListeners, ServerError> {
        async fn bind_tcp(addr: SocketAddr) -> Result<TcpListener, ServerError> {
            TcpListener::bind(addr)
                .await
                .map_err(|e| ServerError::Listener {
                    addr,
                    reason: e.to_string(),
                })
        }

        let udp = match self.listeners.udp {
            Some(addr) => Some(Arc::new(UdpSocket::bind(addr).await.map_err(|e| {
                ServerError::Listener {
                    addr,
                    reason: e.to_string(),
                }
            })?)),
            None => None,
        };
        let tcp = match self.listeners.tcp {
            Some(addr) => Some(bind_tcp(addr).await?),
            None => None,
        };
        let ws = match self.listeners.ws {
            Some(addr) => Some(bind_tcp(addr).await?),
            None => None,
        };
        Ok(BoundListeners { udp, tcp, ws })
    }

    /// Serve until shutdown. Returns `Ok` on a clean drain, `Err` when a
    /// listener dies unrecoverably.
    ///
    /// # Errors
    ///
    /// Returns the first fatal listener or TUN error.
    pub async fn serve(self: Arc<Self>, listeners: BoundListeners) -> Result<(), ServerError> {
        let (fatal_tx, mut fatal_rx) = mpsc::channel::<ServerError>(4);

        if let Some(socket) = listeners.udp {
            info!(addr = ?socket.local_addr().ok(), "udp listener up");
            tokio::spawn(self.clone().udp_loop(socket, fatal_tx.clone()));
        }
        if let Some(listener) = listeners.tcp {
            info!(addr = ?listener.local_addr().ok(), "tcp listener up");
            tokio::spawn(self.clone().tcp_accept_loop(listener, fatal_tx.clone()));
        }
        if let Some(listener) = listeners.ws {
            info!(addr = ?listener.local_addr().ok(), "ws listener up");
            tokio::spawn(self.clone().ws_accept_loop(listener, fatal_tx.clone()));
        }
        tokio::spawn(self.clone().tun_demux(fatal_tx.clone()));
        tokio::spawn(self.clone().control_tick());

        let result = tokio::select! {
            () = self.shutdown.cancelled() => Ok(()),
            err = fatal_rx.recv() => match err {
                Some(e) => Err(e),
                None => Ok(()),
            },
        };

        // Top-down teardown: stop acceptors, cancel sessions, drain.
        self.shutdown.cancel();
        for session in self.table.sessions() {
            session.cancel.cancel();
        }
        let drained = timeout(DRAIN_TIMEOUT, async {
            while !self.table.is_empty() {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        })
        .await;
        if drained.is_err() {
            warn!(remaining = self.table.len(), "drain timeout; aborting sessions");
            for session in self.table.sessions() {
                self.table.remove(session.id);
            }
        }
        info!(counters = %self.counters.snapshot(), "server stopped");
        result
    }

    fn at_capacity(&self) -> bool {
        self.table.len() >= self.limits.max_sessions
    }

    fn max_frame(&self) -> usize {
        self.limits.mtu + tungo_crypto::aead::OVERHEAD
    }

    async fn udp_loop(
        self: Arc<Self>,
        socket: Arc<UdpSocket>,
        fatal: mpsc::Sender<ServerError>,
    ) {
        let mut buf = vec![0u8; 65535];
        loop {
            let (n, src) = tokio::select! {
                () = self.shutdown.cancelled() => return,
                res = socket.recv_from(&mut buf) => match res {
                    Ok(pair) => pair,
                    Err(e) => {
                        let _ = fatal
                            .send(ServerError::Listener {
                                addr: socket.local_addr().unwrap_or(([0, 0, 0, 0], 0).into()),
                                reason: e.to_string(),
                            })
                            .await;
                        return;
                    }
                },
            };
            let data = &buf[..n];

            // A handshake init is the only unauthenticated datagram the
            // server reacts to; everything else must match a session.
            let is_init = n == INIT_LEN && data[0] == ENVELOPE_VERSION && data[1] == 0x01;
            if is_init {
                let policy = self.policy.snapshot();
                match self
                    .responder
                    .handle_init(data, src, &policy, self.at_capacity())
                {
                    InitOutcome::Established { response, keys } => {
                        if socket.send_to(&response, src).await.is_ok() {
                            let (feed, pair) =
                                udp::session_pair(socket.clone(), src, udp::WRITE_DEADLINE);
                            self.install_session(keys, pair, Some(feed));
                        }
                    }
                    InitOutcome::CookieReply(reply) => {
                        self.counters.reject(RejectReason::CookieRequired);
                        let _ = socket.send_to(&reply, src).await;
                    }
                    InitOutcome::Rejected(reason) => self.counters.reject(reason),
                }
            } else {
                match self.table.lookup_by_outer(src) {
                    Some(session) => {
                        let feed = session.udp_feed.as_ref().expect("udp session has feed");
                        if feed.try_send(data.to_vec()).is_err() {
                            Counters::bump(&self.counters.backpressure_drop);
                        }
                    }
                    // Unknown source: includes authentic ciphertext from a
                    // rebound address; the client must re-handshake.
                    None => Counters::bump(&self.counters.no_session_drop),
                }
            }
        }
    }

    async fn tcp_accept_loop(
        self: Arc<Self>,
        listener: TcpListener,
        fatal: mpsc::Sender<ServerError>,
    ) {
        loop {
            let (stream, peer) = tokio::select! {
                () = self.shutdown.cancelled() => return,
                res = listener.accept() => match res {
                    Ok(pair) => pair,
                    Err(e) => {
                        let _ = fatal
                            .send(ServerError::Listener {
                                addr: listener.local_addr().unwrap_or(([0, 0, 0, 0], 0).into()),
                                reason: e.to_string(),
                            })
                            .await;
                        return;
                    }
                },
            };
            let _ = tcp::set_keepalive(&stream, self.limits.keepalive);
            let server = self.clone();
            tokio::spawn(async move {
                match tcp::framed_pair(stream, server.max_frame()) {
                    Ok(pair) => server.handshake_stream(pair).await,
                    Err(e) => debug!(%peer, error = %e, "tcp split failed"),
                }
            });
        }
    }

    async fn ws_accept_loop(
        self: Arc<Self>,
        listener: TcpListener,
        fatal: mpsc::Sender<ServerError>,
    ) {
        loop {
            let (stream, peer) = tokio::select! {
                () = self.shutdown.cancelled() => return,
                res = listener.accept() => match res {
                    Ok(pair) => pair,
                    Err(e) => {
                        let _ = fatal
                            .send(ServerError::Listener {
                                addr: listener.local_addr().unwrap_or(([0, 0, 0, 0], 0).into()),
                                reason: e.to_string(),
                            })
                            .await;
                        return;
                    }
                },
            };
            let server = self.clone();
            tokio::spawn(async move {
                match tokio_tungstenite::accept_async(stream).await {
                    Ok(websocket) => {
                        let pair = ws::framed_pair(websocket, peer, server.max_frame());
                        server.handshake_stream(pair).await;
                    }
                    Err(e) => debug!(%peer, error = %e, "ws upgrade failed"),
                }
            });
        }
    }

    // Deadline-bounded handshake on a connection-oriented transport. The
    // cookie retry arrives on the same connection.
    async fn handshake_stream(self: Arc<Self>, mut pair: FramedPair) {
        let deadline = self.limits.handshake_timeout;
        let server = self.clone();
        let remote = pair.remote;
        let established = timeout(deadline, async {
            let mut buf = vec![0u8; 4096];
            loop {
                let n = match pair.reader.read_frame(&mut buf).await {
                    Ok(n) => n,
                    Err(_) => return None,
                };
                let policy = server.policy.snapshot();
                match server
                    .responder
                    .handle_init(&buf[..n], remote, &policy, server.at_capacity())
                {
                    InitOutcome::Established { response, keys } => {
                        if pair.writer.write_frame(&response).await.is_err() {
                            return None;
                        }
                        return Some(keys);
                    }
                    InitOutcome::CookieReply(reply) => {
                        server.counters.reject(RejectReason::CookieRequired);
                        if pair.writer.write_frame(&reply).await.is_err() {
                            return None;
                        }
                    }
                    InitOutcome::Rejected(reason) => {
                        server.counters.reject(reason);
                        return None;
                    }
                }
            }
        })
        .await;

        match established {
            Ok(Some(keys)) => self.install_session(keys, pair, None),
            _ => pair.writer.close().await,
        }
    }

    fn install_session(
        &self,
        keys: NewSessionKeys,
        pair: FramedPair,
        udp_feed: Option<mpsc::Sender<Vec<u8>>>,
    ) {
        let NewSessionKeys {
            peer_public,
            outcome,
            record,
        } = keys;

        let id = self.table.allocate_id();
        let (session, outbound_rx) = Session::new(
            id,
            peer_public,
            outcome.session_id,
            record.internal_addr,
            record.allowed_ips.clone(),
            pair.remote,
            pair.kind,
            Role::Responder,
            udp_feed,
        );
        for evicted in self.table.insert(session.clone()) {
            debug!(
                session = evicted.id,
                peer = %evicted.fingerprint,
                "session replaced by new handshake"
            );
        }

        let machine = RekeyMachine::new(
            Role::Responder,
            self.responder.public(),
            peer_public,
            outcome.chain_key,
            self.rekey.clone(),
        );
        let width = match pair.kind {
            TransportKind::Udp => WINDOW_UDP,
            TransportKind::Tcp | TransportKind::WebSocket => WINDOW_STREAM,
        };
        let keepalive = match pair.kind {
            TransportKind::Udp => None,
            TransportKind::Tcp | TransportKind::WebSocket => Some(self.limits.keepalive),
        };
        let send = SendState::new(&outcome.send_key);
        let recv = RecvState::new(&outcome.recv_key, width);

        let ctx = WorkerContext {
            session: session.clone(),
            table: self.table.clone(),
            counters: self.counters.clone(),
            tun: self.tun.clone(),
            rekey: Arc::new(Mutex::new(machine)),
            mtu: self.limits.mtu,
            keepalive,
            doc_ranges: self.doc_ranges.clone(),
            pool: self.pool.clone(),
            mtu_acks: None,
        };
        tokio::spawn(run_inbound(ctx.clone(), pair.reader, recv));
        tokio::spawn(run_outbound(ctx, pair.writer, send, outbound_rx));

        Counters::bump(&self.counters.handshake_ok);
        info!(
            session = id,
            peer = %session.fingerprint,
            transport = %session.kind,
            remote = %session.remote,
            "session established"
        );
    }

    async fn tun_demux(self: Arc<Self>, fatal: mpsc::Sender<ServerError>) {
        let mut buf = vec![0u8; self.limits.mtu];
        loop {
            let n = tokio::select! {
                () = self.shutdown.cancelled() => return,
                res = self.tun.read_packet(&mut buf) => match res {
                    Ok(n) => n,
                    Err(e) => {
                        let _ = fatal.send(ServerError::Tun(e)).await;
                        return;
                    }
                },
            };
            let Some(header) = ip::parse(&buf[..n]) else {
                Counters::bump(&self.counters.malformed_drop);
                continue;
            };
            match self.table.lookup_by_inner(header.dst) {
                Some(session) => {
                    let mut packet = self.pool.get();
                    packet.extend_from_slice(&buf[..n]);
                    if !session.enqueue_packet(packet) {
                        Counters::bump(&self.counters.backpressure_drop);
                    }
                }
                None => Counters::bump(&self.counters.no_session_drop),
            }
        }
    }

    async fn control_tick(self: Arc<Self>) {
        let mut tick = tokio::time::interval(TICK_PERIOD);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                () = self.shutdown.cancelled() => return,
                _ = tick.tick() => {}
            }
            self.responder.tick();

            let policy = self.policy.snapshot();
            for session in self.table.sessions() {
                if policy.lookup_key(&session.peer_public).is_none() {
                    info!(
                        session = session.id,
                        peer = %session.fingerprint,
                        "peer revoked; removing session"
                    );
                    self.table.remove(session.id);
                    continue;
                }
                if session.idle() > self.limits.idle_timeout(session.kind) {
                    debug!(
                        session = session.id,
                        peer = %session.fingerprint,
                        "idle timeout; removing session"
                    );
                    self.table.remove(session.id);
                }
            }
        }
    }
}
