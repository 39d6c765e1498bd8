//! Client-side connector.
//!
//! Performs the initiator handshake over the configured transport (with
//! the cookie retry when the server is under load) and then runs exactly
//! the same two worker pipelines the server runs, against the client's own
//! TUN device.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::info;

use tungo_crypto::noise::{HandshakeOutcome, Role};
use tungo_crypto::replay::{WINDOW_STREAM, WINDOW_UDP};
use tungo_crypto::{CryptoError, RecvState, SendState};
use tungo_transport::tun::TunDevice;
use tungo_transport::{FramedPair, TransportKind, tcp, udp, ws};

use crate::config::ClientConfig;
use crate::error::ServerError;
use crate::handshake::{HandshakeInitiator, ReplyOutcome};
use crate::metrics::Counters;
use crate::rekey::{RekeyConfig, RekeyMachine};
use crate::service;
use crate::session::Session;
use crate::table::SessionTable;
use crate::worker::{PacketPool, WorkerContext, run_inbound, run_outbound};

/// Overall handshake deadline on the client side.
const HANDSHAKE_DEADLINE: Duration = Duration::from_secs(5);

/// A connected client tunnel.
pub struct RunningClient {
    /// The single session to the server.
    pub session: Arc<Session>,
    /// The client's (one-entry) session table.
    pub table: Arc<SessionTable>,
    /// Data-plane counters.
    pub counters: Arc<Counters>,
    /// MTU probe acks, consumed by `mtu::probe_path_mtu`.
    pub mtu_acks: mpsc::Receiver<u16>,
}

impl RunningClient {
    /// Tear the tunnel down.
    pub fn shutdown(&self) {
        self.session.cancel.cancel();
    }

    /// Is the tunnel still up?
    #[must_use]
    pub fn is_up(&self) -> bool {
        !self.session.cancel.is_cancelled()
    }
}

/// Connect to the server and start the tunnel.
///
/// # Errors
///
/// Returns transport errors from the dial, and `Crypto` errors when the
/// handshake is rejected or times out.
pub async fn connect(
    config: &ClientConfig,
    tun: Arc<dyn TunDevice>,
    rekey: RekeyConfig,
) -> Result<RunningClient, ServerError> {
    let mut initiator = HandshakeInitiator::new(config.keypair.clone(), config.server_public);
    let max_frame = config.mtu + tungo_crypto::aead::OVERHEAD;

    let (outcome, pair, udp_parts) = match config.transport {
        TransportKind::Udp => {
            let socket = Arc::new(
                UdpSocket::bind(("0.0.0.0", 0))
                    .await
                    .map_err(tungo_transport::TransportError::Io)?,
            );
            let outcome = timeout(
                HANDSHAKE_DEADLINE,
                udp_handshake(&mut initiator, &socket, config.server_addr),
            )
            .await
            .map_err(|_| CryptoError::HandshakeFailed("handshake timed out".into()))??;
            let (feed, pair) = udp::session_pair(socket.clone(), config.server_addr, udp::WRITE_DEADLINE);
            (outcome, pair, Some((socket, feed)))
        }
        TransportKind::Tcp => {
            let stream = TcpStream::connect(config.server_addr)
                .await
                .map_err(tungo_transport::TransportError::Io)?;
            let _ = tcp::set_keepalive(&stream, Duration::from_secs(30));
            let mut pair = tcp::framed_pair(stream, max_frame)
                .map_err(tungo_transport::TransportError::Io)?;
            let outcome = timeout(HANDSHAKE_DEADLINE, stream_handshake(&mut initiator, &mut pair))
                .await
                .map_err(|_| CryptoError::HandshakeFailed("handshake timed out".into()))??;
            (outcome, pair, None)
        }
        TransportKind::WebSocket => {
            let url = format!("ws://{}/", config.server_addr);
            let (websocket, _) = tokio_tungstenite::connect_async(url)
                .await
                .map_err(|e| tungo_transport::TransportError::Other(e.to_string()))?;
            let mut pair = ws::framed_pair(websocket, config.server_addr, max_frame);
            let outcome = timeout(HANDSHAKE_DEADLINE, stream_handshake(&mut initiator, &mut pair))
                .await
                .map_err(|_| CryptoError::HandshakeFailed("handshake timed out".into()))??;
            (outcome, pair, None)
        }
    };

    let counters = Arc::new(Counters::default());
    let table = Arc::new(SessionTable::new(counters.clone()));
    let (session, outbound_rx) = Session::new(
        table.allocate_id(),
        config.server_public,
        outcome.session_id,
        std::net::IpAddr::from([0, 0, 0, 0]),
        // The server side of the tunnel may route us anything.
        vec![
            "0.0.0.0/0".parse().expect("static prefix parses"),
            "::/0".parse().expect("static prefix parses"),
        ],
        config.server_addr,
        config.transport,
        Role::Initiator,
        udp_parts.as_ref().map(|(_, feed)| feed.clone()),
    );
    table.insert(session.clone());

    // For UDP the client owns its socket, so it also owns the receive
    // loop that feeds the session's inbound queue.
    if let Some((socket, feed)) = udp_parts {
        let session = session.clone();
        let server_addr = config.server_addr;
        tokio::spawn(async move {
            let mut buf = vec![0u8; 65535];
            loop {
                let recv = tokio::select! {
                    () = session.cancel.cancelled() => return,
                    res = socket.recv_from(&mut buf) => res,
                };
                match recv {
                    Ok((n, src)) if src == server_addr => {
                        if feed.send(buf[..n].to_vec()).await.is_err() {
                            return;
                        }
                    }
                    Ok(_) => continue,
                    Err(_) => return,
                }
            }
        });
    }

    let machine = RekeyMachine::new(
        Role::Initiator,
        config.keypair.public_bytes(),
        config.server_public,
        outcome.chain_key,
        rekey,
    );
    let width = match config.transport {
        TransportKind::Udp => WINDOW_UDP,
        TransportKind::Tcp | TransportKind::WebSocket => WINDOW_STREAM,
    };
    let keepalive = match config.transport {
        TransportKind::Udp => None,
        TransportKind::Tcp | TransportKind::WebSocket => Some(Duration::from_secs(30)),
    };
    let (ack_tx, ack_rx) = mpsc::channel(16);

    let ctx = WorkerContext {
        session: session.clone(),
        table: table.clone(),
        counters: counters.clone(),
        tun,
        rekey: Arc::new(Mutex::new(machine)),
        mtu: config.mtu,
        keepalive,
        doc_ranges: service::doc_ranges(),
        pool: Arc::new(PacketPool::new(16, config.mtu)),
        mtu_acks: Some(ack_tx),
    };
    let send = SendState::new(&outcome.send_key);
    let recv = RecvState::new(&outcome.recv_key, width);
    tokio::spawn(run_inbound(ctx.clone(), pair.reader, recv));
    tokio::spawn(run_outbound(ctx.clone(), pair.writer, send, outbound_rx));

    // The client's TUN reader is its own demux: every packet goes to the
    // single session.
    {
        let session = session.clone();
        let ctx = ctx.clone();
        tokio::spawn(async move {
            let mut buf = vec![0u8; ctx.mtu];
            loop {
                let n = tokio::select! {
                    () = session.cancel.cancelled() => return,
                    res = ctx.tun.read_packet(&mut buf) => match res {
                        Ok(n) => n,
                        Err(_) => {
                            session.cancel.cancel();
                            return;
                        }
                    },
                };
                let mut packet = ctx.pool.get();
                packet.extend_from_slice(&buf[..n]);
                if !session.enqueue_packet(packet) {
                    Counters::bump(&ctx.counters.backpressure_drop);
                }
            }
        });
    }

    info!(
        server = %config.server_addr,
        transport = %config.transport,
        "tunnel established"
    );
    Ok(RunningClient {
        session,
        table,
        counters,
        mtu_acks: ack_rx,
    })
}

async fn stream_handshake(
    initiator: &mut HandshakeInitiator,
    pair: &mut FramedPair,
) -> Result<HandshakeOutcome, ServerError> {
    let init = initiator.initial_message()?;
    pair.writer.write_frame(&init).await?;
    let mut buf = vec![0u8; 4096];
    loop {
        let n = pair.reader.read_frame(&mut buf).await?;
        match initiator.handle_reply(&buf[..n])? {
            ReplyOutcome::Established(outcome) => return Ok(outcome),
            ReplyOutcome::Retry(retry) => pair.writer.write_frame(&retry).await?,
        }
    }
}

async fn udp_handshake(
    initiator: &mut HandshakeInitiator,
    socket: &UdpSocket,
    server: SocketAddr,
) -> Result<HandshakeOutcome, ServerError> {
    let init = initiator.initial_message()?;
    socket
        .send_to(&init, server)
        .await
        .map_err(tungo_transport::TransportError::Io)?;
    let mut buf = vec![0u8; 4096];
    loop {
        let (n, src) = socket
            .recv_from(&mut buf)
            .await
            .map_err(tungo_transport::TransportError::Io)?;
        if src != server {
            continue;
        }
        match initiator.handle_reply(&buf[..n])? {
            ReplyOutcome::Established(outcome) => return Ok(outcome),
            ReplyOutcome::Retry(retry) => {
                socket
                    .send_to(&retry, server)
                    .await
                    .map_err(tungo_transport::TransportError::Io)?;
            }
        }
    }
}
