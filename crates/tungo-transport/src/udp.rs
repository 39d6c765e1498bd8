//! UDP transport: one datagram = one frame, no prefix.
//!
//! All sessions share the server's single socket, so the dispatcher owns
//! the receive loop and routes each datagram to its session by source
//! address. A session's reader is therefore a bounded channel fed by the
//! dispatcher; its writer sends straight to the peer address recorded at
//! handshake time, which never changes (rebinding requires a fresh
//! handshake).

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;

use crate::transport::{
    FrameReader, FrameWriter, FramedPair, TransportError, TransportKind, TransportResult,
};

/// Default write deadline on the shared socket.
pub const WRITE_DEADLINE: Duration = Duration::from_secs(2);

/// Frames queued per session before the dispatcher starts dropping.
pub const INBOUND_QUEUE: usize = 256;

/// Session-side reader over the dispatcher-fed datagram queue.
pub struct UdpFrameReader {
    rx: mpsc::Receiver<Vec<u8>>,
}

#[async_trait]
impl FrameReader for UdpFrameReader {
    async fn read_frame(&mut self, buf: &mut [u8]) -> TransportResult<usize> {
        loop {
            let datagram = self.rx.recv().await.ok_or(TransportError::Closed)?;
            if datagram.len() > buf.len() {
                // Oversized datagrams are dropped, not fatal.
                continue;
            }
            buf[..datagram.len()].copy_from_slice(&datagram);
            return Ok(datagram.len());
        }
    }
}

/// Session-side writer over the shared socket.
pub struct UdpFrameWriter {
    socket: Arc<UdpSocket>,
    peer: SocketAddr,
    deadline: Duration,
}

#[async_trait]
impl FrameWriter for UdpFrameWriter {
    async fn write_frame(&mut self, frame: &[u8]) -> TransportResult<()> {
        match tokio::time::timeout(self.deadline, self.socket.send_to(frame, self.peer)).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(e)) => Err(TransportError::Io(e)),
            Err(_) => Err(TransportError::WriteTimeout),
        }
    }

    async fn close(&mut self) {
        // The socket is shared; nothing to close per session.
    }
}

/// Build a session's framed pair over the shared socket.
///
/// Returns the sender the dispatcher uses to feed inbound datagrams.
#[must_use]
pub fn session_pair(
    socket: Arc<UdpSocket>,
    peer: SocketAddr,
    deadline: Duration,
) -> (mpsc::Sender<Vec<u8>>, FramedPair) {
    let (tx, rx) = mpsc::channel(INBOUND_QUEUE);
    let pair = FramedPair {
        reader: Box::new(UdpFrameReader { rx }),
        writer: Box::new(UdpFrameWriter {
            socket,
            peer,
            deadline,
        }),
        remote: peer,
        kind: TransportKind::Udp,
    };
    (tx, pair)
}
