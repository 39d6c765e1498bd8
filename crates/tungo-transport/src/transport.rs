//! Transport trait abstraction over the framed transports.
//!
//! A session owns two independent pipelines, so the read and write
//! capabilities are separate traits: the inbound task holds the
//! [`FrameReader`], the outbound task holds the [`FrameWriter`]. The
//! dispatcher hands both out together as a [`FramedPair`] after the
//! handshake.

use async_trait::async_trait;
use std::io;
use std::net::SocketAddr;

/// Which outer transport carries a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    /// Length-prefixed frames over TCP.
    Tcp,
    /// Raw datagrams over the shared UDP socket.
    Udp,
    /// Binary WebSocket messages.
    WebSocket,
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Tcp => write!(f, "tcp"),
            Self::Udp => write!(f, "udp"),
            Self::WebSocket => write!(f, "ws"),
        }
    }
}

/// Transport layer errors.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// I/O error from the underlying socket.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Peer closed the connection (or the feeding channel was dropped).
    #[error("transport closed")]
    Closed,

    /// Declared frame length exceeds the negotiated maximum.
    #[error("frame of {len} bytes exceeds limit of {max}")]
    FrameTooLarge {
        /// Declared length.
        len: usize,
        /// Maximum allowed.
        max: usize,
    },

    /// Frame violates the wire format.
    #[error("malformed frame: {0}")]
    Malformed(&'static str),

    /// A bounded write did not complete in time.
    #[error("write deadline exceeded")]
    WriteTimeout,

    /// Transport-specific failure.
    #[error("transport error: {0}")]
    Other(String),
}

impl TransportError {
    /// Whether the session must be torn down, as opposed to retrying the
    /// loop iteration.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::Io(e) => !matches!(
                e.kind(),
                io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted
            ),
            Self::WriteTimeout => false,
            Self::Closed | Self::FrameTooLarge { .. } | Self::Malformed(_) | Self::Other(_) => true,
        }
    }
}

/// Result type for transport operations.
pub type TransportResult<T> = Result<T, TransportError>;

/// Receiving capability of a framed transport.
#[async_trait]
pub trait FrameReader: Send {
    /// Read the next complete frame into `buf`, returning its length.
    ///
    /// Blocks until a whole frame is available. Oversized input is an
    /// error for stream transports and silently skipped for datagram
    /// transports (a later datagram may still be well-formed).
    ///
    /// # Errors
    ///
    /// Returns `Closed` on EOF and `Malformed`/`FrameTooLarge` on framing
    /// violations; both are fatal for the session.
    async fn read_frame(&mut self, buf: &mut [u8]) -> TransportResult<usize>;
}

/// Sending capability of a framed transport.
#[async_trait]
pub trait FrameWriter: Send {
    /// Write one complete frame. Partial writes never escape this call.
    ///
    /// # Errors
    ///
    /// Returns `WriteTimeout` (transient) when a send deadline lapses, or a
    /// fatal error when the transport is gone.
    async fn write_frame(&mut self, frame: &[u8]) -> TransportResult<()>;

    /// Close the transport. Best-effort; errors are swallowed.
    async fn close(&mut self);
}

/// Both halves of a connected, framed transport.
pub struct FramedPair {
    /// Inbound half, owned by the session's inbound pipeline.
    pub reader: Box<dyn FrameReader>,
    /// Outbound half, owned by the session's outbound pipeline.
    pub writer: Box<dyn FrameWriter>,
    /// The peer's outer address.
    pub remote: SocketAddr,
    /// Which transport this is.
    pub kind: TransportKind,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fatal_classification() {
        assert!(TransportError::Closed.is_fatal());
        assert!(
            TransportError::Malformed("length below frame minimum").is_fatal()
        );
        assert!(TransportError::FrameTooLarge { len: 9000, max: 1500 }.is_fatal());
        assert!(!TransportError::WriteTimeout.is_fatal());
        assert!(
            !TransportError::Io(io::Error::new(io::ErrorKind::TimedOut, "slow")).is_fatal()
        );
        assert!(
            TransportError::Io(io::Error::new(io::ErrorKind::BrokenPipe, "gone")).is_fatal()
        );
    }

    #[test]
    fn kind_display() {
        assert_eq!(TransportKind::Tcp.to_string(), "tcp");
        assert_eq!(TransportKind::Udp.to_string(), "udp");
        assert_eq!(TransportKind::WebSocket.to_string(), "ws");
    }
}
