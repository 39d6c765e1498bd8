//! TCP transport: length-prefixed frames over a `TcpStream`.

use std::time::Duration;

use async_trait::async_trait;
use socket2::{SockRef, TcpKeepalive};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};

use crate::framing;
use crate::transport::{
    FrameReader, FrameWriter, FramedPair, TransportKind, TransportResult,
};

/// Read half of a framed TCP connection.
pub struct TcpFrameReader {
    half: OwnedReadHalf,
    max_frame: usize,
}

#[async_trait]
impl FrameReader for TcpFrameReader {
    async fn read_frame(&mut self, buf: &mut [u8]) -> TransportResult<usize> {
        framing::read_frame(&mut self.half, buf, self.max_frame).await
    }
}

/// Write half of a framed TCP connection.
pub struct TcpFrameWriter {
    half: OwnedWriteHalf,
}

#[async_trait]
impl FrameWriter for TcpFrameWriter {
    async fn write_frame(&mut self, frame: &[u8]) -> TransportResult<()> {
        framing::write_frame(&mut self.half, frame).await
    }

    async fn close(&mut self) {
        use tokio::io::AsyncWriteExt;
        let _ = self.half.shutdown().await;
    }
}

/// Enable TCP keepalive probes on an accepted or connected stream.
///
/// # Errors
///
/// Propagates the socket option error.
pub fn set_keepalive(stream: &TcpStream, interval: Duration) -> std::io::Result<()> {
    let keepalive = TcpKeepalive::new().with_time(interval);
    SockRef::from(stream).set_tcp_keepalive(&keepalive)
}

/// Split a connected stream into a [`FramedPair`].
///
/// # Errors
///
/// Fails only if the peer address cannot be read.
pub fn framed_pair(stream: TcpStream, max_frame: usize) -> std::io::Result<FramedPair> {
    let remote = stream.peer_addr()?;
    let (read, write) = stream.into_split();
    Ok(FramedPair {
        reader: Box::new(TcpFrameReader {
            half: read,
            max_frame,
        }),
        writer: Box::new(TcpFrameWriter { half: write }),
        remote,
        kind: TransportKind::Tcp,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn frames_cross_a_real_socket() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let client = tokio::spawn(async move {
            let stream = TcpStream::connect(addr).await.unwrap();
            let mut pair = framed_pair(stream, 2048).unwrap();
            pair.writer.write_frame(&[0x55; 100]).await.unwrap();
            let mut buf = [0u8; 2048];
            let n = pair.reader.read_frame(&mut buf).await.unwrap();
            buf[..n].to_vec()
        });

        let (stream, _) = listener.accept().await.unwrap();
        set_keepalive(&stream, Duration::from_secs(30)).unwrap();
        let mut pair = framed_pair(stream, 2048).unwrap();

        let mut buf = [0u8; 2048];
        let n = pair.reader.read_frame(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], &[0x55; 100][..]);
        pair.writer.write_frame(&[0x66; 64]).await.unwrap();

        let echoed = client.await.unwrap();
        assert_eq!(echoed, vec![0x66; 64]);
    }

    #[tokio::test]
    async fn peer_disconnect_reads_closed() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let client = TcpStream::connect(addr).await.unwrap();
        let (stream, _) = listener.accept().await.unwrap();
        drop(client);

        let mut pair = framed_pair(stream, 2048).unwrap();
        let mut buf = [0u8; 2048];
        assert!(matches!(
            pair.reader.read_frame(&mut buf).await,
            Err(crate::transport::TransportError::Closed)
        ));
    }
}
