//! WebSocket transport: one binary message = one frame.
//!
//! tungstenite reassembles fragmented messages before delivering them, so a
//! frame always arrives whole no matter how the peer chunked it. Text
//! messages are skipped; ping/pong control frames are answered by the
//! library during reads and never surface here.

use std::net::SocketAddr;

use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};

use crate::framing::MIN_FRAME_LEN;
use crate::transport::{
    FrameReader, FrameWriter, FramedPair, TransportError, TransportKind, TransportResult,
};

fn map_ws_err(e: WsError) -> TransportError {
    match e {
        WsError::ConnectionClosed | WsError::AlreadyClosed => TransportError::Closed,
        WsError::Io(io) => TransportError::Io(io),
        other => TransportError::Other(other.to_string()),
    }
}

/// Read half of a framed WebSocket connection.
pub struct WsFrameReader<S> {
    stream: SplitStream<WebSocketStream<S>>,
    max_frame: usize,
}

#[async_trait]
impl<S> FrameReader for WsFrameReader<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn read_frame(&mut self, buf: &mut [u8]) -> TransportResult<usize> {
        loop {
            let msg = match self.stream.next().await {
                None => return Err(TransportError::Closed),
                Some(Err(e)) => return Err(map_ws_err(e)),
                Some(Ok(msg)) => msg,
            };
            match msg {
                Message::Binary(data) => {
                    if data.len() > self.max_frame || data.len() > buf.len() {
                        return Err(TransportError::FrameTooLarge {
                            len: data.len(),
                            max: self.max_frame,
                        });
                    }
                    if data.len() < MIN_FRAME_LEN {
                        return Err(TransportError::Malformed("length below frame minimum"));
                    }
                    buf[..data.len()].copy_from_slice(&data);
                    return Ok(data.len());
                }
                Message::Close(_) => return Err(TransportError::Closed),
                // Text and control frames are not part of the protocol.
                _ => continue,
            }
        }
    }
}

/// Write half of a framed WebSocket connection.
pub struct WsFrameWriter<S> {
    sink: SplitSink<WebSocketStream<S>, Message>,
}

#[async_trait]
impl<S> FrameWriter for WsFrameWriter<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn write_frame(&mut self, frame: &[u8]) -> TransportResult<()> {
        self.sink
            .send(Message::binary(frame.to_vec()))
            .await
            .map_err(map_ws_err)
    }

    async fn close(&mut self) {
        let _ = self.sink.send(Message::Close(None)).await;
        let _ = self.sink.close().await;
    }
}

/// Split an accepted or connected WebSocket into a [`FramedPair`].
#[must_use]
pub fn framed_pair<S>(ws: WebSocketStream<S>, remote: SocketAddr, max_frame: usize) -> FramedPair
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (sink, stream) = ws.split();
    FramedPair {
        reader: Box::new(WsFrameReader { stream, max_frame }),
        writer: Box::new(WsFrameWriter { sink }),
        remote,
        kind: TransportKind::WebSocket,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::{TcpListener, TcpStream};
    use tokio_tungstenite::{accept_async, client_async};

    async fn ws_pair() -> (FramedPair, FramedPair) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let client = tokio::spawn(async move {
            let stream = TcpStream::connect(addr).await.unwrap();
            let (ws, _) = client_async(format!("ws://{addr}/"), stream).await.unwrap();
            framed_pair(ws, addr, 4096)
        });

        let (stream, peer) = listener.accept().await.unwrap();
        let ws = accept_async(stream).await.unwrap();
        let server = framed_pair(ws, peer, 4096);
        (client.await.unwrap(), server)
    }

    #[tokio::test]
    async fn binary_messages_cross() {
        let (mut client, mut server) = ws_pair().await;
        client.writer.write_frame(&[0x11; 200]).await.unwrap();

        let mut buf = [0u8; 4096];
        let n = server.reader.read_frame(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], &[0x11; 200][..]);

        server.writer.write_frame(&[0x22; 64]).await.unwrap();
        let n = client.reader.read_frame(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], &[0x22; 64][..]);
    }

    #[tokio::test]
    async fn close_surfaces_as_closed() {
        let (mut client, mut server) = ws_pair().await;
        client.writer.close().await;

        let mut buf = [0u8; 4096];
        assert!(matches!(
            server.reader.read_frame(&mut buf).await,
            Err(TransportError::Closed)
        ));
    }

    #[tokio::test]
    async fn undersized_binary_is_malformed() {
        let (mut client, mut server) = ws_pair().await;
        client.writer.write_frame(&[0x33; 4]).await.unwrap();

        let mut buf = [0u8; 4096];
        assert!(matches!(
            server.reader.read_frame(&mut buf).await,
            Err(TransportError::Malformed(_))
        ));
    }
}
