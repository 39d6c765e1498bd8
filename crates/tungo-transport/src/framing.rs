//! Length-prefixed stream framing.
//!
//! Stream transports carry each frame as a 4-byte big-endian length followed
//! by that many bytes of ciphertext. The length is validated against the
//! session's frame ceiling before a single payload byte is read, so a
//! malicious length cannot drive allocation or blocking reads.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::transport::{TransportError, TransportResult};

/// Size of the length prefix.
pub const LEN_PREFIX: usize = 4;

/// No real frame is smaller than the AEAD overhead of an empty payload.
pub const MIN_FRAME_LEN: usize = 28;

fn map_read_err(e: std::io::Error) -> TransportError {
    if e.kind() == std::io::ErrorKind::UnexpectedEof {
        // Mid-frame EOF and clean EOF are both fatal for the session.
        TransportError::Closed
    } else {
        TransportError::Io(e)
    }
}

/// Read one length-prefixed frame into `buf`.
///
/// # Errors
///
/// `Closed` on EOF (clean or mid-frame), `Malformed` for a length below the
/// frame minimum, `FrameTooLarge` for a length above `max_len`.
pub async fn read_frame<R>(reader: &mut R, buf: &mut [u8], max_len: usize) -> TransportResult<usize>
where
    R: AsyncRead + Unpin + Send,
{
    let mut prefix = [0u8; LEN_PREFIX];
    reader.read_exact(&mut prefix).await.map_err(map_read_err)?;
    let len = u32::from_be_bytes(prefix) as usize;

    if len < MIN_FRAME_LEN {
        return Err(TransportError::Malformed("length below frame minimum"));
    }
    if len > max_len || len > buf.len() {
        return Err(TransportError::FrameTooLarge { len, max: max_len });
    }

    reader
        .read_exact(&mut buf[..len])
        .await
        .map_err(map_read_err)?;
    Ok(len)
}

/// Write one length-prefixed frame.
///
/// `write_all` retries short writes, so the prefix and payload always land
/// completely or the call fails.
///
/// # Errors
///
/// Propagates the underlying I/O error.
pub async fn write_frame<W>(writer: &mut W, frame: &[u8]) -> TransportResult<()>
where
    W: AsyncWrite + Unpin + Send,
{
    let prefix = (frame.len() as u32).to_be_bytes();
    writer.write_all(&prefix).await?;
    writer.write_all(frame).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn frame_of(len: usize) -> Vec<u8> {
        vec![0xAB; len]
    }

    #[tokio::test]
    async fn roundtrip() {
        let payload = frame_of(100);
        let mut wire = Vec::new();
        write_frame(&mut wire, &payload).await.unwrap();
        assert_eq!(wire.len(), LEN_PREFIX + 100);

        let mut buf = [0u8; 256];
        let mut cursor = Cursor::new(wire);
        let n = read_frame(&mut cursor, &mut buf, 256).await.unwrap();
        assert_eq!(&buf[..n], &payload[..]);
    }

    #[tokio::test]
    async fn rejects_undersized_length() {
        let mut wire = Vec::new();
        write_frame(&mut wire, &frame_of(MIN_FRAME_LEN - 1))
            .await
            .unwrap();
        let mut buf = [0u8; 256];
        let mut cursor = Cursor::new(wire);
        assert!(matches!(
            read_frame(&mut cursor, &mut buf, 256).await,
            Err(TransportError::Malformed(_))
        ));
    }

    #[tokio::test]
    async fn rejects_oversized_length() {
        let mut wire = Vec::new();
        write_frame(&mut wire, &frame_of(512)).await.unwrap();
        let mut buf = [0u8; 1024];
        let mut cursor = Cursor::new(wire);
        assert!(matches!(
            read_frame(&mut cursor, &mut buf, 256).await,
            Err(TransportError::FrameTooLarge { len: 512, max: 256 })
        ));
    }

    #[tokio::test]
    async fn premature_eof_is_closed() {
        let payload = frame_of(100);
        let mut wire = Vec::new();
        write_frame(&mut wire, &payload).await.unwrap();
        wire.truncate(LEN_PREFIX + 50);

        let mut buf = [0u8; 256];
        let mut cursor = Cursor::new(wire);
        assert!(matches!(
            read_frame(&mut cursor, &mut buf, 256).await,
            Err(TransportError::Closed)
        ));
    }

    #[tokio::test]
    async fn clean_eof_is_closed() {
        let mut buf = [0u8; 256];
        let mut cursor = Cursor::new(Vec::new());
        assert!(matches!(
            read_frame(&mut cursor, &mut buf, 256).await,
            Err(TransportError::Closed)
        ));
    }
}
