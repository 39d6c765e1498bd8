//! The TUN device seam.
//!
//! The core only ever sees this trait: read an IP packet, write an IP
//! packet, report the MTU. Creating and tearing down a real OS device (and
//! the firewall rules around it) is platform glue that lives outside this
//! workspace.
//!
//! [`InMemoryTun`] is the channel-backed implementation used by the test
//! suite and by loopback serving: packets written by the server surface on
//! the paired [`TunHandle`], and packets injected through the handle come
//! out of `read_packet`.

use std::io;

use async_trait::async_trait;
use tokio::sync::{Mutex, mpsc};

/// A virtual network interface delivering whole IP packets.
#[async_trait]
pub trait TunDevice: Send + Sync {
    /// Read the next IP packet into `buf`, returning its length.
    ///
    /// # Errors
    ///
    /// An error means the device is gone; the server shuts down.
    async fn read_packet(&self, buf: &mut [u8]) -> io::Result<usize>;

    /// Write one IP packet to the device.
    ///
    /// # Errors
    ///
    /// An error means the device is gone.
    async fn write_packet(&self, packet: &[u8]) -> io::Result<()>;

    /// The device MTU; bounds every data-plane payload.
    fn mtu(&self) -> usize;
}

/// Channel-backed TUN for tests and loopback serving.
pub struct InMemoryTun {
    incoming: Mutex<mpsc::Receiver<Vec<u8>>>,
    outgoing: mpsc::Sender<Vec<u8>>,
    mtu: usize,
}

/// Test-side handle to an [`InMemoryTun`].
pub struct TunHandle {
    /// Inject a packet for the device owner to read.
    pub inject: mpsc::Sender<Vec<u8>>,
    /// Receive packets the device owner wrote.
    pub written: mpsc::Receiver<Vec<u8>>,
}

impl InMemoryTun {
    /// Create a device and its paired handle.
    #[must_use]
    pub fn pair(mtu: usize, capacity: usize) -> (Self, TunHandle) {
        let (inject_tx, inject_rx) = mpsc::channel(capacity);
        let (written_tx, written_rx) = mpsc::channel(capacity);
        (
            Self {
                incoming: Mutex::new(inject_rx),
                outgoing: written_tx,
                mtu,
            },
            TunHandle {
                inject: inject_tx,
                written: written_rx,
            },
        )
    }
}

#[async_trait]
impl TunDevice for InMemoryTun {
    async fn read_packet(&self, buf: &mut [u8]) -> io::Result<usize> {
        let mut incoming = self.incoming.lock().await;
        loop {
            let packet = incoming
                .recv()
                .await
                .ok_or_else(|| io::Error::new(io::ErrorKind::UnexpectedEof, "tun closed"))?;
            // Oversized packets are dropped, as a real device would refuse
            // to deliver past its MTU.
            if packet.len() > buf.len() {
                continue;
            }
            buf[..packet.len()].copy_from_slice(&packet);
            return Ok(packet.len());
        }
    }

    async fn write_packet(&self, packet: &[u8]) -> io::Result<()> {
        self.outgoing
            .send(packet.to_vec())
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "tun handle dropped"))
    }

    fn mtu(&self) -> usize {
        self.mtu
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn inject_then_read() {
        let (tun, handle) = InMemoryTun::pair(1420, 16);
        handle.inject.send(vec![0x45, 0, 0, 20]).await.unwrap();

        let mut buf = [0u8; 1500];
        let n = tun.read_packet(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], &[0x45, 0, 0, 20]);
    }

    #[tokio::test]
    async fn write_then_observe() {
        let (tun, mut handle) = InMemoryTun::pair(1420, 16);
        tun.write_packet(&[0x60, 1, 2, 3]).await.unwrap();
        assert_eq!(handle.written.recv().await.unwrap(), vec![0x60, 1, 2, 3]);
    }

    #[tokio::test]
    async fn closed_handle_errors_reads() {
        let (tun, handle) = InMemoryTun::pair(1420, 16);
        drop(handle.inject);
        let mut buf = [0u8; 64];
        assert!(tun.read_packet(&mut buf).await.is_err());
    }
}
