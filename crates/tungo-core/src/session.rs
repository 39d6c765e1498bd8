//! The runtime session entity.
//!
//! A `Session` is the handle everything else holds: the table owns it, the
//! two worker pipelines and the TUN demux share it. Workers identify it by
//! numeric id, never by reference cycles; teardown always goes through the
//! table.
//!
//! All sending funnels through the bounded outbound queue - data packets
//! from the TUN demux, service replies and rekey control from the inbound
//! worker. The queue is the backpressure point: when it is full the demux
//! drops and counts instead of blocking the whole TUN.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use ipnet::IpNet;
use tokio::sync::{Notify, mpsc};
use tungo_crypto::fingerprint;
use tungo_crypto::noise::Role;
use tungo_transport::TransportKind;

use crate::service::ServiceFrame;

/// Numeric session identifier; allocated by the table.
pub type SessionId = u64;

/// Depth of the per-session outbound queue. Sized to absorb TUN read
/// bursts without handing drops to well-behaved peers.
pub const OUTBOUND_QUEUE: usize = 256;

/// Work items for the outbound pipeline.
pub enum OutboundItem {
    /// An IP packet read from the TUN, to be sealed and sent.
    Packet(Vec<u8>),
    /// An encoded service frame, to be sealed and sent.
    Service(Vec<u8>),
    /// Install a new sending key; ordered behind the frames before it so a
    /// rekey ack always leaves under the old epoch.
    InstallSend {
        /// Epoch the key belongs to.
        epoch: u32,
        /// The new sending key.
        key: [u8; 32],
    },
}

/// Cooperative cancellation shared by a session's tasks.
#[derive(Default)]
pub struct CancelFlag {
    cancelled: AtomicBool,
    notify: Notify,
}

impl CancelFlag {
    /// Trip the flag and wake every waiter. Idempotent.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }

    /// Has the flag been tripped?
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Wait until the flag trips.
    pub async fn cancelled(&self) {
        while !self.is_cancelled() {
            let notified = self.notify.notified();
            if self.is_cancelled() {
                break;
            }
            notified.await;
        }
    }
}

fn now_unix_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// One live, authenticated peer channel.
pub struct Session {
    /// Table-allocated id.
    pub id: SessionId,
    /// The peer's static public key (its identity).
    pub peer_public: [u8; 32],
    /// Short log identifier for the peer.
    pub fingerprint: String,
    /// Handshake transcript hash naming this session.
    pub noise_session_id: [u8; 32],
    /// The peer's inner address, copied from its record.
    pub internal_addr: IpAddr,
    /// Prefixes the peer may claim as inner source.
    pub allowed_ips: Vec<IpNet>,
    /// Outer endpoint observed at handshake completion; immutable. For UDP
    /// an authenticated datagram from any other source is dropped.
    pub remote: SocketAddr,
    /// Transport carrying this session.
    pub kind: TransportKind,
    /// Our handshake role; fixes key directions for the session's life.
    pub role: Role,
    /// Cancellation shared by both pipelines.
    pub cancel: CancelFlag,
    /// For UDP sessions: where the dispatcher feeds inbound datagrams.
    pub udp_feed: Option<mpsc::Sender<Vec<u8>>>,
    outbound: mpsc::Sender<OutboundItem>,
    last_activity: AtomicU64,
}

impl Session {
    /// Create the session and its outbound queue.
    #[allow(clippy::too_many_arguments)]
    #[must_use]
    pub fn new(
        id: SessionId,
        peer_public: [u8; 32],
        noise_session_id: [u8; 32],
        internal_addr: IpAddr,
        allowed_ips: Vec<IpNet>,
        remote: SocketAddr,
        kind: TransportKind,
        role: Role,
        udp_feed: Option<mpsc::Sender<Vec<u8>>>,
    ) -> (Arc<Self>, mpsc::Receiver<OutboundItem>) {
        let (tx, rx) = mpsc::channel(OUTBOUND_QUEUE);
        let session = Arc::new(Self {
            id,
            fingerprint: fingerprint(&peer_public),
            peer_public,
            noise_session_id,
            internal_addr,
            allowed_ips,
            remote,
            kind,
            role,
            cancel: CancelFlag::default(),
            udp_feed,
            outbound: tx,
            last_activity: AtomicU64::new(now_unix_secs()),
        });
        (session, rx)
    }

    /// Does this session authorise `src` as an inner source address?
    #[must_use]
    pub fn allows_inner_src(&self, src: IpAddr) -> bool {
        self.allowed_ips.iter().any(|net| net.contains(&src))
    }

    /// Enqueue an IP packet; false means the queue was full and the packet
    /// must be dropped and counted by the caller.
    pub fn enqueue_packet(&self, packet: Vec<u8>) -> bool {
        self.outbound.try_send(OutboundItem::Packet(packet)).is_ok()
    }

    /// Enqueue a service frame.
    pub fn enqueue_service(&self, frame: &ServiceFrame) -> bool {
        self.outbound
            .try_send(OutboundItem::Service(frame.encode()))
            .is_ok()
    }

    /// Enqueue a send-key install; ordered behind everything queued so far.
    pub fn enqueue_install_send(&self, epoch: u32, key: [u8; 32]) -> bool {
        self.outbound
            .try_send(OutboundItem::InstallSend { epoch, key })
            .is_ok()
    }

    /// Stamp activity now.
    pub fn touch(&self) {
        self.last_activity.store(now_unix_secs(), Ordering::Relaxed);
    }

    /// Time since the last stamped activity.
    #[must_use]
    pub fn idle(&self) -> Duration {
        let last = self.last_activity.load(Ordering::Relaxed);
        Duration::from_secs(now_unix_secs().saturating_sub(last))
    }
}
