//! Path-MTU probing over service frames.
//!
//! Client-side subsystem: binary-search the largest probe that comes back
//! acknowledged. Probes are `MtuProbe` service frames padded to the probed
//! size and addressed to the peer's service handler, so they ride the
//! encrypted data plane but never reach a real TUN.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::timeout;

use crate::service::ServiceFrame;
use crate::session::Session;

/// Smallest plaintext worth probing.
pub const PROBE_FLOOR: u16 = 256;

/// One probe's ack deadline.
pub const PROBE_TIMEOUT: Duration = Duration::from_millis(500);

async fn wait_for_ack(acks: &mut mpsc::Receiver<u16>, want: u16) -> bool {
    while let Some(size) = acks.recv().await {
        if size == want {
            return true;
        }
        // Acks for earlier probes are stale; keep draining.
    }
    false
}

/// Find the largest deliverable plaintext size in `[floor, ceiling]`.
///
/// Returns `floor` when even the smallest probe goes unanswered; the
/// caller should treat that as "path MTU unknown, keep the configured
/// value".
pub async fn probe_path_mtu(
    session: &Session,
    acks: &mut mpsc::Receiver<u16>,
    floor: u16,
    ceiling: u16,
) -> u16 {
    let mut lo = u32::from(floor);
    let mut hi = u32::from(ceiling);
    let mut best = floor;

    while lo <= hi {
        let mid = u32::midpoint(lo, hi);
        let size = mid as u16;
        if !session.enqueue_service(&ServiceFrame::MtuProbe { size }) {
            break;
        }
        match timeout(PROBE_TIMEOUT, wait_for_ack(acks, size)).await {
            Ok(true) => {
                best = size;
                lo = mid + 1;
            }
            _ => {
                if mid == 0 {
                    break;
                }
                hi = mid - 1;
            }
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tungo_crypto::noise::Role;
    use tungo_transport::TransportKind;

    use crate::session::OutboundItem;

    fn probing_session() -> (Arc<Session>, tokio::sync::mpsc::Receiver<OutboundItem>) {
        Session::new(
            1,
            [1; 32],
            [0; 32],
            "10.8.0.2".parse().unwrap(),
            vec!["0.0.0.0/0".parse().unwrap()],
            "203.0.113.1:40000".parse().unwrap(),
            TransportKind::Udp,
            Role::Initiator,
            None,
        )
    }

    // Simulates a path that delivers every probe at or below `path_mtu`.
    async fn answer_probes(
        mut outbound: tokio::sync::mpsc::Receiver<OutboundItem>,
        acks: mpsc::Sender<u16>,
        path_mtu: u16,
    ) {
        while let Some(item) = outbound.recv().await {
            if let OutboundItem::Service(bytes) = item {
                if let Some(Some(ServiceFrame::MtuProbe { size })) = ServiceFrame::decode(&bytes) {
                    if size <= path_mtu {
                        let _ = acks.send(size).await;
                    }
                }
            }
        }
    }

    #[tokio::test]
    async fn converges_on_the_path_mtu() {
        let (session, outbound) = probing_session();
        let (ack_tx, mut ack_rx) = mpsc::channel(16);
        let responder = tokio::spawn(answer_probes(outbound, ack_tx, 1380));

        let found = probe_path_mtu(&session, &mut ack_rx, PROBE_FLOOR, 1500).await;
        assert_eq!(found, 1380);
        drop(session);
        responder.abort();
    }

    #[tokio::test]
    async fn silent_path_returns_floor() {
        let (session, _outbound) = probing_session();
        let (_ack_tx, mut ack_rx) = mpsc::channel::<u16>(1);
        let found = probe_path_mtu(&session, &mut ack_rx, PROBE_FLOOR, 512).await;
        assert_eq!(found, PROBE_FLOOR);
    }
}
