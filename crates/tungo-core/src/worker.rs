//! Per-session data-plane pipelines.
//!
//! Each session runs two tasks over reusable MTU-sized buffers:
//!
//! - **Inbound** (transport → TUN): read a frame, open it in place, then
//!   dispatch - service frames to the control handler, IP packets through
//!   the AllowedIPs ingress filter to the TUN.
//! - **Outbound** (TUN → transport): drain the session queue, seal in
//!   place, write. The same task drives keepalives and the rekey timers,
//!   so the send half of the crypto state never needs a lock.
//!
//! Drops mutate counters and keep the loop running; fatal transport errors
//! cancel the sibling pipeline and report to the table exactly once (the
//! table's remove is idempotent).

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crossbeam_queue::ArrayQueue;
use ipnet::IpNet;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use tungo_crypto::aead::{NONCE_LEN, TAG_LEN};
use tungo_crypto::{CryptoError, RecvState, SendState};
use tungo_transport::tun::TunDevice;
use tungo_transport::{FrameReader, FrameWriter};

use crate::ip;
use crate::metrics::Counters;
use crate::rekey::{RekeyMachine, TickAction};
use crate::service::{self, ServiceFrame};
use crate::session::{OutboundItem, Session};
use crate::table::SessionTable;

/// Shared pool of packet-sized buffers for the TUN demux fan-out.
pub struct PacketPool {
    queue: ArrayQueue<Vec<u8>>,
    buf_capacity: usize,
}

impl PacketPool {
    /// A pool of `slots` buffers of `buf_capacity` bytes each.
    #[must_use]
    pub fn new(slots: usize, buf_capacity: usize) -> Self {
        Self {
            queue: ArrayQueue::new(slots),
            buf_capacity,
        }
    }

    /// Take a cleared buffer, allocating if the pool is dry.
    #[must_use]
    pub fn get(&self) -> Vec<u8> {
        self.queue
            .pop()
            .unwrap_or_else(|| Vec::with_capacity(self.buf_capacity))
    }

    /// Return a buffer; dropped silently when the pool is full.
    pub fn put(&self, mut buf: Vec<u8>) {
        buf.clear();
        let _ = self.queue.push(buf);
    }
}

/// Everything both pipelines share.
#[derive(Clone)]
pub struct WorkerContext {
    /// The session these pipelines serve.
    pub session: Arc<Session>,
    /// For teardown reporting.
    pub table: Arc<SessionTable>,
    /// Drop counters.
    pub counters: Arc<Counters>,
    /// Where inbound packets go.
    pub tun: Arc<dyn TunDevice>,
    /// Shared rekey state machine; locked briefly, never across awaits.
    pub rekey: Arc<Mutex<RekeyMachine>>,
    /// Data-plane MTU.
    pub mtu: usize,
    /// Keepalive interval for stream transports; `None` on UDP.
    pub keepalive: Option<Duration>,
    /// Documentation ranges that divert to the service handler.
    pub doc_ranges: Vec<IpNet>,
    /// Buffer pool shared with the TUN demux.
    pub pool: Arc<PacketPool>,
    /// Where MTU probe acks are delivered (client-side prober).
    pub mtu_acks: Option<mpsc::Sender<u16>>,
}

impl WorkerContext {
    fn teardown(&self) {
        self.session.cancel.cancel();
        if self.table.remove(self.session.id).is_some() {
            debug!(
                session = self.session.id,
                peer = %self.session.fingerprint,
                "session removed"
            );
        }
    }
}

/// Inbound pipeline: transport → TUN.
pub async fn run_inbound(ctx: WorkerContext, mut reader: Box<dyn FrameReader>, mut recv: RecvState) {
    let mut buf = vec![0u8; NONCE_LEN + ctx.mtu + TAG_LEN];
    loop {
        let n = tokio::select! {
            () = ctx.session.cancel.cancelled() => break,
            res = reader.read_frame(&mut buf) => match res {
                Ok(n) => n,
                Err(e) if e.is_fatal() => {
                    trace!(session = ctx.session.id, error = %e, "inbound transport fatal");
                    break;
                }
                Err(_) => continue,
            },
        };

        let opened = match recv.open(&mut buf[..n]) {
            Ok(opened) => opened,
            Err(CryptoError::ReplayDetected) => {
                Counters::bump(&ctx.counters.replay_drop);
                continue;
            }
            Err(_) => {
                Counters::bump(&ctx.counters.auth_fail);
                continue;
            }
        };
        ctx.session.touch();
        if opened.committed {
            Counters::bump(&ctx.counters.rekey_ok);
            trace!(session = ctx.session.id, epoch = opened.epoch, "receive epoch committed");
        }

        let plaintext: &[u8] = opened.plaintext;
        match ServiceFrame::decode(plaintext) {
            Some(Some(frame)) => {
                if !handle_service(&ctx, &mut recv, frame) {
                    break;
                }
            }
            Some(None) => Counters::bump(&ctx.counters.malformed_drop),
            None => match ip::parse(plaintext) {
                None => Counters::bump(&ctx.counters.malformed_drop),
                Some(header) => {
                    if service::is_doc_addressed(&header, &ctx.doc_ranges) {
                        Counters::bump(&ctx.counters.service_diverted);
                    } else if !ctx.session.allows_inner_src(header.src) {
                        Counters::bump(&ctx.counters.policy_drop);
                    } else if ctx.tun.write_packet(plaintext).await.is_err() {
                        break;
                    }
                }
            },
        }
    }
    ctx.teardown();
}

// Returns false when the session must die.
fn handle_service(ctx: &WorkerContext, recv: &mut RecvState, frame: ServiceFrame) -> bool {
    match frame {
        ServiceFrame::Ping => {
            let _ = ctx.session.enqueue_service(&ServiceFrame::Pong);
            true
        }
        ServiceFrame::Pong => true,
        ServiceFrame::RekeyInit { ephemeral } => {
            let result = {
                let mut machine = ctx.rekey.lock().expect("rekey lock poisoned");
                machine.on_init(&ephemeral)
            };
            match result {
                Ok(Some((keys, our_ephemeral))) => {
                    recv.install_pending(&keys.recv_key, keys.epoch);
                    let _ = ctx.session.enqueue_service(&ServiceFrame::RekeyAck {
                        ephemeral: our_ephemeral,
                    });
                    let _ = ctx.session.enqueue_install_send(keys.epoch, keys.send_key);
                    true
                }
                Ok(None) => true,
                Err(_) => {
                    Counters::bump(&ctx.counters.rekey_fail);
                    let _ = ctx.session.enqueue_service(&ServiceFrame::EpochExhausted);
                    false
                }
            }
        }
        ServiceFrame::RekeyAck { ephemeral } => {
            let result = {
                let mut machine = ctx.rekey.lock().expect("rekey lock poisoned");
                machine.on_ack(&ephemeral)
            };
            match result {
                Ok(Some(keys)) => {
                    recv.install_pending(&keys.recv_key, keys.epoch);
                    let _ = ctx.session.enqueue_install_send(keys.epoch, keys.send_key);
                    true
                }
                Ok(None) => true,
                Err(_) => {
                    Counters::bump(&ctx.counters.rekey_fail);
                    false
                }
            }
        }
        ServiceFrame::EpochExhausted => {
            Counters::bump(&ctx.counters.rekey_fail);
            false
        }
        ServiceFrame::MtuProbe { size } => {
            let _ = ctx.session.enqueue_service(&ServiceFrame::MtuAck { size });
            true
        }
        ServiceFrame::MtuAck { size } => {
            if let Some(tx) = &ctx.mtu_acks {
                let _ = tx.try_send(size);
            }
            true
        }
    }
}

enum WriteResult {
    Sent,
    Dropped,
    Fatal,
}

async fn seal_and_write(
    ctx: &WorkerContext,
    writer: &mut Box<dyn FrameWriter>,
    send: &mut SendState,
    buf: &mut [u8],
    payload: &[u8],
) -> WriteResult {
    if payload.len() > ctx.mtu {
        Counters::bump(&ctx.counters.malformed_drop);
        return WriteResult::Dropped;
    }
    buf[NONCE_LEN..NONCE_LEN + payload.len()].copy_from_slice(payload);
    match send.seal_next(buf, payload.len()) {
        Ok(len) => match writer.write_frame(&buf[..len]).await {
            Ok(()) => WriteResult::Sent,
            Err(e) if e.is_fatal() => WriteResult::Fatal,
            Err(_) => WriteResult::Dropped,
        },
        Err(CryptoError::CounterExhausted) => {
            // Sends stay blocked until the counter-threshold trigger
            // rotates the epoch; the machine being dead means no rotation
            // is coming and the session is over.
            let dead = ctx.rekey.lock().expect("rekey lock poisoned").is_dead();
            if dead { WriteResult::Fatal } else { WriteResult::Dropped }
        }
        Err(_) => WriteResult::Dropped,
    }
}

/// Outbound pipeline: TUN → transport, plus keepalive and rekey timers.
pub async fn run_outbound(
    ctx: WorkerContext,
    mut writer: Box<dyn FrameWriter>,
    mut send: SendState,
    mut queue: mpsc::Receiver<OutboundItem>,
) {
    let mut buf = vec![0u8; NONCE_LEN + ctx.mtu + TAG_LEN];
    let mut tick = tokio::time::interval(Duration::from_secs(1));
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut last_send = Instant::now();

    'outer: loop {
        tokio::select! {
            () = ctx.session.cancel.cancelled() => break,
            item = queue.recv() => {
                let Some(item) = item else { break };
                match item {
                    OutboundItem::Packet(packet) => {
                        let result =
                            seal_and_write(&ctx, &mut writer, &mut send, &mut buf, &packet).await;
                        ctx.pool.put(packet);
                        match result {
                            WriteResult::Sent => last_send = Instant::now(),
                            WriteResult::Dropped => {}
                            WriteResult::Fatal => break,
                        }
                    }
                    OutboundItem::Service(frame) => {
                        match seal_and_write(&ctx, &mut writer, &mut send, &mut buf, &frame).await {
                            WriteResult::Sent => last_send = Instant::now(),
                            WriteResult::Dropped => {}
                            WriteResult::Fatal => break,
                        }
                    }
                    OutboundItem::InstallSend { epoch, key } => {
                        send.install(&key, epoch);
                        trace!(session = ctx.session.id, epoch, "send epoch installed");
                    }
                }
            }
            _ = tick.tick() => {
                if let Some(interval) = ctx.keepalive {
                    if last_send.elapsed() >= interval {
                        let ping = ServiceFrame::Ping.encode();
                        match seal_and_write(&ctx, &mut writer, &mut send, &mut buf, &ping).await {
                            WriteResult::Sent => last_send = Instant::now(),
                            WriteResult::Dropped => {}
                            WriteResult::Fatal => break,
                        }
                    }
                }

                // Rekey triggers and timers run here so the send counter is
                // always coherent with the machine's view.
                let frames = {
                    let mut machine = ctx.rekey.lock().expect("rekey lock poisoned");
                    if machine.should_initiate(send.counter(), send.bytes()) {
                        match machine.initiate() {
                            Ok(ephemeral) => vec![ServiceFrame::RekeyInit { ephemeral }],
                            Err(_) => {
                                Counters::bump(&ctx.counters.rekey_fail);
                                vec![ServiceFrame::EpochExhausted]
                            }
                        }
                    } else {
                        match machine.on_tick(Instant::now()) {
                            TickAction::None => vec![],
                            TickAction::Resend(ephemeral) => {
                                vec![ServiceFrame::RekeyInit { ephemeral }]
                            }
                            TickAction::Failed => {
                                Counters::bump(&ctx.counters.rekey_fail);
                                vec![]
                            }
                            TickAction::Dead => {
                                Counters::bump(&ctx.counters.rekey_fail);
                                vec![ServiceFrame::EpochExhausted]
                            }
                        }
                    }
                };
                let mut fatal_after = false;
                for frame in &frames {
                    if matches!(frame, ServiceFrame::EpochExhausted) {
                        fatal_after = true;
                    }
                    let encoded = frame.encode();
                    match seal_and_write(&ctx, &mut writer, &mut send, &mut buf, &encoded).await {
                        WriteResult::Sent => last_send = Instant::now(),
                        WriteResult::Dropped => {}
                        WriteResult::Fatal => break 'outer,
                    }
                }
                if fatal_after {
                    break;
                }
            }
        }
    }
    writer.close().await;
    ctx.teardown();
}
