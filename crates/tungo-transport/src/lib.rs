//! Network transport layer for TunGo.
//!
//! Abstracts the three supported outer transports behind a single framed
//! reader/writer pair so the session workers never care what carries their
//! ciphertext:
//!
//! - **TCP**: 4-byte big-endian length prefix per frame
//! - **UDP**: one datagram = one frame, fed per session by the dispatcher
//! - **WebSocket**: one binary message = one frame
//!
//! Also defines the [`tun::TunDevice`] interface the core consumes; creating
//! a real OS device is platform glue that lives outside this workspace.

pub mod framing;
pub mod tcp;
pub mod transport;
pub mod tun;
pub mod udp;
pub mod ws;

pub use transport::{FrameReader, FrameWriter, FramedPair, TransportError, TransportKind};
pub use tun::{InMemoryTun, TunDevice, TunHandle};
