//! TunGo server core.
//!
//! Everything between the crypto primitives and the operating system: the
//! peer authorisation policy, the session table and its workers, epoch
//! rekeying, handshake drivers with cookie DoS protection, and the
//! dispatcher that ties TUN, listeners, and sessions together.
//!
//! Layering:
//!
//! ```text
//! tungo-cli
//!    └── tungo-core (this crate)
//!           ├── tungo-crypto   (handshake, AEAD, replay)
//!           └── tungo-transport (framed TCP/UDP/WS, TUN seam)
//! ```

pub mod client;
pub mod config;
pub mod dispatcher;
pub mod dos;
pub mod error;
pub mod handshake;
pub mod ip;
pub mod metrics;
pub mod mtu;
pub mod peers;
pub mod rekey;
pub mod service;
pub mod session;
pub mod table;
pub mod worker;

pub use config::{ClientConfig, ClientConfigFile, ServerConfig, ServerConfigFile};
pub use dispatcher::Server;
pub use error::{ConfigError, RejectReason, ServerError};
pub use metrics::{Counters, Snapshot};
pub use peers::{PeerPolicy, PeerRecord, PolicyHandle};
pub use session::{Session, SessionId};
pub use table::SessionTable;
