//! The session table.
//!
//! Authoritative owner of every live session, indexed three ways: by the
//! peer's static key, by its inner address (TUN demux), and - for UDP - by
//! its outer address (datagram attach). Lookups are lock-free DashMap
//! reads; writes happen only at handshake completion, revocation, and
//! teardown.
//!
//! Insertion applies the replace policy: a new session for an
//! already-bound peer key or inner address evicts the old one, which is
//! cancelled and returned to the caller for logging.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use tungo_transport::TransportKind;

use crate::metrics::Counters;
use crate::session::{Session, SessionId};

/// Concurrent session table.
pub struct SessionTable {
    next_id: AtomicU64,
    by_id: DashMap<SessionId, Arc<Session>>,
    by_peer: DashMap<[u8; 32], SessionId>,
    by_inner: DashMap<IpAddr, SessionId>,
    by_outer: DashMap<SocketAddr, SessionId>,
    counters: Arc<Counters>,
}

impl SessionTable {
    /// Empty table.
    #[must_use]
    pub fn new(counters: Arc<Counters>) -> Self {
        Self {
            next_id: AtomicU64::new(1),
            by_id: DashMap::new(),
            by_peer: DashMap::new(),
            by_inner: DashMap::new(),
            by_outer: DashMap::new(),
            counters,
        }
    }

    /// Allocate the next session id.
    #[must_use]
    pub fn allocate_id(&self) -> SessionId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Insert a session, evicting any session already bound to the same
    /// peer key, inner address, or outer address. Evicted sessions are
    /// cancelled; the caller may log them.
    pub fn insert(&self, session: Arc<Session>) -> Vec<Arc<Session>> {
        let mut evicted = Vec::new();
        for id in [
            self.by_peer.get(&session.peer_public).map(|e| *e),
            self.by_inner.get(&session.internal_addr).map(|e| *e),
        ]
        .into_iter()
        .flatten()
        {
            if id != session.id {
                if let Some(old) = self.remove(id) {
                    evicted.push(old);
                }
            }
        }

        self.by_peer.insert(session.peer_public, session.id);
        self.by_inner.insert(session.internal_addr, session.id);
        if session.kind == TransportKind::Udp {
            self.by_outer.insert(session.remote, session.id);
        }
        self.by_id.insert(session.id, session);
        Counters::bump(&self.counters.sessions_active);
        evicted
    }

    /// Attach an inbound datagram to its session by outer address.
    #[must_use]
    pub fn lookup_by_outer(&self, addr: SocketAddr) -> Option<Arc<Session>> {
        let id = *self.by_outer.get(&addr)?;
        self.get(id)
    }

    /// Find the destination session for a TUN packet.
    #[must_use]
    pub fn lookup_by_inner(&self, addr: IpAddr) -> Option<Arc<Session>> {
        let id = *self.by_inner.get(&addr)?;
        self.get(id)
    }

    /// Find a session by the peer's static key.
    #[must_use]
    pub fn lookup_by_peer(&self, key: &[u8; 32]) -> Option<Arc<Session>> {
        let id = *self.by_peer.get(key)?;
        self.get(id)
    }

    /// Fetch by id.
    #[must_use]
    pub fn get(&self, id: SessionId) -> Option<Arc<Session>> {
        self.by_id.get(&id).map(|e| e.clone())
    }

    /// Remove a session. Idempotent: the second call for the same id is a
    /// no-op returning `None`. The session is cancelled on the way out.
    pub fn remove(&self, id: SessionId) -> Option<Arc<Session>> {
        let (_, session) = self.by_id.remove(&id)?;
        session.cancel.cancel();
        // Only clear index entries that still point at this session; a
        // replacement may already have claimed them.
        self.by_peer
            .remove_if(&session.peer_public, |_, v| *v == id);
        self.by_inner
            .remove_if(&session.internal_addr, |_, v| *v == id);
        self.by_outer.remove_if(&session.remote, |_, v| *v == id);
        Counters::dec(&self.counters.sessions_active);
        Some(session)
    }

    /// Number of live sessions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    /// Is the table empty?
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    /// Snapshot of every live session.
    #[must_use]
    pub fn sessions(&self) -> Vec<Arc<Session>> {
        self.by_id.iter().map(|e| e.clone()).collect()
    }
}
