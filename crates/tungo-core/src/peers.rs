//! Peer authorisation policy.
//!
//! A `PeerRecord` authorises one static key: it assigns the peer's inner
//! address and the AllowedIPs prefixes it may claim as inner source. The
//! validated set of records forms an immutable [`PeerPolicy`] snapshot with
//! the three indexes the data plane needs; readers grab a snapshot handle
//! per lookup and never block writers.
//!
//! Identity is the static key. The inner IP is configuration, never trusted
//! from the wire; AllowedIPs is an authorisation filter on top.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, RwLock};

use ipnet::IpNet;
use tungo_crypto::fingerprint;

use crate::error::ConfigError;

/// One authorised peer.
#[derive(Debug, Clone)]
pub struct PeerRecord {
    /// The peer's static X25519 public key; primary key of the table.
    pub public_key: [u8; 32],
    /// Disabled peers keep their row but are invisible to every index.
    pub enabled: bool,
    /// The single inner address assigned to this peer.
    pub internal_addr: IpAddr,
    /// Prefixes this peer may use as inner source addresses.
    pub allowed_ips: Vec<IpNet>,
}

impl PeerRecord {
    /// Short log identifier.
    #[must_use]
    pub fn fingerprint(&self) -> String {
        fingerprint(&self.public_key)
    }

    /// Does this record authorise `src` as an inner source?
    #[must_use]
    pub fn allows(&self, src: IpAddr) -> bool {
        self.allowed_ips.iter().any(|net| net.contains(&src))
    }
}

fn nets_overlap(a: &IpNet, b: &IpNet) -> bool {
    // Prefixes overlap iff one contains the other's network address.
    a.contains(&b.network()) || b.contains(&a.network())
}

/// Validated, immutable view of the peer table.
#[derive(Debug)]
pub struct PeerPolicy {
    records: Vec<PeerRecord>,
    by_key: HashMap<[u8; 32], usize>,
    by_inner: HashMap<IpAddr, usize>,
    all_keys: HashMap<[u8; 32], usize>,
}

impl PeerPolicy {
    /// Validate records and build the indexes.
    ///
    /// # Errors
    ///
    /// Fails fast on duplicate keys or inner addresses, an internal address
    /// outside its own allowed_ips, empty allowed_ips, or overlapping
    /// allowed_ips between peers that are not both disabled.
    pub fn new(records: Vec<PeerRecord>) -> Result<Self, ConfigError> {
        let mut by_key = HashMap::new();
        let mut by_inner = HashMap::new();
        let mut all_keys = HashMap::new();

        for (i, record) in records.iter().enumerate() {
            if all_keys.insert(record.public_key, i).is_some() {
                return Err(ConfigError::DuplicatePeer(record.fingerprint()));
            }
            if record.allowed_ips.is_empty() {
                return Err(ConfigError::EmptyAllowedIps(record.fingerprint()));
            }
            if !record.allows(record.internal_addr) {
                return Err(ConfigError::InternalAddrNotAllowed {
                    fingerprint: record.fingerprint(),
                    addr: record.internal_addr,
                });
            }
            if !record.enabled {
                continue;
            }
            if by_key.insert(record.public_key, i).is_some() {
                return Err(ConfigError::DuplicatePeer(record.fingerprint()));
            }
            if by_inner.insert(record.internal_addr, i).is_some() {
                return Err(ConfigError::DuplicateInternalAddr(record.internal_addr));
            }
        }

        for (i, a) in records.iter().enumerate() {
            for b in records.iter().skip(i + 1) {
                if !a.enabled && !b.enabled {
                    continue;
                }
                let collision = a
                    .allowed_ips
                    .iter()
                    .any(|na| b.allowed_ips.iter().any(|nb| nets_overlap(na, nb)));
                if collision {
                    return Err(ConfigError::AllowedIpsOverlap {
                        a: a.fingerprint(),
                        b: b.fingerprint(),
                    });
                }
            }
        }

        Ok(Self {
            records,
            by_key,
            by_inner,
            all_keys,
        })
    }

    /// Look up an enabled peer by static key.
    #[must_use]
    pub fn lookup_key(&self, key: &[u8; 32]) -> Option<&PeerRecord> {
        self.by_key.get(key).map(|&i| &self.records[i])
    }

    /// Look up a peer by static key regardless of enablement; used only to
    /// distinguish "unknown" from "disabled" in rejection counters.
    #[must_use]
    pub fn lookup_key_any(&self, key: &[u8; 32]) -> Option<&PeerRecord> {
        self.all_keys.get(key).map(|&i| &self.records[i])
    }

    /// Look up an enabled peer by its inner address.
    #[must_use]
    pub fn lookup_inner(&self, addr: IpAddr) -> Option<&PeerRecord> {
        self.by_inner.get(&addr).map(|&i| &self.records[i])
    }

    /// All records, enabled or not.
    #[must_use]
    pub fn records(&self) -> &[PeerRecord] {
        &self.records
    }
}

/// Atomically swappable policy handle.
///
/// Lookups clone an `Arc` under a read lock; enable/disable flips rebuild
/// the snapshot and swap it in one write. Existing sessions for a disabled
/// peer are collected by the next control tick, not here.
pub struct PolicyHandle {
    inner: RwLock<Arc<PeerPolicy>>,
}

impl PolicyHandle {
    /// Wrap an initial policy.
    #[must_use]
    pub fn new(policy: PeerPolicy) -> Self {
        Self {
            inner: RwLock::new(Arc::new(policy)),
        }
    }

    /// Current snapshot.
    ///
    /// # Panics
    ///
    /// Panics if the lock is poisoned, which cannot happen: no code path
    /// panics while holding it.
    #[must_use]
    pub fn snapshot(&self) -> Arc<PeerPolicy> {
        self.inner.read().expect("policy lock poisoned").clone()
    }

    /// Flip a peer's enabled flag, revalidating the whole table.
    ///
    /// # Errors
    ///
    /// Re-enabling a peer can surface an AllowedIPs overlap; the flip is
    /// rejected and the previous snapshot stays in place.
    pub fn set_enabled(&self, key: &[u8; 32], enabled: bool) -> Result<bool, ConfigError> {
        let current = self.snapshot();
        let mut records = current.records().to_vec();
        let Some(record) = records.iter_mut().find(|r| &r.public_key == key) else {
            return Ok(false);
        };
        if record.enabled == enabled {
            return Ok(true);
        }
        record.enabled = enabled;
        let rebuilt = PeerPolicy::new(records)?;
        *self.inner.write().expect("policy lock poisoned") = Arc::new(rebuilt);
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(key: u8, addr: &str, allowed: &[&str], enabled: bool) -> PeerRecord {
        PeerRecord {
            public_key: [key; 32],
            enabled,
            internal_addr: addr.parse().unwrap(),
            allowed_ips: allowed.iter().map(|s| s.parse().unwrap()).collect(),
        }
    }

    #[test]
    fn valid_table_builds_indexes() {
        let policy = PeerPolicy::new(vec![
            peer(1, "10.8.0.2", &["10.8.0.2/32"], true),
            peer(2, "10.8.0.3", &["10.8.0.3/32", "172.16.1.0/24"], true),
        ])
        .unwrap();

        assert!(policy.lookup_key(&[1; 32]).is_some());
        assert!(policy.lookup_key(&[3; 32]).is_none());
        assert_eq!(
            policy.lookup_inner("10.8.0.3".parse().unwrap()).unwrap().public_key,
            [2; 32]
        );
    }

    #[test]
    fn disabled_peers_are_invisible() {
        let policy = PeerPolicy::new(vec![peer(1, "10.8.0.2", &["10.8.0.2/32"], false)]).unwrap();
        assert!(policy.lookup_key(&[1; 32]).is_none());
        assert!(policy.lookup_inner("10.8.0.2".parse().unwrap()).is_none());
        assert!(policy.lookup_key_any(&[1; 32]).is_some());
    }

    #[test]
    fn internal_outside_allowed_fails() {
        let err = PeerPolicy::new(vec![peer(1, "10.9.0.2", &["10.8.0.0/24"], true)]).unwrap_err();
        assert!(matches!(err, ConfigError::InternalAddrNotAllowed { .. }));
    }

    #[test]
    fn overlap_between_enabled_peers_fails() {
        let err = PeerPolicy::new(vec![
            peer(1, "10.8.0.2", &["10.8.0.0/24"], true),
            peer(2, "10.8.0.3", &["10.8.0.3/32"], true),
        ])
        .unwrap_err();
        assert!(matches!(err, ConfigError::AllowedIpsOverlap { .. }));
    }

    #[test]
    fn overlap_with_disabled_peer_fails_unless_both_disabled() {
        // One side enabled: still rejected.
        assert!(
            PeerPolicy::new(vec![
                peer(1, "10.8.0.2", &["10.8.0.0/24"], true),
                peer(2, "10.8.0.3", &["10.8.0.3/32"], false),
            ])
            .is_err()
        );
        // Both disabled: tolerated.
        assert!(
            PeerPolicy::new(vec![
                peer(1, "10.8.0.2", &["10.8.0.0/24"], false),
                peer(2, "10.8.0.3", &["10.8.0.3/32"], false),
            ])
            .is_ok()
        );
    }

    #[test]
    fn duplicate_key_fails() {
        let err = PeerPolicy::new(vec![
            peer(1, "10.8.0.2", &["10.8.0.2/32"], true),
            peer(1, "10.8.0.3", &["10.8.0.3/32"], true),
        ])
        .unwrap_err();
        assert!(matches!(err, ConfigError::DuplicatePeer(_)));
    }

    #[test]
    fn handle_flips_enabled() {
        let handle = PolicyHandle::new(
            PeerPolicy::new(vec![peer(1, "10.8.0.2", &["10.8.0.2/32"], true)]).unwrap(),
        );
        assert!(handle.snapshot().lookup_key(&[1; 32]).is_some());

        assert!(handle.set_enabled(&[1; 32], false).unwrap());
        assert!(handle.snapshot().lookup_key(&[1; 32]).is_none());

        assert!(handle.set_enabled(&[1; 32], true).unwrap());
        assert!(handle.snapshot().lookup_key(&[1; 32]).is_some());

        // Unknown key reports false without error.
        assert!(!handle.set_enabled(&[9; 32], false).unwrap());
    }

    #[test]
    fn reenabling_into_overlap_is_rejected() {
        let handle = PolicyHandle::new(
            PeerPolicy::new(vec![
                peer(1, "10.8.0.2", &["10.8.0.0/24"], false),
                peer(2, "10.8.0.3", &["10.8.0.3/32"], false),
            ])
            .unwrap(),
        );
        handle.set_enabled(&[1; 32], true).unwrap();
        // Peer 2 overlaps peer 1 once both would be enabled.
        assert!(handle.set_enabled(&[2; 32], true).is_err());
        // Snapshot unchanged: peer 2 still disabled.
        assert!(handle.snapshot().lookup_key(&[2; 32]).is_none());
    }

    #[test]
    fn record_allows_checks_prefixes() {
        let record = peer(1, "10.8.0.2", &["10.8.0.2/32"], true);
        assert!(record.allows("10.8.0.2".parse().unwrap()));
        assert!(!record.allows("10.8.0.3".parse().unwrap()));
    }
}
