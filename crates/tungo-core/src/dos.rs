//! Handshake load monitoring.
//!
//! Tracks an exponentially-weighted moving average of handshake starts,
//! globally and per source IP. While either average sits above its
//! threshold, new initiators must present a valid MAC2 before the responder
//! spends any DH work on them.

use std::net::IpAddr;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use dashmap::DashMap;

/// Load monitor thresholds.
#[derive(Debug, Clone)]
pub struct LoadConfig {
    /// Aggregate handshake starts per second before cookies kick in.
    pub global_threshold: f64,
    /// Per-source-IP handshake starts per second before cookies kick in.
    pub per_ip_threshold: f64,
    /// EWMA time constant.
    pub tau: Duration,
}

impl Default for LoadConfig {
    fn default() -> Self {
        Self {
            global_threshold: 50.0,
            per_ip_threshold: 5.0,
            tau: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Ewma {
    value: f64,
    updated: Instant,
}

impl Ewma {
    fn fresh() -> Self {
        Self {
            value: 0.0,
            updated: Instant::now(),
        }
    }

    // Decay, then count one event. Returns the new rate estimate.
    fn observe(&mut self, tau: Duration) -> f64 {
        let dt = self.updated.elapsed().as_secs_f64();
        self.value *= (-dt / tau.as_secs_f64()).exp();
        self.value += 1.0;
        self.updated = Instant::now();
        self.value
    }
}

/// EWMA-based handshake rate monitor.
pub struct LoadMonitor {
    config: LoadConfig,
    global: Mutex<Ewma>,
    per_ip: DashMap<IpAddr, Ewma>,
}

impl LoadMonitor {
    /// Create with the given thresholds.
    #[must_use]
    pub fn new(config: LoadConfig) -> Self {
        Self {
            config,
            global: Mutex::new(Ewma::fresh()),
            per_ip: DashMap::new(),
        }
    }

    /// Record one handshake start from `ip`. Returns true when the
    /// responder is under load and must demand a cookie.
    pub fn observe_init(&self, ip: IpAddr) -> bool {
        let global_rate = self
            .global
            .lock()
            .expect("load monitor lock poisoned")
            .observe(self.config.tau);
        let ip_rate = self
            .per_ip
            .entry(ip)
            .or_insert_with(Ewma::fresh)
            .observe(self.config.tau);
        global_rate > self.config.global_threshold || ip_rate > self.config.per_ip_threshold
    }

    /// Drop per-IP entries idle for more than a minute. Control-tick work.
    pub fn sweep(&self) {
        self.per_ip
            .retain(|_, e| e.updated.elapsed() < Duration::from_secs(60));
    }

    /// Tracked source count, for tests and logs.
    #[must_use]
    pub fn tracked_sources(&self) -> usize {
        self.per_ip.len()
    }
}
