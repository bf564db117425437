//! A single downstream ingest server and its liveness/traffic state.

use crate::config::HostConfig;
use crate::rate::ArrivalRate;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};

/// A downstream metric-ingest server.
///
/// The resolver owns the set of hosts for the lifetime of the process; the
/// health checker flips `up` out-of-band, and every consumer re-validates
/// liveness through `is_up()` at the point of use.
pub struct BalancedHost {
    host: String,
    tcp_port: u16,
    up: AtomicBool,
    rate: ArrivalRate,
}

/// Hashable identity of a host, used to key pools and side tables.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HostKey {
    pub host: String,
    pub tcp_port: u16,
}

impl BalancedHost {
    pub fn new(host: impl Into<String>, tcp_port: u16) -> Self {
        Self {
            host: host.into(),
            tcp_port,
            // Hosts start up; the health checker demotes them.
            up: AtomicBool::new(true),
            rate: ArrivalRate::new(),
        }
    }

    pub fn from_config(config: &HostConfig) -> Self {
        Self::new(config.host.clone(), config.tcp_port)
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn tcp_port(&self) -> u16 {
        self.tcp_port
    }

    pub fn key(&self) -> HostKey {
        HostKey {
            host: self.host.clone(),
            tcp_port: self.tcp_port,
        }
    }

    pub fn is_up(&self) -> bool {
        self.up.load(Ordering::Acquire)
    }

    /// Liveness is owned by the health checker; nothing else calls this.
    pub fn set_up(&self, up: bool) {
        self.up.store(up, Ordering::Release);
    }

    /// Record one forwarded line against this host.
    pub fn arrived(&self) {
        self.rate.arrived();
    }

    /// Trailing-window arrival rate in lines per second.
    pub fn arrival_rate(&self) -> f64 {
        self.rate.rate()
    }
}

impl PartialEq for BalancedHost {
    fn eq(&self, other: &Self) -> bool {
        self.host == other.host && self.tcp_port == other.tcp_port
    }
}

impl Eq for BalancedHost {}

impl fmt::Display for BalancedHost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.tcp_port)
    }
}

impl fmt::Debug for BalancedHost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BalancedHost")
            .field("host", &self.host)
            .field("tcp_port", &self.tcp_port)
            .field("up", &self.is_up())
            .field("arrival_rate", &self.arrival_rate())
            .finish()
    }
}

impl fmt::Display for HostKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.tcp_port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_equality_by_host_and_port() {
        let a = BalancedHost::new("h1", 1001);
        let b = BalancedHost::new("h1", 1001);
        let c = BalancedHost::new("h1", 1002);
        let d = BalancedHost::new("h2", 1001);

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, d);
    }

    #[test]
    fn test_liveness_toggles() {
        let host = BalancedHost::new("h1", 1001);
        assert!(host.is_up());

        host.set_up(false);
        assert!(!host.is_up());

        host.set_up(true);
        assert!(host.is_up());
    }

    #[test]
    fn test_arrivals_feed_rate() {
        let host = BalancedHost::new("h1", 1001);
        assert_eq!(host.arrival_rate(), 0.0);

        for _ in 0..60 {
            host.arrived();
        }
        assert!((host.arrival_rate() - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_display() {
        let host = BalancedHost::new("ingest-1.example.com", 4242);
        assert_eq!(host.to_string(), "ingest-1.example.com:4242");
        assert_eq!(host.key().to_string(), "ingest-1.example.com:4242");
    }
}
