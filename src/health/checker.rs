//! Active health checker.
//!
//! Periodically opens a TCP connection to every downstream host and flips
//! the host's liveness flag after enough consecutive failures or successes.
//! The resolver and relay only ever consume the flag.

use crate::backend::{BalancedHost, HostKey};
use crate::config::HealthCheckConfig;
use crate::metrics::MetricsCollector;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::broadcast;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Probes downstream hosts and maintains their `up` flags.
pub struct HealthChecker {
    hosts: Vec<Arc<BalancedHost>>,
    config: HealthCheckConfig,
    streaks: DashMap<HostKey, Streaks>,
    metrics: MetricsCollector,
}

/// Consecutive probe outcomes per host.
#[derive(Default)]
struct Streaks {
    failures: AtomicU32,
    successes: AtomicU32,
}

impl HealthChecker {
    pub fn new(
        hosts: Vec<Arc<BalancedHost>>,
        config: HealthCheckConfig,
        metrics: MetricsCollector,
    ) -> Self {
        Self {
            hosts,
            config,
            streaks: DashMap::new(),
            metrics,
        }
    }

    /// Probe on a fixed interval until shutdown. Each host is probed in its
    /// own task so one slow host cannot delay the rest.
    pub async fn run(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        info!(hosts = self.hosts.len(), "health checker starting");

        let mut ticks = interval(self.config.interval);
        ticks.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticks.tick() => {
                    for host in &self.hosts {
                        let checker = Arc::clone(&self);
                        let host = Arc::clone(host);
                        tokio::spawn(async move {
                            let healthy = probe(&host, checker.config.timeout).await;
                            checker.record(&host, healthy);
                        });
                    }
                }

                _ = shutdown.recv() => {
                    info!("health checker shutting down");
                    break;
                }
            }
        }
    }

    /// Fold one probe outcome into the host's streaks and liveness flag.
    fn record(&self, host: &BalancedHost, healthy: bool) {
        let label = host.key().to_string();
        self.metrics.record_health_probe(&label, healthy);

        let streaks = self.streaks.entry(host.key()).or_default();
        if healthy {
            streaks.failures.store(0, Ordering::Relaxed);
            let run = streaks.successes.fetch_add(1, Ordering::Relaxed) + 1;
            if !host.is_up() && run >= self.config.healthy_threshold {
                host.set_up(true);
                info!(host = %host, "host is back up");
            }
        } else {
            streaks.successes.store(0, Ordering::Relaxed);
            let run = streaks.failures.fetch_add(1, Ordering::Relaxed) + 1;
            if host.is_up() && run >= self.config.unhealthy_threshold {
                host.set_up(false);
                warn!(host = %host, failures = run, "marking host down");
            }
        }

        self.metrics.set_host_up(&label, host.is_up());
    }
}

/// One TCP connect probe.
async fn probe(host: &BalancedHost, connect_timeout: Duration) -> bool {
    let address = (host.host(), host.tcp_port());
    match timeout(connect_timeout, TcpStream::connect(address)).await {
        Ok(Ok(_stream)) => true,
        Ok(Err(error)) => {
            debug!(host = %host, %error, "health probe failed");
            false
        }
        Err(_) => {
            debug!(host = %host, "health probe timed out");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn checker_for(host: Arc<BalancedHost>) -> HealthChecker {
        HealthChecker::new(
            vec![host],
            HealthCheckConfig {
                interval: Duration::from_secs(10),
                timeout: Duration::from_secs(1),
                unhealthy_threshold: 3,
                healthy_threshold: 2,
            },
            MetricsCollector::new(),
        )
    }

    #[test]
    fn test_host_goes_down_after_threshold_failures() {
        let host = Arc::new(BalancedHost::new("h1", 1001));
        let checker = checker_for(Arc::clone(&host));

        checker.record(&host, false);
        checker.record(&host, false);
        assert!(host.is_up());

        checker.record(&host, false);
        assert!(!host.is_up());
    }

    #[test]
    fn test_success_resets_failure_streak() {
        let host = Arc::new(BalancedHost::new("h1", 1001));
        let checker = checker_for(Arc::clone(&host));

        checker.record(&host, false);
        checker.record(&host, false);
        checker.record(&host, true);
        checker.record(&host, false);
        checker.record(&host, false);
        assert!(host.is_up());
    }

    #[test]
    fn test_host_recovers_after_threshold_successes() {
        let host = Arc::new(BalancedHost::new("h1", 1001));
        let checker = checker_for(Arc::clone(&host));

        for _ in 0..3 {
            checker.record(&host, false);
        }
        assert!(!host.is_up());

        checker.record(&host, true);
        assert!(!host.is_up());

        checker.record(&host, true);
        assert!(host.is_up());
    }

    #[tokio::test]
    async fn test_probe_success_against_listener() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let _ = listener.accept().await;
        });

        let host = BalancedHost::new("127.0.0.1", port);
        assert!(probe(&host, Duration::from_secs(5)).await);
    }

    #[tokio::test]
    async fn test_probe_refused() {
        let host = BalancedHost::new("127.0.0.1", 1);
        assert!(!probe(&host, Duration::from_secs(1)).await);
    }

    #[tokio::test]
    async fn test_probe_timeout() {
        // Non-routable address.
        let host = BalancedHost::new("10.255.255.1", 12345);
        assert!(!probe(&host, Duration::from_millis(100)).await);
    }
}
