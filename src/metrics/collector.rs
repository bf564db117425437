//! Metrics collector using prometheus-client.
//!
//! Tracks relayed traffic, pool behavior, backend liveness, and the
//! rebalancer's activity.

use prometheus_client::encoding::{EncodeLabelSet, EncodeLabelValue};
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;

/// Labels naming a downstream host.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct HostLabels {
    pub host: String,
}

/// Labels for health probe outcomes.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ProbeLabels {
    pub host: String,
    pub result: ProbeResult,
}

/// Outcome of a health probe.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum ProbeResult {
    Success,
    Failure,
}

/// Collects and stores all metrics.
#[derive(Clone)]
pub struct MetricsCollector {
    inner: Arc<Inner>,
}

struct Inner {
    /// Lines forwarded downstream.
    lines_relayed: Family<HostLabels, Counter>,
    /// Relay failures after a host was bound.
    relay_errors: Family<HostLabels, Counter>,
    /// Failed pool borrows (including resolver returning no host).
    borrow_failures: Counter,
    /// New downstream connections dialed.
    connections_created: Family<HostLabels, Counter>,
    /// Idle connections handed back out.
    connections_reused: Family<HostLabels, Counter>,
    /// Host liveness (1 = up, 0 = down).
    host_up: Family<HostLabels, Gauge>,
    /// Metrics currently pinned per host.
    assigned_metrics: Family<HostLabels, Gauge>,
    /// Trailing arrival rate per host, lines per second.
    arrival_rate: Family<HostLabels, Gauge<f64, AtomicU64>>,
    /// Pins moved by the incremental balancer.
    rebalance_moves: Counter,
    /// Health probes performed.
    health_probes: Family<ProbeLabels, Counter>,
    registry: Registry,
}

impl MetricsCollector {
    pub fn new() -> Self {
        let mut registry = Registry::default();

        let lines_relayed = Family::<HostLabels, Counter>::default();
        let relay_errors = Family::<HostLabels, Counter>::default();
        let borrow_failures = Counter::default();
        let connections_created = Family::<HostLabels, Counter>::default();
        let connections_reused = Family::<HostLabels, Counter>::default();
        let host_up = Family::<HostLabels, Gauge>::default();
        let assigned_metrics = Family::<HostLabels, Gauge>::default();
        let arrival_rate = Family::<HostLabels, Gauge<f64, AtomicU64>>::default();
        let rebalance_moves = Counter::default();
        let health_probes = Family::<ProbeLabels, Counter>::default();

        registry.register(
            "metlb_lines_relayed",
            "Lines forwarded to downstream hosts",
            lines_relayed.clone(),
        );
        registry.register(
            "metlb_relay_errors",
            "Relay failures after a downstream host was bound",
            relay_errors.clone(),
        );
        registry.register(
            "metlb_pool_borrow_failures",
            "Failed attempts to obtain a pooled client",
            borrow_failures.clone(),
        );
        registry.register(
            "metlb_pool_connections_created",
            "Downstream connections dialed by the pool",
            connections_created.clone(),
        );
        registry.register(
            "metlb_pool_connections_reused",
            "Idle pooled connections handed back out",
            connections_reused.clone(),
        );
        registry.register(
            "metlb_host_up",
            "Downstream host liveness (1=up, 0=down)",
            host_up.clone(),
        );
        registry.register(
            "metlb_assigned_metrics",
            "Metric names currently pinned to each host",
            assigned_metrics.clone(),
        );
        registry.register(
            "metlb_host_arrival_rate",
            "Trailing arrival rate per host in lines per second",
            arrival_rate.clone(),
        );
        registry.register(
            "metlb_rebalance_moves",
            "Pins moved by the incremental balancer",
            rebalance_moves.clone(),
        );
        registry.register(
            "metlb_health_probes",
            "Health probes performed against downstream hosts",
            health_probes.clone(),
        );

        Self {
            inner: Arc::new(Inner {
                lines_relayed,
                relay_errors,
                borrow_failures,
                connections_created,
                connections_reused,
                host_up,
                assigned_metrics,
                arrival_rate,
                rebalance_moves,
                health_probes,
                registry,
            }),
        }
    }

    /// Get the prometheus registry for encoding.
    pub fn registry(&self) -> &Registry {
        &self.inner.registry
    }

    pub fn line_relayed(&self, host: &str) {
        self.inner
            .lines_relayed
            .get_or_create(&HostLabels {
                host: host.to_string(),
            })
            .inc();
    }

    pub fn relay_error(&self, host: &str) {
        self.inner
            .relay_errors
            .get_or_create(&HostLabels {
                host: host.to_string(),
            })
            .inc();
    }

    pub fn borrow_failure(&self) {
        self.inner.borrow_failures.inc();
    }

    pub fn connection_created(&self, host: &str) {
        self.inner
            .connections_created
            .get_or_create(&HostLabels {
                host: host.to_string(),
            })
            .inc();
    }

    pub fn connection_reused(&self, host: &str) {
        self.inner
            .connections_reused
            .get_or_create(&HostLabels {
                host: host.to_string(),
            })
            .inc();
    }

    pub fn set_host_up(&self, host: &str, up: bool) {
        self.inner
            .host_up
            .get_or_create(&HostLabels {
                host: host.to_string(),
            })
            .set(if up { 1 } else { 0 });
    }

    pub fn set_assigned_metrics(&self, host: &str, count: i64) {
        self.inner
            .assigned_metrics
            .get_or_create(&HostLabels {
                host: host.to_string(),
            })
            .set(count);
    }

    pub fn set_arrival_rate(&self, host: &str, rate: f64) {
        self.inner
            .arrival_rate
            .get_or_create(&HostLabels {
                host: host.to_string(),
            })
            .set(rate);
    }

    pub fn add_rebalance_moves(&self, moves: u64) {
        self.inner.rebalance_moves.inc_by(moves);
    }

    pub fn record_health_probe(&self, host: &str, success: bool) {
        self.inner
            .health_probes
            .get_or_create(&ProbeLabels {
                host: host.to_string(),
                result: if success {
                    ProbeResult::Success
                } else {
                    ProbeResult::Failure
                },
            })
            .inc();
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_collector_encodes() {
        let collector = MetricsCollector::new();

        collector.line_relayed("h1:1001");
        collector.relay_error("h1:1001");
        collector.borrow_failure();
        collector.connection_created("h2:1002");
        collector.connection_reused("h2:1002");
        collector.set_host_up("h1:1001", true);
        collector.set_assigned_metrics("h1:1001", 12);
        collector.set_arrival_rate("h1:1001", 3.5);
        collector.add_rebalance_moves(2);
        collector.record_health_probe("h1:1001", false);

        let mut buffer = String::new();
        prometheus_client::encoding::text::encode(&mut buffer, collector.registry()).unwrap();

        assert!(buffer.contains("metlb_lines_relayed"));
        assert!(buffer.contains("metlb_host_up"));
        assert!(buffer.contains("metlb_rebalance_moves"));
        assert!(buffer.contains("metlb_host_arrival_rate"));
    }

    #[test]
    fn test_collector_is_cheap_to_clone() {
        let collector = MetricsCollector::new();
        let clone = collector.clone();
        clone.line_relayed("h1:1001");

        let mut buffer = String::new();
        prometheus_client::encoding::text::encode(&mut buffer, collector.registry()).unwrap();
        assert!(buffer.contains("metlb_lines_relayed_total{host=\"h1:1001\"} 1"));
    }
}
