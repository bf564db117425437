//! The balanced metric resolver.
//!
//! Pins each metric name to one downstream host and keeps those pins stable
//! while traffic is flowing, so that a given metric's lines land on the same
//! server. Pins shift in three ways: a pinned host goes down and the metric
//! is repinned at dispatch time, the one-shot full reassignment re-stripes
//! every metric by rate shortly after start-up, and the incremental balancer
//! trims load off the hottest host during the warm-up window.
//!
//! Two critical sections guard the mutable state:
//!
//! - `assigned` pins metrics to hosts,
//! - `rates` tracks one [`ArrivalRate`] per metric name.
//!
//! When both are held, `rates` is always locked first.

use crate::backend::{BalancedHost, HostKey};
use crate::config::BalanceConfig;
use crate::metrics::MetricsCollector;
use crate::rate::ArrivalRate;
use crate::resolver::assignments::{self, AssignmentRow};
use crate::util::ShutdownSignal;
use parking_lot::Mutex;
use rand::Rng;
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

/// Fraction above the mean arrival rate at which the incremental balancer
/// considers a host overloaded.
const IMBALANCE_THRESHOLD: f64 = 1.05;

/// Fraction of the high/low rate gap the balancer tries to close per pass.
const REBALANCE_STEP: f64 = 0.1;

/// Fraction of the average per-host metric population that may move in one
/// incremental pass.
const MAX_MOVE_FRACTION: f64 = 0.20;

/// Resolves metric names to downstream hosts and periodically rebalances.
pub struct BalancedResolver {
    /// Dense host index, fixed at construction. Selection policies index
    /// into this; every pin ever handed out comes from here.
    servers: Vec<Arc<BalancedHost>>,
    /// Metric name to pinned host.
    assigned: Mutex<BTreeMap<String, Arc<BalancedHost>>>,
    /// Metric name to its arrival-rate estimator. Estimators are created on
    /// first ingest and never removed.
    rates: Mutex<HashMap<String, Arc<ArrivalRate>>>,
    assignment_file: PathBuf,
    schedule: BalanceConfig,
    /// Incremental balancing stops once this deadline passes.
    balance_until: Instant,
    metrics: MetricsCollector,
}

impl BalancedResolver {
    /// Build a resolver over a fixed host set, restoring pins from the
    /// assignment file. Rows naming an unknown `(host, port)` are rebound
    /// round-robin; nothing in the file can fail start-up.
    pub fn new(
        servers: Vec<Arc<BalancedHost>>,
        assignment_file: PathBuf,
        schedule: BalanceConfig,
        metrics: MetricsCollector,
    ) -> Self {
        let balance_until = Instant::now() + schedule.balance_window;
        let resolver = Self {
            servers,
            assigned: Mutex::new(BTreeMap::new()),
            rates: Mutex::new(HashMap::new()),
            assignment_file,
            schedule,
            balance_until,
            metrics,
        };

        let rows = assignments::load(&resolver.assignment_file);
        if !rows.is_empty() {
            let mut assigned = resolver.assigned.lock();
            for row in rows {
                let host = resolver
                    .find_host(&row.host, row.tcp_port)
                    .or_else(|| resolver.round_robin_up(assigned.len()));
                match host {
                    Some(host) => {
                        assigned.insert(row.metric, host);
                    }
                    None => {
                        warn!(
                            metric = %row.metric,
                            "dropping restored assignment, no host reachable"
                        );
                    }
                }
            }
            info!(restored = assigned.len(), "assignments restored");
        }
        resolver.refresh_gauges();
        resolver
    }

    /// The fixed host index.
    pub fn servers(&self) -> &[Arc<BalancedHost>] {
        &self.servers
    }

    /// The host currently pinned for `metric`, if any.
    pub fn assigned_host(&self, metric: &str) -> Option<Arc<BalancedHost>> {
        self.assigned.lock().get(metric).cloned()
    }

    /// Number of currently pinned metrics.
    pub fn assigned_count(&self) -> usize {
        self.assigned.lock().len()
    }

    /// Resolve a host for an ingest (data) request.
    ///
    /// Records the arrival against the metric's estimator, pins unknown
    /// metrics round-robin, and repins metrics whose host has gone down to
    /// the least-loaded live host. Returns `None` only when no host is up.
    pub fn host_for_ingest(&self, metric: &str) -> Option<Arc<BalancedHost>> {
        if !metric.is_empty() {
            let rate = {
                let mut rates = self.rates.lock();
                Arc::clone(rates.entry(metric.to_string()).or_default())
            };
            rate.arrived();
        }

        let mut chosen = if metric.is_empty() {
            // No name to pin; spread anonymous traffic randomly.
            self.random_up(None)
        } else {
            let mut assigned = self.assigned.lock();
            match assigned.get(metric).cloned() {
                Some(host) if host.is_up() => Some(host),
                Some(down) => {
                    let replacement = self.least_loaded_up();
                    if let Some(host) = &replacement {
                        debug!(
                            metric,
                            from = %down,
                            to = %host,
                            "pinned host is down, repinning to least loaded"
                        );
                        assigned.insert(metric.to_string(), Arc::clone(host));
                    }
                    replacement
                }
                None => {
                    let host = self.round_robin_up(assigned.len());
                    if let Some(host) = &host {
                        assigned.insert(metric.to_string(), Arc::clone(host));
                    }
                    host
                }
            }
        };

        // Last resort: first live host in index order. The liveness flag can
        // flip between selection and here, so re-check before dispatch.
        if chosen.as_ref().map_or(true, |host| !host.is_up()) {
            chosen = self.servers.iter().find(|host| host.is_up()).cloned();
            if let Some(host) = &chosen {
                if !metric.is_empty() {
                    self.assigned.lock().insert(metric.to_string(), Arc::clone(host));
                }
            }
        }

        if let Some(host) = &chosen {
            host.arrived();
        }
        chosen
    }

    /// Resolve a host for a non-ingest request (e.g. a version probe).
    ///
    /// Reads an existing pin when a metric name is given but never creates
    /// estimators, never counts the arrival, and falls back to a random live
    /// host rather than disturbing the pin population. The fallback scan is
    /// the only path that records a binding, and only for named metrics.
    pub fn host_for_query(&self, metric: Option<&str>) -> Option<Arc<BalancedHost>> {
        let metric = metric.filter(|name| !name.is_empty());

        let mut chosen = match metric {
            Some(name) => self.assigned.lock().get(name).cloned(),
            None => None,
        };

        if chosen.as_ref().map_or(true, |host| !host.is_up()) {
            chosen = self.random_up(None);
        }

        if chosen.as_ref().map_or(true, |host| !host.is_up()) {
            chosen = self.servers.iter().find(|host| host.is_up()).cloned();
            if let (Some(host), Some(name)) = (&chosen, metric) {
                self.assigned.lock().insert(name.to_string(), Arc::clone(host));
            }
        }

        chosen
    }

    /// Re-stripe every pinned metric across the hosts, coldest first.
    ///
    /// Because the round-robin policy keys off the growing map size, walking
    /// the metrics in ascending rate order spreads hot and cold metrics
    /// evenly over the index. Metrics are never dropped: when no host is
    /// reachable for a slot the previous pin is kept.
    pub fn rebalance_all_metrics(&self) {
        let rates = self.rates.lock();
        let mut assigned = self.assigned.lock();

        let mut by_rate: Vec<(String, f64)> = assigned
            .keys()
            .map(|metric| {
                let rate = rates.get(metric).map(|r| r.rate()).unwrap_or(0.0);
                (metric.clone(), rate)
            })
            .collect();
        by_rate.sort_by(|a, b| {
            a.1.partial_cmp(&b.1)
                .unwrap_or(Ordering::Equal)
                .then_with(|| a.0.cmp(&b.0))
        });

        let mut restriped = BTreeMap::new();
        for (metric, _) in by_rate {
            let host = self
                .round_robin_up(restriped.len())
                .or_else(|| assigned.get(&metric).cloned());
            if let Some(host) = host {
                restriped.insert(metric, host);
            }
        }

        let total = restriped.len();
        *assigned = restriped;
        drop(assigned);
        drop(rates);

        self.refresh_gauges();
        info!(metrics = total, "full reassignment complete");
    }

    /// One incremental balance pass, if the warm-up window is still open.
    pub fn balance_tick(&self) {
        if Instant::now() >= self.balance_until {
            debug!("balance window closed, skipping pass");
            return;
        }
        self.balance();
    }

    /// Shift a bounded slice of hot metrics off the most loaded host.
    ///
    /// No-op unless the hottest live host sits more than 5% above the mean
    /// arrival rate. At most 20% of the average per-host metric population
    /// moves per pass, and only metrics currently pinned to the hottest
    /// host; the budget closes a tenth of the high/low gap at a time so
    /// consecutive passes converge without thrashing.
    pub fn balance(&self) {
        info!("balance pass begin");

        let mut most: Option<(usize, f64)> = None;
        let mut least: Option<(usize, f64)> = None;
        let mut total = 0.0;
        for (index, host) in self.servers.iter().enumerate() {
            let rate = host.arrival_rate();
            total += rate;
            if !host.is_up() {
                continue;
            }
            match least {
                Some((_, low)) if rate >= low => {}
                _ => least = Some((index, rate)),
            }
            match most {
                Some((_, high)) if rate < high => {}
                _ => most = Some((index, rate)),
            }
        }

        let (Some((most_index, highest)), Some((least_index, lowest))) = (most, least) else {
            warn!("no hosts up, skipping balance pass");
            return;
        };
        let most_used = Arc::clone(&self.servers[most_index]);
        let least_used = Arc::clone(&self.servers[least_index]);
        let average = total / self.servers.len() as f64;
        info!(high = highest, avg = average, low = lowest, "balance pass rates");

        if highest <= average * IMBALANCE_THRESHOLD {
            info!(reassigned = 0, "balance pass end");
            return;
        }

        let rates = self.rates.lock();
        let mut assigned = self.assigned.lock();

        let mut by_rate: Vec<(f64, &String)> =
            rates.iter().map(|(metric, rate)| (rate.rate(), metric)).collect();
        by_rate.sort_by(|a, b| {
            a.0.partial_cmp(&b.0)
                .unwrap_or(Ordering::Equal)
                .then_with(|| a.1.cmp(b.1))
        });

        let mut delta_high = (highest - average) * REBALANCE_STEP;
        let mut delta_low = (average - lowest) * REBALANCE_STEP;
        let max_to_reassign = ((rates.len() as f64 / self.servers.len() as f64)
            * MAX_MOVE_FRACTION)
            .round() as usize;
        debug!(
            delta_high,
            delta_low,
            metrics = by_rate.len(),
            max_to_reassign,
            "balance pass budgets"
        );

        // Only above-median metrics are worth moving; churning cold metrics
        // costs pin stability for no measurable relief.
        let skip = by_rate.len() / 2 + 1;
        let mut reassigned = 0usize;
        for (rate, metric) in by_rate.into_iter().skip(skip) {
            if delta_high <= 0.0 || reassigned >= max_to_reassign {
                break;
            }
            match assigned.get(metric.as_str()) {
                Some(pinned) if *pinned == most_used => {}
                _ => continue,
            }
            assigned.insert(metric.clone(), Arc::clone(&least_used));
            debug!(metric = %metric, from = %most_used, to = %least_used, "reassigned metric");
            delta_high -= rate;
            delta_low -= rate;
            reassigned += 1;
        }

        drop(assigned);
        drop(rates);

        self.metrics.add_rebalance_moves(reassigned as u64);
        self.refresh_gauges();
        info!(
            reassigned,
            delta_high_left = delta_high,
            delta_low_left = delta_low,
            "balance pass end"
        );
    }

    /// Save the current pins to the assignment file.
    ///
    /// Both critical sections are held for the duration of the write so the
    /// snapshot on disk is internally consistent. I/O failures are logged
    /// and swallowed; the in-memory map remains the source of truth.
    pub fn save_assignments(&self) {
        let rates = self.rates.lock();
        let assigned = self.assigned.lock();

        let rows: Vec<AssignmentRow> = assigned
            .iter()
            .map(|(metric, host)| AssignmentRow {
                metric: metric.clone(),
                host: host.host().to_string(),
                tcp_port: host.tcp_port(),
                rate: rates.get(metric).map(|r| r.rate()).unwrap_or(0.0),
            })
            .collect();

        match assignments::save(&self.assignment_file, &rows) {
            Ok(()) => debug!(rows = rows.len(), "assignments saved"),
            Err(error) => error!(
                %error,
                path = %self.assignment_file.display(),
                "failed to save assignments"
            ),
        }
    }

    /// Spawn the three maintenance tasks: the one-shot full reassignment,
    /// the periodic incremental balance, and the periodic assignment save.
    /// Each stops at shutdown; a pass already underway runs to completion.
    pub fn spawn_maintenance(self: &Arc<Self>, shutdown: &ShutdownSignal) {
        let resolver = Arc::clone(self);
        let mut rx = shutdown.subscribe();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(resolver.schedule.full_rebalance_delay) => {
                    resolver.rebalance_all_metrics();
                }
                _ = rx.recv() => {}
            }
        });

        let resolver = Arc::clone(self);
        let mut rx = shutdown.subscribe();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(resolver.schedule.balance_delay) => {}
                _ = rx.recv() => return,
            }
            let mut ticks = tokio::time::interval(resolver.schedule.balance_period);
            ticks.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticks.tick() => resolver.balance_tick(),
                    _ = rx.recv() => break,
                }
            }
        });

        let resolver = Arc::clone(self);
        let mut rx = shutdown.subscribe();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(resolver.schedule.persist_delay) => {}
                _ = rx.recv() => return,
            }
            let mut ticks = tokio::time::interval(resolver.schedule.persist_period);
            ticks.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticks.tick() => resolver.save_assignments(),
                    _ = rx.recv() => break,
                }
            }
        });
    }

    /// Live host with the lowest arrival rate; ties break in index order.
    fn least_loaded_up(&self) -> Option<Arc<BalancedHost>> {
        let snapshot: Vec<f64> = self.servers.iter().map(|h| h.arrival_rate()).collect();
        let mut order: Vec<usize> = (0..self.servers.len()).collect();
        order.sort_by(|&a, &b| {
            snapshot[a]
                .partial_cmp(&snapshot[b])
                .unwrap_or(Ordering::Equal)
                .then_with(|| a.cmp(&b))
        });
        order
            .into_iter()
            .map(|index| &self.servers[index])
            .find(|host| host.is_up())
            .cloned()
    }

    /// Uniformly sampled live host, optionally excluding one; gives up
    /// after N draws.
    fn random_up(&self, except: Option<&Arc<BalancedHost>>) -> Option<Arc<BalancedHost>> {
        let n = self.servers.len();
        let mut rng = rand::thread_rng();
        for _ in 0..n {
            let candidate = &self.servers[rng.gen_range(0..n)];
            if !candidate.is_up() {
                continue;
            }
            if let Some(except) = except {
                if candidate == except {
                    continue;
                }
            }
            return Some(Arc::clone(candidate));
        }
        None
    }

    /// Host at index `assigned_len mod N`, falling back to a random live
    /// host when that slot is down. Striding off the pin population means
    /// consecutive new metrics land on consecutive hosts.
    fn round_robin_up(&self, assigned_len: usize) -> Option<Arc<BalancedHost>> {
        let candidate = &self.servers[assigned_len % self.servers.len()];
        if candidate.is_up() {
            Some(Arc::clone(candidate))
        } else {
            self.random_up(None)
        }
    }

    fn find_host(&self, host: &str, tcp_port: u16) -> Option<Arc<BalancedHost>> {
        self.servers
            .iter()
            .find(|h| h.host() == host && h.tcp_port() == tcp_port)
            .cloned()
    }

    /// Push per-host pin counts and arrival rates into the metrics registry.
    fn refresh_gauges(&self) {
        let mut counts: HashMap<HostKey, i64> = HashMap::new();
        {
            let assigned = self.assigned.lock();
            for host in assigned.values() {
                *counts.entry(host.key()).or_insert(0) += 1;
            }
        }
        for host in &self.servers {
            let label = host.key().to_string();
            let count = counts.get(&host.key()).copied().unwrap_or(0);
            self.metrics.set_assigned_metrics(&label, count);
            self.metrics.set_arrival_rate(&label, host.arrival_rate());
        }
    }
}
