//! Configuration data types.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Root configuration structure.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// Global settings (logging, metrics endpoint).
    #[serde(default)]
    pub global: GlobalConfig,

    /// Address the balancer accepts ingest traffic on.
    pub listen: SocketAddr,

    /// Path of the persisted metric-to-host assignment file.
    pub assignment_file: PathBuf,

    /// The fixed set of downstream ingest servers.
    #[serde(default)]
    pub hosts: Vec<HostConfig>,

    /// Health probing of downstream servers.
    #[serde(default)]
    pub health_check: HealthCheckConfig,

    /// Rebalancing and persistence schedule.
    #[serde(default)]
    pub balance: BalanceConfig,

    /// Outbound connection pool.
    #[serde(default)]
    pub pool: PoolConfig,

    /// Relay retry behavior.
    #[serde(default)]
    pub relay: RelayConfig,
}

/// Global configuration settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GlobalConfig {
    /// Log level: trace, debug, info, warn, error
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Log format: json or pretty
    #[serde(default)]
    pub log_format: LogFormat,

    /// Metrics endpoint configuration
    #[serde(default)]
    pub metrics: MetricsConfig,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format: LogFormat::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Json,
    Pretty,
}

/// Metrics endpoint configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MetricsConfig {
    /// Whether the metrics endpoint is enabled.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Address to bind the metrics server.
    #[serde(default = "default_metrics_address")]
    pub address: SocketAddr,

    /// Path for the metrics endpoint.
    #[serde(default = "default_metrics_path")]
    pub path: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            address: default_metrics_address(),
            path: default_metrics_path(),
        }
    }
}

/// A single downstream ingest server.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct HostConfig {
    pub host: String,
    pub tcp_port: u16,
}

/// Health probing settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HealthCheckConfig {
    /// How often to probe each host.
    #[serde(default = "default_health_interval", with = "duration_str")]
    pub interval: Duration,

    /// Per-probe connect timeout.
    #[serde(default = "default_health_timeout", with = "duration_str")]
    pub timeout: Duration,

    /// Consecutive probe failures before a host is marked down.
    #[serde(default = "default_unhealthy_threshold")]
    pub unhealthy_threshold: u32,

    /// Consecutive probe successes before a down host is marked up again.
    #[serde(default = "default_healthy_threshold")]
    pub healthy_threshold: u32,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            interval: default_health_interval(),
            timeout: default_health_timeout(),
            unhealthy_threshold: default_unhealthy_threshold(),
            healthy_threshold: default_healthy_threshold(),
        }
    }
}

/// Rebalancing and persistence schedule.
///
/// The defaults mirror the production cadence: one full re-stripe shortly
/// after start, incremental smoothing every couple of minutes during the
/// warm-up window, and an hourly assignment save.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BalanceConfig {
    /// Delay before the one-shot full reassignment.
    #[serde(default = "default_full_rebalance_delay", with = "duration_str")]
    pub full_rebalance_delay: Duration,

    /// Delay before the first incremental balance pass.
    #[serde(default = "default_balance_delay", with = "duration_str")]
    pub balance_delay: Duration,

    /// Period of incremental balance passes.
    #[serde(default = "default_balance_period", with = "duration_str")]
    pub balance_period: Duration,

    /// Window after start-up during which incremental balancing runs;
    /// after it elapses the pass becomes a no-op.
    #[serde(default = "default_balance_window", with = "duration_str")]
    pub balance_window: Duration,

    /// Delay before the first assignment save.
    #[serde(default = "default_persist_delay", with = "duration_str")]
    pub persist_delay: Duration,

    /// Period of assignment saves.
    #[serde(default = "default_persist_period", with = "duration_str")]
    pub persist_period: Duration,
}

impl Default for BalanceConfig {
    fn default() -> Self {
        Self {
            full_rebalance_delay: default_full_rebalance_delay(),
            balance_delay: default_balance_delay(),
            balance_period: default_balance_period(),
            balance_window: default_balance_window(),
            persist_delay: default_persist_delay(),
            persist_period: default_persist_period(),
        }
    }
}

/// Outbound connection pool settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PoolConfig {
    /// Connect timeout for new downstream connections.
    #[serde(default = "default_connect_timeout", with = "duration_str")]
    pub connect_timeout: Duration,

    /// Idle connections retained per host; overflow is dropped.
    #[serde(default = "default_max_idle_per_host")]
    pub max_idle_per_host: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            connect_timeout: default_connect_timeout(),
            max_idle_per_host: default_max_idle_per_host(),
        }
    }
}

/// Relay retry behavior when no pooled client can be obtained.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RelayConfig {
    /// Sleep between early borrow retries.
    #[serde(default = "default_retry_sleep", with = "duration_str")]
    pub retry_sleep: Duration,

    /// Sleep once `retry_sleep_threshold` failures have accumulated.
    #[serde(default = "default_retry_long_sleep", with = "duration_str")]
    pub retry_long_sleep: Duration,

    /// Failure count at which the long sleep kicks in.
    #[serde(default = "default_retry_sleep_threshold")]
    pub retry_sleep_threshold: u32,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            retry_sleep: default_retry_sleep(),
            retry_long_sleep: default_retry_long_sleep(),
            retry_sleep_threshold: default_retry_sleep_threshold(),
        }
    }
}

// Default value functions

fn default_log_level() -> String {
    "info".to_string()
}

fn default_true() -> bool {
    true
}

fn default_metrics_address() -> SocketAddr {
    "127.0.0.1:9090".parse().unwrap()
}

fn default_metrics_path() -> String {
    "/metrics".to_string()
}

fn default_health_interval() -> Duration {
    Duration::from_secs(10)
}

fn default_health_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_unhealthy_threshold() -> u32 {
    3
}

fn default_healthy_threshold() -> u32 {
    2
}

fn default_full_rebalance_delay() -> Duration {
    Duration::from_secs(5 * 60)
}

fn default_balance_delay() -> Duration {
    Duration::from_secs(10 * 60)
}

fn default_balance_period() -> Duration {
    Duration::from_secs(2 * 60)
}

fn default_balance_window() -> Duration {
    Duration::from_secs(30 * 60)
}

fn default_persist_delay() -> Duration {
    Duration::from_secs(10 * 60)
}

fn default_persist_period() -> Duration {
    Duration::from_secs(60 * 60)
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_max_idle_per_host() -> usize {
    4
}

fn default_retry_sleep() -> Duration {
    Duration::from_millis(500)
}

fn default_retry_long_sleep() -> Duration {
    Duration::from_secs(60)
}

fn default_retry_sleep_threshold() -> u32 {
    10
}

/// Serde adapter mapping durations to humantime strings ("2m", "500ms").
mod duration_str {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.collect_str(&humantime::format_duration(*duration))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let text = String::deserialize(deserializer)?;
        humantime::parse_duration(&text).map_err(serde::de::Error::custom)
    }
}
