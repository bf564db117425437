//! Configuration validation.

use crate::config::Config;
use std::collections::HashSet;

/// Validate the configuration.
///
/// Checks for:
/// - at least one downstream host, each with a usable port
/// - no duplicate `(host, tcp_port)` pairs
/// - a non-empty assignment file path
/// - sane health-check thresholds
/// - a known log level
///
/// All problems are collected and reported together.
pub fn validate_config(config: &Config) -> Result<(), String> {
    let mut errors = Vec::new();

    if config.hosts.is_empty() {
        errors.push("at least one downstream host must be defined".to_string());
    }

    let mut seen = HashSet::new();
    for host in &config.hosts {
        if host.host.is_empty() {
            errors.push("host name cannot be empty".to_string());
        }

        if host.tcp_port == 0 {
            errors.push(format!("host '{}' has tcp_port 0", host.host));
        }

        if !seen.insert((host.host.as_str(), host.tcp_port)) {
            errors.push(format!(
                "duplicate host entry: {}:{}",
                host.host, host.tcp_port
            ));
        }
    }

    if config.assignment_file.as_os_str().is_empty() {
        errors.push("assignment_file cannot be empty".to_string());
    }

    if config.health_check.unhealthy_threshold == 0 {
        errors.push("health_check.unhealthy_threshold must be >= 1".to_string());
    }

    if config.health_check.healthy_threshold == 0 {
        errors.push("health_check.healthy_threshold must be >= 1".to_string());
    }

    if config.pool.max_idle_per_host == 0 {
        errors.push("pool.max_idle_per_host must be >= 1".to_string());
    }

    let valid_levels = ["trace", "debug", "info", "warn", "error"];
    if !valid_levels.contains(&config.global.log_level.to_lowercase().as_str()) {
        errors.push(format!(
            "invalid log level '{}', must be one of: {}",
            config.global.log_level,
            valid_levels.join(", ")
        ));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors.join("; "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{
        BalanceConfig, GlobalConfig, HealthCheckConfig, HostConfig, PoolConfig, RelayConfig,
    };

    fn minimal_config() -> Config {
        Config {
            global: GlobalConfig::default(),
            listen: "127.0.0.1:4242".parse().unwrap(),
            assignment_file: "/tmp/metlb-assignments.csv".into(),
            hosts: vec![
                HostConfig {
                    host: "ingest-1".to_string(),
                    tcp_port: 4243,
                },
                HostConfig {
                    host: "ingest-2".to_string(),
                    tcp_port: 4243,
                },
            ],
            health_check: HealthCheckConfig::default(),
            balance: BalanceConfig::default(),
            pool: PoolConfig::default(),
            relay: RelayConfig::default(),
        }
    }

    #[test]
    fn test_valid_config() {
        assert!(validate_config(&minimal_config()).is_ok());
    }

    #[test]
    fn test_no_hosts() {
        let mut config = minimal_config();
        config.hosts.clear();
        let result = validate_config(&config);
        assert!(result.unwrap_err().contains("at least one downstream host"));
    }

    #[test]
    fn test_duplicate_hosts() {
        let mut config = minimal_config();
        config.hosts.push(HostConfig {
            host: "ingest-1".to_string(),
            tcp_port: 4243,
        });
        let result = validate_config(&config);
        assert!(result.unwrap_err().contains("duplicate host entry"));
    }

    #[test]
    fn test_zero_port() {
        let mut config = minimal_config();
        config.hosts[0].tcp_port = 0;
        let result = validate_config(&config);
        assert!(result.unwrap_err().contains("tcp_port 0"));
    }

    #[test]
    fn test_empty_assignment_file() {
        let mut config = minimal_config();
        config.assignment_file = "".into();
        let result = validate_config(&config);
        assert!(result.unwrap_err().contains("assignment_file"));
    }

    #[test]
    fn test_invalid_log_level() {
        let mut config = minimal_config();
        config.global.log_level = "loud".to_string();
        let result = validate_config(&config);
        assert!(result.unwrap_err().contains("invalid log level"));
    }

    #[test]
    fn test_errors_are_aggregated() {
        let mut config = minimal_config();
        config.hosts.clear();
        config.global.log_level = "loud".to_string();
        let message = validate_config(&config).unwrap_err();
        assert!(message.contains("at least one downstream host"));
        assert!(message.contains("invalid log level"));
    }
}
