//! Configuration loading and validation.

mod loader;
mod types;
mod validation;

pub use loader::{load_config, ConfigError};
pub use types::{
    BalanceConfig, Config, GlobalConfig, HealthCheckConfig, HostConfig, LogFormat, MetricsConfig,
    PoolConfig, RelayConfig,
};
pub use validation::validate_config;
