//! Health probing of downstream hosts.

mod checker;

pub use checker::HealthChecker;
