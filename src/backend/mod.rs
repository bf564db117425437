//! Downstream metric-ingest servers.

mod host;

pub use host::{BalancedHost, HostKey};
