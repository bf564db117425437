//! The outbound connection pool.
//!
//! Keeps idle connections per downstream host and dials new ones on demand.
//! Callers follow a strict borrow/return discipline keyed by host: every
//! borrowed client is handed back through [`ClientPool::put_back`], where
//! poisoned or surplus connections are closed.

use crate::backend::{BalancedHost, HostKey};
use crate::config::PoolConfig;
use crate::metrics::MetricsCollector;
use crate::relay::TcpClient;
use dashmap::DashMap;
use std::io;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, warn};

/// Pool borrow failure.
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("failed to connect to {host}: {source}")]
    Connect {
        host: String,
        #[source]
        source: io::Error,
    },

    #[error("connection to {0} timed out")]
    ConnectTimeout(String),
}

/// Idle connections keyed by downstream host.
pub struct ClientPool {
    idle: DashMap<HostKey, Vec<TcpClient>>,
    config: PoolConfig,
    metrics: MetricsCollector,
}

impl ClientPool {
    pub fn new(config: PoolConfig, metrics: MetricsCollector) -> Self {
        Self {
            idle: DashMap::new(),
            config,
            metrics,
        }
    }

    /// Pop an idle client for `host`, or dial a new connection.
    pub async fn borrow(&self, host: &BalancedHost) -> Result<TcpClient, PoolError> {
        let key = host.key();
        if let Some(mut idle) = self.idle.get_mut(&key) {
            if let Some(client) = idle.pop() {
                self.metrics.connection_reused(&key.to_string());
                return Ok(client);
            }
        }

        // No map entry is held across the dial.
        let address = (host.host().to_string(), host.tcp_port());
        let stream = match timeout(self.config.connect_timeout, TcpStream::connect(address)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(source)) => {
                return Err(PoolError::Connect {
                    host: key.to_string(),
                    source,
                })
            }
            Err(_) => return Err(PoolError::ConnectTimeout(key.to_string())),
        };

        if let Err(error) = stream.set_nodelay(true) {
            warn!(%error, host = %key, "failed to set TCP_NODELAY on pooled connection");
        }

        self.metrics.connection_created(&key.to_string());
        debug!(host = %key, "dialed new pooled connection");
        Ok(TcpClient::new(stream))
    }

    /// Return a borrowed client to `host`'s idle list.
    ///
    /// Poisoned clients and clients beyond the idle cap are dropped, which
    /// closes the connection.
    pub fn put_back(&self, host: &BalancedHost, client: TcpClient) {
        if client.is_poisoned() {
            debug!(host = %host, "closing poisoned pooled connection");
            return;
        }
        let mut idle = self.idle.entry(host.key()).or_default();
        if idle.len() < self.config.max_idle_per_host {
            idle.push(client);
        }
    }

    /// Idle connections currently held for `host`.
    pub fn idle_count(&self, host: &BalancedHost) -> usize {
        self.idle.get(&host.key()).map(|idle| idle.len()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::net::TcpListener;

    fn pool() -> ClientPool {
        ClientPool::new(
            PoolConfig {
                connect_timeout: Duration::from_secs(5),
                max_idle_per_host: 2,
            },
            MetricsCollector::new(),
        )
    }

    async fn sink() -> (TcpListener, BalancedHost) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let host = BalancedHost::new("127.0.0.1", port);
        (listener, host)
    }

    #[tokio::test]
    async fn test_borrow_dials_and_put_back_idles() {
        let (listener, host) = sink().await;
        tokio::spawn(async move {
            loop {
                let _ = listener.accept().await;
            }
        });

        let pool = pool();
        assert_eq!(pool.idle_count(&host), 0);

        let client = pool.borrow(&host).await.unwrap();
        pool.put_back(&host, client);
        assert_eq!(pool.idle_count(&host), 1);

        // The idled connection is reused, not redialed.
        let client = pool.borrow(&host).await.unwrap();
        assert_eq!(pool.idle_count(&host), 0);
        pool.put_back(&host, client);
    }

    #[tokio::test]
    async fn test_idle_cap_drops_overflow() {
        let (listener, host) = sink().await;
        tokio::spawn(async move {
            loop {
                let _ = listener.accept().await;
            }
        });

        let pool = pool();
        let a = pool.borrow(&host).await.unwrap();
        let b = pool.borrow(&host).await.unwrap();
        let c = pool.borrow(&host).await.unwrap();

        pool.put_back(&host, a);
        pool.put_back(&host, b);
        pool.put_back(&host, c);

        // max_idle_per_host is 2; the third connection was closed.
        assert_eq!(pool.idle_count(&host), 2);
    }

    #[tokio::test]
    async fn test_borrow_refused() {
        let host = BalancedHost::new("127.0.0.1", 1);
        let pool = pool();

        match pool.borrow(&host).await {
            Err(PoolError::Connect { .. }) => {}
            other => panic!("expected connect error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_borrow_timeout() {
        // Non-routable address.
        let host = BalancedHost::new("10.255.255.1", 12345);
        let pool = ClientPool::new(
            PoolConfig {
                connect_timeout: Duration::from_millis(100),
                max_idle_per_host: 2,
            },
            MetricsCollector::new(),
        );

        match pool.borrow(&host).await {
            Err(PoolError::ConnectTimeout(_)) => {}
            other => panic!("expected timeout error, got {other:?}"),
        }
    }
}
