//! The inbound listener.
//!
//! Accepts client connections, frames them into newline-terminated request
//! lines, and feeds each parsed request to the relay. Unparseable lines are
//! answered with an error line; the connection stays open.

use crate::relay::{parse_line, RelayHandler};
use crate::util::ShutdownSignal;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn};

/// Process-wide connection counter used for log correlation.
static CONN_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Accepts ingest connections and dispatches request lines to the relay.
pub struct RelayListener {
    listener: TcpListener,
    handler: Arc<RelayHandler>,
    shutdown: ShutdownSignal,
}

impl RelayListener {
    pub async fn bind(
        listen: SocketAddr,
        handler: Arc<RelayHandler>,
        shutdown: ShutdownSignal,
    ) -> std::io::Result<Self> {
        let listener = TcpListener::bind(listen).await?;
        info!(listen = %listen, "relay listener bound");
        Ok(Self {
            listener,
            handler,
            shutdown,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept connections until shutdown.
    pub async fn run(self) {
        info!("relay listener starting");
        let mut shutdown = self.shutdown.subscribe();
        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => self.handle_connection(stream, peer),
                        Err(error) => error!(%error, "failed to accept connection"),
                    }
                }
                _ = shutdown.recv() => {
                    info!("relay listener shutting down");
                    break;
                }
            }
        }
    }

    fn handle_connection(&self, stream: TcpStream, peer: SocketAddr) {
        if let Err(error) = stream.set_nodelay(true) {
            warn!(%error, "failed to set TCP_NODELAY on client connection");
        }

        let handler = Arc::clone(&self.handler);
        let conn = CONN_COUNTER.fetch_add(1, Ordering::Relaxed);
        // Two receivers: one ends the read loop, one cancels an in-flight
        // relay at its sleep boundary.
        let mut shutdown_read = self.shutdown.subscribe();
        let mut shutdown_relay = self.shutdown.subscribe();
        debug!(conn, peer = %peer, "connection opened");

        tokio::spawn(async move {
            let (read_half, mut write_half) = stream.into_split();
            let mut reader = BufReader::new(read_half);
            let mut line = String::new();

            loop {
                line.clear();
                tokio::select! {
                    read = reader.read_line(&mut line) => {
                        match read {
                            Ok(0) => break,
                            Ok(_) => match parse_line(&line) {
                                Ok(request) => {
                                    handler.relay(request, &mut write_half, &mut shutdown_relay).await;
                                }
                                Err(parse_error) => {
                                    debug!(conn, error = %parse_error, "unparseable request line");
                                    let message =
                                        format!("Error storing put metric: {parse_error}\n");
                                    if write_half.write_all(message.as_bytes()).await.is_err() {
                                        break;
                                    }
                                }
                            },
                            Err(error) => {
                                debug!(conn, %error, "connection read failed");
                                break;
                            }
                        }
                    }
                    _ = shutdown_read.recv() => break,
                }
            }
            debug!(conn, peer = %peer, "connection closed");
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::BalancedHost;
    use crate::config::{BalanceConfig, PoolConfig, RelayConfig};
    use crate::metrics::MetricsCollector;
    use crate::relay::ClientPool;
    use crate::resolver::BalancedResolver;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_listener_binds_on_ephemeral_port() {
        let dir = TempDir::new().unwrap();
        let metrics = MetricsCollector::new();
        let resolver = Arc::new(BalancedResolver::new(
            vec![Arc::new(BalancedHost::new("127.0.0.1", 4243))],
            dir.path().join("assignments.csv"),
            BalanceConfig::default(),
            metrics.clone(),
        ));
        let pool = Arc::new(ClientPool::new(PoolConfig::default(), metrics.clone()));
        let handler = Arc::new(RelayHandler::new(
            resolver,
            pool,
            RelayConfig::default(),
            metrics,
        ));

        let listener = RelayListener::bind(
            "127.0.0.1:0".parse().unwrap(),
            handler,
            ShutdownSignal::new(),
        )
        .await
        .unwrap();
        assert_ne!(listener.local_addr().unwrap().port(), 0);
    }
}
