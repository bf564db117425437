//! Per-request forwarding.
//!
//! Binds an inbound request to a `(host, pooled client)` pair, writes one
//! line downstream, and hands the client back to the pool on every exit
//! path. When no client can be obtained the handler retries forever with an
//! escalating sleep; stalling the upstream is preferred over dropping data.

use crate::backend::BalancedHost;
use crate::config::RelayConfig;
use crate::metrics::MetricsCollector;
use crate::relay::{ClientPool, TcpClient, TcpRequest};
use crate::resolver::BalancedResolver;
use std::io;
use std::sync::Arc;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::sync::broadcast;
use tracing::{debug, error, warn};

/// Prefix of the error line reported back to the upstream caller.
const ERR_PREFIX: &str = "Error storing put metric: ";

/// Relay failure after a host was bound.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("{0}")]
    Forward(#[from] io::Error),

    #[error("shutting down")]
    Shutdown,
}

/// Forwards parsed requests over pooled downstream connections.
pub struct RelayHandler {
    resolver: Arc<BalancedResolver>,
    pool: Arc<ClientPool>,
    config: RelayConfig,
    metrics: MetricsCollector,
}

impl RelayHandler {
    pub fn new(
        resolver: Arc<BalancedResolver>,
        pool: Arc<ClientPool>,
        config: RelayConfig,
        metrics: MetricsCollector,
    ) -> Self {
        Self {
            resolver,
            pool,
            config,
            metrics,
        }
    }

    /// Handle one parsed request. Failures after a host was bound are
    /// reported back to the upstream caller as an error line.
    pub async fn relay<W>(
        &self,
        request: TcpRequest,
        upstream: &mut W,
        shutdown: &mut broadcast::Receiver<()>,
    ) where
        W: tokio::io::AsyncWrite + Unpin,
    {
        let (metric, line) = match &request {
            TcpRequest::Put { metric, line } => (Some(metric.as_str()), line.as_str()),
            TcpRequest::Version => (None, "version"),
        };
        let ingest = matches!(request, TcpRequest::Put { .. });

        match self.forward(metric, line, ingest, shutdown).await {
            Ok(()) => {}
            Err(RelayError::Shutdown) => debug!("relay cancelled by shutdown"),
            Err(failure) => {
                error!(error = %failure, metric = metric.unwrap_or(""), "relay failed");
                let message = format!("{ERR_PREFIX}{failure}\n");
                match upstream.write_all(message.as_bytes()).await {
                    Ok(()) => {
                        let _ = upstream.flush().await;
                    }
                    Err(error) => error!(%error, "failed to write error response upstream"),
                }
            }
        }
    }

    async fn forward(
        &self,
        metric: Option<&str>,
        line: &str,
        ingest: bool,
        shutdown: &mut broadcast::Receiver<()>,
    ) -> Result<(), RelayError> {
        let (host, mut client) = self.acquire(metric, ingest, shutdown).await?;
        let label = host.key().to_string();

        let written = async {
            client.write_line(line).await?;
            client.flush().await
        }
        .await;

        // Strict borrow/return pairing: the client goes back whether the
        // write succeeded or not.
        self.pool.put_back(&host, client);

        match written {
            Ok(()) => {
                self.metrics.line_relayed(&label);
                Ok(())
            }
            Err(error) => {
                self.metrics.relay_error(&label);
                Err(error.into())
            }
        }
    }

    /// Resolve a host and borrow a client, retrying without bound.
    ///
    /// Each attempt re-resolves the host, so a recovered backend or a
    /// substituted pin is picked up mid-retry. Sleeps `retry_sleep` per
    /// failure, escalating to `retry_long_sleep` once
    /// `retry_sleep_threshold` failures accumulate; the sleep is the
    /// cancellation point.
    async fn acquire(
        &self,
        metric: Option<&str>,
        ingest: bool,
        shutdown: &mut broadcast::Receiver<()>,
    ) -> Result<(Arc<BalancedHost>, TcpClient), RelayError> {
        let mut failures = 0u32;
        loop {
            let host = if ingest {
                self.resolver.host_for_ingest(metric.unwrap_or(""))
            } else {
                self.resolver.host_for_query(metric)
            };

            match host {
                Some(host) => match self.pool.borrow(&host).await {
                    Ok(client) => return Ok((host, client)),
                    Err(error) => warn!(%error, host = %host, "pool borrow failed"),
                },
                None => warn!("no downstream host is up"),
            }

            failures += 1;
            self.metrics.borrow_failure();
            let sleep = if failures < self.config.retry_sleep_threshold {
                self.config.retry_sleep
            } else {
                self.config.retry_long_sleep
            };
            tokio::select! {
                _ = tokio::time::sleep(sleep) => {}
                _ = shutdown.recv() => return Err(RelayError::Shutdown),
            }
        }
    }
}
