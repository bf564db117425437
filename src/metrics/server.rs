//! Prometheus metrics HTTP server.

use crate::metrics::MetricsCollector;
use bytes::Bytes;
use http_body_util::Full;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use prometheus_client::encoding::text::encode;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tracing::{debug, error, info};

/// Serves the prometheus registry over HTTP.
pub struct MetricsServer {
    address: SocketAddr,
    path: String,
    collector: MetricsCollector,
}

impl MetricsServer {
    pub fn new(address: SocketAddr, path: String, collector: MetricsCollector) -> Self {
        Self {
            address,
            path,
            collector,
        }
    }

    /// Run the metrics server until shutdown.
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        let listener = match TcpListener::bind(self.address).await {
            Ok(listener) => listener,
            Err(error) => {
                error!(%error, address = %self.address, "failed to bind metrics server");
                return;
            }
        };

        info!(address = %self.address, path = %self.path, "metrics server started");

        let collector = Arc::new(self.collector);
        let path = Arc::new(self.path);

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, _addr) = match accepted {
                        Ok(pair) => pair,
                        Err(error) => {
                            error!(%error, "failed to accept metrics connection");
                            continue;
                        }
                    };

                    let collector = Arc::clone(&collector);
                    let path = Arc::clone(&path);
                    tokio::spawn(async move {
                        let service = service_fn(move |req| {
                            let collector = Arc::clone(&collector);
                            let path = Arc::clone(&path);
                            async move { handle_request(req, &collector, &path) }
                        });

                        if let Err(error) = http1::Builder::new()
                            .serve_connection(TokioIo::new(stream), service)
                            .await
                        {
                            debug!(%error, "metrics connection error");
                        }
                    });
                }

                _ = shutdown.recv() => {
                    info!("metrics server shutting down");
                    break;
                }
            }
        }
    }
}

fn handle_request(
    req: Request<hyper::body::Incoming>,
    collector: &MetricsCollector,
    metrics_path: &str,
) -> Result<Response<Full<Bytes>>, Infallible> {
    if req.method() != Method::GET {
        return Ok(plain(StatusCode::METHOD_NOT_ALLOWED, "Method not allowed\n"));
    }

    match req.uri().path() {
        path if path == metrics_path => {
            let mut buffer = String::new();
            if let Err(error) = encode(&mut buffer, collector.registry()) {
                error!(%error, "failed to encode metrics");
                return Ok(plain(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Failed to encode metrics\n",
                ));
            }
            Ok(Response::builder()
                .status(StatusCode::OK)
                .header("content-type", "text/plain; version=0.0.4; charset=utf-8")
                .body(Full::new(Bytes::from(buffer)))
                .unwrap())
        }
        "/health" | "/healthz" => Ok(plain(StatusCode::OK, "OK\n")),
        _ => Ok(plain(StatusCode::NOT_FOUND, "Not found\n")),
    }
}

fn plain(status: StatusCode, body: &'static str) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .body(Full::new(Bytes::from(body)))
        .unwrap()
}
